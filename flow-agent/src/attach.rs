//! Cgroup attachment registry.
//!
//! Tracks which workloads currently have the ingress/egress packet programs
//! attached to their cgroup. Attach is idempotent per workload name, and a
//! failed egress attach rolls the ingress attach back so the kernel never
//! ends up with a half-attached workload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{AttachStage, Error};

/// Kernel-facing attach surface.
///
/// Implemented by the real program loader and by a counting mock in tests.
pub trait CgroupPrograms {
    type Link;

    fn attach(&mut self, stage: AttachStage, cgroup: &Path) -> Result<Self::Link, Error>;
    fn detach(&mut self, stage: AttachStage, link: Self::Link) -> Result<(), Error>;
}

struct Entry<L> {
    ingress: L,
    egress: L,
}

/// Registry of live attachments, keyed by workload name.
///
/// An entry exists iff the kernel currently has both programs attached to
/// that workload's cgroup.
pub struct AttachRegistry<P: CgroupPrograms> {
    programs: P,
    entries: HashMap<String, Entry<P::Link>>,
}

impl<P: CgroupPrograms> AttachRegistry<P> {
    pub fn new(programs: P) -> Self {
        Self {
            programs,
            entries: HashMap::new(),
        }
    }

    /// Attach both programs to the workload's cgroup.
    ///
    /// Returns success without side effects when the name is already
    /// registered.
    pub fn attach(&mut self, name: &str, path: &Path) -> Result<(), Error> {
        if self.entries.contains_key(name) {
            return Ok(());
        }

        let ingress = self
            .programs
            .attach(AttachStage::Ingress, path)
            .map_err(|source| Error::AttachFailed {
                name: name.to_string(),
                path: PathBuf::from(path),
                stage: AttachStage::Ingress,
                source: Box::new(source),
            })?;

        let egress = match self.programs.attach(AttachStage::Egress, path) {
            Ok(link) => link,
            Err(source) => {
                // Roll the first attach back; a workload is either fully
                // attached or not attached at all.
                if let Err(err) = self.programs.detach(AttachStage::Ingress, ingress) {
                    warn!("rollback ingress for {name}: {err}");
                }
                return Err(Error::AttachFailed {
                    name: name.to_string(),
                    path: PathBuf::from(path),
                    stage: AttachStage::Egress,
                    source: Box::new(source),
                });
            }
        };

        self.entries
            .insert(name.to_string(), Entry { ingress, egress });
        Ok(())
    }

    /// Detach both programs for the workload.
    ///
    /// A no-op when the name is not registered. Individual link errors are
    /// aggregated; the entry is removed regardless.
    pub fn detach(&mut self, name: &str) -> Result<(), Error> {
        let Some(entry) = self.entries.remove(name) else {
            return Ok(());
        };

        let mut errors = Vec::new();
        if let Err(err) = self.programs.detach(AttachStage::Ingress, entry.ingress) {
            errors.push(err);
        }
        if let Err(err) = self.programs.detach(AttachStage::Egress, entry.egress) {
            errors.push(err);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::DetachFailed {
                name: name.to_string(),
                errors,
            })
        }
    }

    /// Detach every registered workload, aggregating errors.
    pub fn close(&mut self) -> Result<(), Error> {
        let names: Vec<String> = self.entries.keys().cloned().collect();
        let mut errors = Vec::new();
        for name in names {
            if let Err(err) = self.detach(&name) {
                errors.push(err);
            }
        }
        Error::aggregate(errors)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

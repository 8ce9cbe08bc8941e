//! Error kinds for the agent.
//!
//! Startup errors (load, missing objects, cache sync) are fatal and bubble
//! out of `main`. Errors raised on callback paths (attach, detach, malformed
//! container ids) are logged by the caller and must never take the agent
//! down.

use std::path::PathBuf;

use thiserror::Error;

/// Attachment stage that failed, for `Error::AttachFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStage {
    Ingress,
    Egress,
}

impl std::fmt::Display for AttachStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachStage::Ingress => f.write_str("ingress"),
            AttachStage::Egress => f.write_str("egress"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The kernel object could not be parsed or loaded.
    #[error("unable to load packet object: {0}")]
    Load(#[from] aya::BpfError),

    #[error("program {name:?} not found in packet object")]
    ProgramMissing { name: &'static str },

    #[error("map {name:?} not found in packet object")]
    MapMissing { name: &'static str },

    #[error("unable to read packet object from {path:?}: {source}")]
    ObjectRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to open cgroup {path:?}: {source}")]
    CgroupOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("attach {stage} for {name} on path {path:?}: {source}")]
    AttachFailed {
        name: String,
        path: PathBuf,
        stage: AttachStage,
        source: Box<Error>,
    },

    #[error("detach {name}: {}", join_display(.errors))]
    DetachFailed { name: String, errors: Vec<Error> },

    #[error("could not sync object caches for {kind:?}")]
    CacheSyncFailed { kind: &'static str },

    #[error("malformed container id {id:?}")]
    MalformedContainerId { id: String },

    #[error("cgroup filesystem: {0}")]
    CgroupFs(String),

    #[error(transparent)]
    Program(#[from] aya::programs::ProgramError),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error("perf ring: {0}")]
    Ring(#[from] aya::maps::perf::PerfBufferError),

    #[error("unable to enumerate online cpus: {0}")]
    OnlineCpus(std::io::Error),

    /// Errors collected from best-effort teardown.
    #[error("{}", join_display(.0))]
    Aggregate(Vec<Error>),
}

fn join_display(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Collapse a list of teardown errors into zero, one, or an aggregate.
    pub fn aggregate(mut errors: Vec<Error>) -> Result<(), Error> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }
}

//! Kernel packet-program loader.
//!
//! Loads the opaque object image compiled out-of-band, resolves the two
//! cgroup skb programs and the packet ring map into typed handles, and owns
//! the resulting kernel objects until drop.

use std::fs;
use std::path::{Path, PathBuf};

use aya::maps::perf::AsyncPerfEventArray;
use aya::maps::MapData;
use aya::programs::cgroup_skb::{CgroupSkb, CgroupSkbAttachType, CgroupSkbLinkId};
use aya::Bpf;
use log::info;

use crate::attach::CgroupPrograms;
use crate::error::{AttachStage, Error};

/// Ingress program name in the packet object.
pub const PROG_INGRESS: &str = "metrics_ingress";
/// Egress program name in the packet object.
pub const PROG_EGRESS: &str = "metrics_egress";
/// Packet ring map name in the packet object.
pub const MAP_PACKETS: &str = "packets";

#[cfg(feature = "embedded")]
const PACKET_OBJECT: &[u8] =
    aya::include_bytes_aligned!(concat!(env!("CARGO_MANIFEST_DIR"), "/../bpf/dist/metrics.o"));

/// Owns the loaded packet object and its typed handles.
///
/// The caller must raise RLIMIT_MEMLOCK before loading; underlying kernel
/// errors are surfaced verbatim.
pub struct PacketPrograms {
    ebpf: Bpf,
    packets: Option<AsyncPerfEventArray<MapData>>,
}

impl PacketPrograms {
    /// Load the packet object and resolve its handles.
    ///
    /// # Arguments
    ///
    /// * `path` - Optional path to the object file. If `None`, uses the
    ///   image embedded at build time.
    ///
    /// # Returns
    ///
    /// The owning collection with the ingress/egress programs loaded and
    /// the packet ring resolved.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        match path {
            Some(obj_path) => {
                info!("loading packet object from {}", obj_path.display());
                let data = fs::read(obj_path).map_err(|source| Error::ObjectRead {
                    path: PathBuf::from(obj_path),
                    source,
                })?;
                Self::load_bytes(&data)
            }
            None => {
                #[cfg(feature = "embedded")]
                {
                    info!("loading embedded packet object");
                    Self::load_bytes(PACKET_OBJECT)
                }
                #[cfg(not(feature = "embedded"))]
                {
                    Err(Error::ObjectRead {
                        path: PathBuf::from("<embedded>"),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "no packet object given and none embedded at build",
                        ),
                    })
                }
            }
        }
    }

    /// Load the packet object from an in-memory image and resolve the
    /// required handles.
    pub fn load_bytes(data: &[u8]) -> Result<Self, Error> {
        let mut ebpf = Bpf::load(data)?;

        for name in [PROG_INGRESS, PROG_EGRESS] {
            let program: &mut CgroupSkb = ebpf
                .program_mut(name)
                .ok_or(Error::ProgramMissing { name })?
                .try_into()?;
            program.load()?;
        }

        let packets = ebpf
            .take_map(MAP_PACKETS)
            .ok_or(Error::MapMissing { name: MAP_PACKETS })?;
        let packets = AsyncPerfEventArray::try_from(packets)?;

        info!("packet object loaded");

        Ok(Self {
            ebpf,
            packets: Some(packets),
        })
    }

    /// Hand the packet ring map to the consumer. Returns `None` after the
    /// first call.
    pub fn take_packets(&mut self) -> Option<AsyncPerfEventArray<MapData>> {
        self.packets.take()
    }

    fn program_mut(&mut self, stage: AttachStage) -> Result<&mut CgroupSkb, Error> {
        let name = match stage {
            AttachStage::Ingress => PROG_INGRESS,
            AttachStage::Egress => PROG_EGRESS,
        };
        let program: &mut CgroupSkb = self
            .ebpf
            .program_mut(name)
            .ok_or(Error::ProgramMissing { name })?
            .try_into()?;
        Ok(program)
    }
}

impl CgroupPrograms for PacketPrograms {
    type Link = CgroupSkbLinkId;

    fn attach(&mut self, stage: AttachStage, cgroup: &Path) -> Result<Self::Link, Error> {
        let file = fs::File::open(cgroup).map_err(|source| Error::CgroupOpen {
            path: PathBuf::from(cgroup),
            source,
        })?;
        let attach_type = match stage {
            AttachStage::Ingress => CgroupSkbAttachType::Ingress,
            AttachStage::Egress => CgroupSkbAttachType::Egress,
        };
        let program = self.program_mut(stage)?;
        Ok(program.attach(file, attach_type)?)
    }

    fn detach(&mut self, stage: AttachStage, link: Self::Link) -> Result<(), Error> {
        let program = self.program_mut(stage)?;
        Ok(program.detach(link)?)
    }
}

//! Packet ring consumption.
//!
//! The kernel programs publish one fixed-layout sample per packet into a
//! per-CPU perf ring. One reader task per online CPU decodes samples and
//! forwards them over a bounded channel to the single processing task.
//! Per-CPU order is preserved by the ring, but there is no global order;
//! downstream code must tolerate out-of-order timestamps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aya::maps::perf::AsyncPerfEventArray;
use aya::maps::MapData;
use aya::util::online_cpus;
use bytes::BytesMut;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use zerocopy::FromBytes;

use flow_common::{PacketSample, SAMPLE_SIZE};

use crate::error::Error;

const READ_BUFFERS_PER_CPU: usize = 10;

/// Counters surfaced by the ring readers.
///
/// Lost samples are an observability signal, not an error; the ring is lossy
/// by design and lost counts are never recovered.
#[derive(Debug, Default)]
pub struct RingStats {
    lost: AtomicU64,
    malformed: AtomicU64,
}

impl RingStats {
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// Spawn one reader task per online CPU.
///
/// Each task exits when the ring read fails (shutdown semantics), the sample
/// channel closes, or the shutdown signal fires.
///
/// # Arguments
///
/// * `packets` - The packet ring map taken from the loader.
/// * `samples` - Channel to the single processing task.
/// * `stats` - Shared lost/malformed counters.
/// * `shutdown` - Agent-wide done signal.
pub fn spawn_readers(
    mut packets: AsyncPerfEventArray<MapData>,
    samples: mpsc::Sender<PacketSample>,
    stats: Arc<RingStats>,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>, Error> {
    let cpus = online_cpus().map_err(Error::OnlineCpus)?;
    info!("spawning packet readers for {} cpus", cpus.len());

    let mut handles = Vec::with_capacity(cpus.len());
    for cpu_id in cpus {
        let buf = packets.open(cpu_id, None)?;
        handles.push(tokio::spawn(read_loop(
            cpu_id,
            buf,
            samples.clone(),
            Arc::clone(&stats),
            shutdown.clone(),
        )));
    }

    Ok(handles)
}

async fn read_loop(
    cpu_id: u32,
    mut buf: aya::maps::perf::AsyncPerfEventArrayBuffer<MapData>,
    samples: mpsc::Sender<PacketSample>,
    stats: Arc<RingStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffers = (0..READ_BUFFERS_PER_CPU)
        .map(|_| BytesMut::with_capacity(SAMPLE_SIZE))
        .collect::<Vec<_>>();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("packet reader for cpu {cpu_id} stopped");
                return;
            }
            events = buf.read_events(&mut buffers) => {
                let events = match events {
                    Ok(events) => events,
                    Err(err) => {
                        // A failed read means the ring went away underneath
                        // us; treat it as shutdown.
                        debug!("packet ring read ended on cpu {cpu_id}: {err}");
                        return;
                    }
                };

                if events.lost > 0 {
                    stats.lost.fetch_add(events.lost as u64, Ordering::Relaxed);
                    warn!("lost {} packet samples on cpu {cpu_id}", events.lost);
                }

                for buf in buffers.iter_mut().take(events.read) {
                    match decode_sample(buf) {
                        Some(sample) => {
                            if samples.send(sample).await.is_err() {
                                return;
                            }
                        }
                        None => {
                            stats.malformed.fetch_add(1, Ordering::Relaxed);
                            warn!("dropping malformed packet sample on cpu {cpu_id}");
                        }
                    }
                }
            }
        }
    }
}

/// Reinterpret the leading bytes of a ring record as a packet sample.
///
/// Short records and records without exactly one direction flag are
/// malformed.
fn decode_sample(buf: &[u8]) -> Option<PacketSample> {
    let (sample, _rest) = PacketSample::read_from_prefix(buf).ok()?;
    if !sample.has_valid_direction() {
        return None;
    }
    Some(sample)
}

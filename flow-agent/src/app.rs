//! Agent wiring.
//!
//! Connects the lifecycle stream to the attach registry, the packet ring to
//! the aggregator, and owns the shutdown signal that stops every loop.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::Client;
use log::{info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use flow_common::{PacketSample, FLAG_IN, FLAG_OUT, PROTO_TCP, PROTO_UDP};

use crate::aggregator::{self, Aggregator, Record};
use crate::attach::AttachRegistry;
use crate::error::Error;
use crate::events::{self, RingStats};
use crate::identity::{IdentityConfig, IdentityService, NameIndex};
use crate::lifecycle::{Event, EventKind};
use crate::loader::PacketPrograms;
use crate::sink::MetricSink;

/// Capacity of the sample channel between the ring readers and the
/// processing task.
const SAMPLE_CHANNEL_CAPACITY: usize = 1024;

pub struct AppConfig {
    /// Local node name.
    pub node: String,
    /// The agent's own namespace; ignored along with kube-system.
    pub namespace: String,
    /// Monitor containers instead of pods.
    pub containers: bool,
    /// Root of the cgroupv2 hierarchy.
    pub cgroup_root: String,
    /// Aggregation window.
    pub interval: Duration,
    /// Packet object path; `None` uses the embedded image.
    pub bpf_object: Option<PathBuf>,
}

/// The running agent.
pub struct App {
    registry: Arc<Mutex<AttachRegistry<PacketPrograms>>>,
    shutdown: watch::Sender<bool>,
    stats: Arc<RingStats>,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    /// Construct every component and spawn the processing loops.
    pub async fn start(
        client: Client,
        sink: Arc<dyn MetricSink>,
        config: AppConfig,
    ) -> Result<Self, Error> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut programs = PacketPrograms::load(config.bpf_object.as_deref())?;
        let packets = programs
            .take_packets()
            .expect("packet ring taken before any consumer exists");
        let registry = Arc::new(Mutex::new(AttachRegistry::new(programs)));

        let mut identity = IdentityService::new(
            client,
            IdentityConfig {
                node: config.node.clone(),
                ignore_namespaces: vec!["kube-system".to_string(), config.namespace.clone()],
                cgroup_root: config.cgroup_root.clone(),
                containers: config.containers,
            },
            shutdown_rx.clone(),
        )
        .await?;
        let names = identity.names();
        let lifecycle_rx = identity
            .take_events()
            .expect("lifecycle stream taken before any consumer exists");

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(lifecycle_loop(
            lifecycle_rx,
            Arc::clone(&registry),
            shutdown_rx.clone(),
        )));

        let (samples_tx, samples_rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
        let stats = Arc::new(RingStats::default());
        tasks.extend(events::spawn_readers(
            packets,
            samples_tx,
            Arc::clone(&stats),
            shutdown_rx.clone(),
        )?);

        let aggregator = Arc::new(Aggregator::new());
        tasks.push(tokio::spawn(process_loop(
            samples_rx,
            names,
            Arc::clone(&aggregator),
            shutdown_rx.clone(),
        )));
        tasks.push(aggregator::spawn_ticker(
            aggregator,
            config.interval,
            sink,
            shutdown_rx,
        ));

        info!("agent started on node {}", config.node);

        Ok(Self {
            registry,
            shutdown: shutdown_tx,
            stats,
            tasks,
        })
    }

    /// Signal shutdown, wait for every loop to exit, then tear down the
    /// kernel state. The aggregation window in progress is discarded.
    pub async fn close(self) -> Result<(), Error> {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }

        if self.stats.lost() > 0 || self.stats.malformed() > 0 {
            info!(
                "packet ring totals: {} lost, {} malformed",
                self.stats.lost(),
                self.stats.malformed()
            );
        }

        let result = self
            .registry
            .lock()
            .expect("attach registry poisoned")
            .close();
        info!("agent stopped");
        result
    }
}

/// Drive lifecycle events into the attach registry.
///
/// Attach and detach failures are logged and skipped so one bad cgroup
/// cannot halt the agent.
async fn lifecycle_loop(
    mut events: mpsc::Receiver<Event>,
    registry: Arc<Mutex<AttachRegistry<PacketPrograms>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        let mut registry = registry.lock().expect("attach registry poisoned");
        match event.kind {
            EventKind::Added => {
                info!("attaching {}", event.name);
                if let Err(err) = registry.attach(&event.name, &event.cgroup_path) {
                    warn!("{err}");
                }
            }
            EventKind::Removed => {
                info!("detaching {}", event.name);
                if let Err(err) = registry.detach(&event.name) {
                    warn!("{err}");
                }
            }
        }
    }
}

/// Decorate samples with endpoint identities and feed the aggregator.
async fn process_loop(
    mut samples: mpsc::Receiver<PacketSample>,
    names: NameIndex,
    aggregator: Arc<Aggregator>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let sample = tokio::select! {
            _ = shutdown.changed() => return,
            sample = samples.recv() => match sample {
                Some(sample) => sample,
                None => return,
            },
        };

        match decorate(&sample, &names) {
            Some(record) => aggregator.add(record),
            None => warn!("dropping packet sample with unknown direction"),
        }
    }
}

/// Build a decorated record from a raw sample.
///
/// The subject is the endpoint whose cgroup was hooked: the destination for
/// inbound packets, the source for outbound ones. Returns `None` when the
/// direction flags are invalid.
fn decorate(sample: &PacketSample, names: &NameIndex) -> Option<Record> {
    let direction = sample.flags & (FLAG_IN | FLAG_OUT);
    let (subject_ip, remote_ip, bytes_in, bytes_out) = match direction {
        FLAG_IN => (sample.dest_ip, sample.src_ip, u64::from(sample.len), 0),
        FLAG_OUT => (sample.src_ip, sample.dest_ip, 0, u64::from(sample.len)),
        _ => return None,
    };

    Some(Record {
        timestamp: sample.timestamp,
        subject: names.name(subject_ip),
        remote: names.name(remote_ip),
        port: sample.src_port.min(sample.dest_port),
        protocol: protocol_name(sample.proto).to_string(),
        bytes_in,
        bytes_out,
        rtt_ms: f64::from(sample.rtt) / 1_000_000.0,
    })
}

fn protocol_name(proto: u16) -> &'static str {
    match proto {
        PROTO_UDP => "udp",
        PROTO_TCP => "tcp",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped(a: u8, b: u8, c: u8, d: u8) -> [u8; 16] {
        let mut ip = [0u8; 16];
        ip[10] = 0xff;
        ip[11] = 0xff;
        ip[12..].copy_from_slice(&[a, b, c, d]);
        ip
    }

    fn sample(flags: u16) -> PacketSample {
        PacketSample {
            timestamp: 1,
            src_ip: mapped(10, 0, 0, 2),
            dest_ip: mapped(10, 0, 0, 1),
            src_port: 53124,
            dest_port: 443,
            len: 100,
            rtt: 2_000_000,
            proto: PROTO_TCP,
            flags,
        }
    }

    fn names() -> NameIndex {
        let names = NameIndex::new();
        names.insert("10.0.0.1", "ns/x");
        names.insert("10.0.0.2", "ns/y");
        names
    }

    #[test]
    fn inbound_packets_subject_the_destination() {
        let record = decorate(&sample(FLAG_IN), &names()).unwrap();
        assert_eq!(record.subject, "ns/x");
        assert_eq!(record.remote, "ns/y");
        assert_eq!(record.bytes_in, 100);
        assert_eq!(record.bytes_out, 0);
    }

    #[test]
    fn outbound_packets_subject_the_source() {
        let record = decorate(&sample(FLAG_OUT), &names()).unwrap();
        assert_eq!(record.subject, "ns/y");
        assert_eq!(record.remote, "ns/x");
        assert_eq!(record.bytes_in, 0);
        assert_eq!(record.bytes_out, 100);
    }

    #[test]
    fn port_uses_the_service_side_heuristic() {
        let record = decorate(&sample(FLAG_IN), &names()).unwrap();
        assert_eq!(record.port, 443);
    }

    #[test]
    fn unknown_direction_is_dropped() {
        assert!(decorate(&sample(0), &names()).is_none());
        assert!(decorate(&sample(FLAG_IN | FLAG_OUT), &names()).is_none());
    }

    #[test]
    fn unknown_endpoints_fall_back_to_ip_strings() {
        let record = decorate(&sample(FLAG_IN), &NameIndex::new()).unwrap();
        assert_eq!(record.subject, "10.0.0.1");
        assert_eq!(record.remote, "10.0.0.2");
    }

    #[test]
    fn rtt_converts_to_milliseconds() {
        let record = decorate(&sample(FLAG_IN), &names()).unwrap();
        assert!((record.rtt_ms - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn protocol_names() {
        assert_eq!(protocol_name(PROTO_UDP), "udp");
        assert_eq!(protocol_name(PROTO_TCP), "tcp");
        assert_eq!(protocol_name(7), "");
    }
}

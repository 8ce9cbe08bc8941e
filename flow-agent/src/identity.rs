//! Endpoint identity resolution.
//!
//! Watches pods and services cluster-wide, keeps a 16-byte-IP to name index
//! for decorating packet records, and emits lifecycle events for the pods
//! scheduled on the local node. The watchers are the shared-informer analog:
//! each kind gets its own stream, folded against a uid-keyed store so apply
//! events split into add/update semantics, with a one-time sync barrier.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::Api;
use kube::runtime::watcher;
use kube::Client;
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::Error;
use crate::lifecycle::{Event, EventFactory};

/// Deadline for the initial cache sync of each watched kind.
const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle channel capacity; the producer blocks when full.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Shared IP to workload-name index.
///
/// Readers are concurrent with writers; writers serialize on the lock.
#[derive(Clone, Default)]
pub struct NameIndex {
    names: Arc<RwLock<HashMap<[u8; 16], String>>>,
}

impl NameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `ip -> name`. Empty or unparseable IPs are ignored.
    pub fn insert(&self, ip: &str, name: &str) {
        let Some(key) = ip_to_bytes(ip) else {
            return;
        };
        self.names
            .write()
            .expect("name index poisoned")
            .insert(key, name.to_string());
    }

    /// Drop the mapping for `ip`, if any.
    pub fn remove(&self, ip: &str) {
        let Some(key) = ip_to_bytes(ip) else {
            return;
        };
        self.names.write().expect("name index poisoned").remove(&key);
    }

    /// Resolve an IP to a workload name, falling back to the IP's display
    /// form when unknown.
    pub fn name(&self, ip: [u8; 16]) -> String {
        if let Some(name) = self.names.read().expect("name index poisoned").get(&ip) {
            return name.clone();
        }
        format_ip(ip)
    }

    pub fn len(&self) -> usize {
        self.names.read().expect("name index poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn ip_to_bytes(v: &str) -> Option<[u8; 16]> {
    if v.is_empty() {
        return None;
    }
    match v.parse::<IpAddr>().ok()? {
        IpAddr::V4(ip) => Some(ip.to_ipv6_mapped().octets()),
        IpAddr::V6(ip) => Some(ip.octets()),
    }
}

fn format_ip(ip: [u8; 16]) -> String {
    let v6 = Ipv6Addr::from(ip);
    match v6.to_ipv4_mapped() {
        Some(v4) => v4.to_string(),
        None => v6.to_string(),
    }
}

/// Identity service configuration.
pub struct IdentityConfig {
    /// Local node name; only pods scheduled here produce lifecycle events.
    pub node: String,
    /// Namespaces whose pods never produce lifecycle events.
    pub ignore_namespaces: Vec<String>,
    /// Root of the cgroupv2 hierarchy for event paths.
    pub cgroup_root: String,
    /// Emit per-container events instead of per-pod events.
    pub containers: bool,
}

/// Watches orchestrator state and resolves endpoint identities.
pub struct IdentityService {
    names: NameIndex,
    events: Option<mpsc::Receiver<Event>>,
}

impl IdentityService {
    /// Start the pod and service watchers and wait for both caches to sync.
    ///
    /// Fails with `CacheSyncFailed` when either kind has not completed its
    /// initial list within the sync deadline.
    pub async fn new(
        client: Client,
        config: IdentityConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, Error> {
        let names = NameIndex::new();
        let factory = Arc::new(EventFactory::new(
            config.cgroup_root.clone(),
            config.containers,
        ));
        let filter = EmitFilter {
            node: config.node,
            ignore_namespaces: config.ignore_namespaces,
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (pods_synced_tx, pods_synced_rx) = oneshot::channel();
        let (services_synced_tx, services_synced_rx) = oneshot::channel();

        let pods: Api<Pod> = Api::all(client.clone());
        tokio::spawn(watch_pods(
            pods,
            names.clone(),
            factory,
            filter,
            events_tx,
            pods_synced_tx,
            shutdown.clone(),
        ));

        let services: Api<Service> = Api::all(client);
        tokio::spawn(watch_services(
            services,
            names.clone(),
            services_synced_tx,
            shutdown,
        ));

        debug!("waiting for object caches to sync");
        await_sync(pods_synced_rx, "pods").await?;
        await_sync(services_synced_rx, "services").await?;
        debug!("object caches synced");

        Ok(Self {
            names,
            events: Some(events_rx),
        })
    }

    /// The shared IP index, for decorating packet records.
    pub fn names(&self) -> NameIndex {
        self.names.clone()
    }

    /// Hand the lifecycle event stream to the consumer. Returns `None` after
    /// the first call.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.events.take()
    }
}

async fn await_sync(synced: oneshot::Receiver<()>, kind: &'static str) -> Result<(), Error> {
    match tokio::time::timeout(SYNC_TIMEOUT, synced).await {
        Ok(Ok(())) => Ok(()),
        // Timed out, or the watcher task went away before syncing.
        _ => Err(Error::CacheSyncFailed { kind }),
    }
}

/// Decides which pods produce lifecycle events.
#[derive(Clone)]
struct EmitFilter {
    node: String,
    ignore_namespaces: Vec<String>,
}

impl EmitFilter {
    fn should_emit(&self, pod: &Pod) -> bool {
        let on_node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .map(|n| n == self.node)
            .unwrap_or(false);
        if !on_node {
            return false;
        }
        match pod.metadata.namespace.as_deref() {
            Some(ns) => !self.ignore_namespaces.iter().any(|ignored| ignored == ns),
            None => false,
        }
    }
}

async fn watch_pods(
    api: Api<Pod>,
    names: NameIndex,
    factory: Arc<EventFactory>,
    filter: EmitFilter,
    events: mpsc::Sender<Event>,
    synced: oneshot::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let stream = watcher::watcher(api, watcher::Config::default());
    tokio::pin!(stream);

    let mut store: HashMap<String, Pod> = HashMap::new();
    let mut synced = Some(synced);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    on_pod_event(event, &mut store, &names, &factory, &filter, &events, &mut synced)
                        .await;
                }
                Some(Err(err)) => warn!("pod watch error: {err}"),
                None => return,
            },
        }
    }
}

/// Fold one pod watch event into the store, the name index, and the
/// lifecycle stream.
async fn on_pod_event(
    event: watcher::Event<Pod>,
    store: &mut HashMap<String, Pod>,
    names: &NameIndex,
    factory: &EventFactory,
    filter: &EmitFilter,
    events: &mpsc::Sender<Event>,
    synced: &mut Option<oneshot::Sender<()>>,
) {
    match event {
        watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
            let Some(uid) = pod.metadata.uid.clone() else {
                return;
            };
            let name = pod_display_name(&pod);
            let new_ip = pod_ip(&pod);

            let emitted = match store.get(&uid) {
                Some(old) => {
                    let old_ip = pod_ip(old);
                    if old_ip != new_ip {
                        if let Some(ip) = old_ip {
                            names.remove(&ip);
                        }
                        if let Some(ip) = new_ip.as_deref() {
                            names.insert(ip, &name);
                        }
                    }
                    if filter.should_emit(&pod) {
                        factory.update_events(old, &pod)
                    } else {
                        Vec::new()
                    }
                }
                None => {
                    if let Some(ip) = new_ip.as_deref() {
                        names.insert(ip, &name);
                    }
                    if filter.should_emit(&pod) {
                        factory.add_events(&pod)
                    } else {
                        Vec::new()
                    }
                }
            };

            for event in emitted {
                debug!("lifecycle event {} for {}", event.kind, event.name);
                if events.send(event).await.is_err() {
                    return;
                }
            }
            store.insert(uid, pod);
        }
        watcher::Event::Delete(pod) => {
            if let Some(ip) = pod_ip(&pod) {
                names.remove(&ip);
            }
            if filter.should_emit(&pod) {
                for event in factory.delete_events(&pod) {
                    debug!("lifecycle event {} for {}", event.kind, event.name);
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            if let Some(uid) = pod.metadata.uid.as_deref() {
                store.remove(uid);
            }
        }
        watcher::Event::Init => {}
        watcher::Event::InitDone => {
            if let Some(tx) = synced.take() {
                let _ = tx.send(());
            }
        }
    }
}

async fn watch_services(
    api: Api<Service>,
    names: NameIndex,
    synced: oneshot::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let stream = watcher::watcher(api, watcher::Config::default());
    tokio::pin!(stream);

    // uid -> last observed cluster IP
    let mut store: HashMap<String, Option<String>> = HashMap::new();
    let mut synced = Some(synced);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            item = stream.next() => match item {
                Some(Ok(event)) => on_service_event(event, &mut store, &names, &mut synced),
                Some(Err(err)) => warn!("service watch error: {err}"),
                None => return,
            },
        }
    }
}

fn on_service_event(
    event: watcher::Event<Service>,
    store: &mut HashMap<String, Option<String>>,
    names: &NameIndex,
    synced: &mut Option<oneshot::Sender<()>>,
) {
    match event {
        watcher::Event::Apply(svc) | watcher::Event::InitApply(svc) => {
            let Some(uid) = svc.metadata.uid.clone() else {
                return;
            };
            let name = service_display_name(&svc);
            let new_ip = service_ip(&svc);

            if let Some(old_ip) = store.get(&uid) {
                if *old_ip != new_ip {
                    if let Some(ip) = old_ip.as_deref() {
                        names.remove(ip);
                    }
                    if let Some(ip) = new_ip.as_deref() {
                        names.insert(ip, &name);
                    }
                }
            } else if let Some(ip) = new_ip.as_deref() {
                names.insert(ip, &name);
            }
            store.insert(uid, new_ip);
        }
        watcher::Event::Delete(svc) => {
            if let Some(ip) = service_ip(&svc) {
                names.remove(&ip);
            }
            if let Some(uid) = svc.metadata.uid.as_deref() {
                store.remove(uid);
            }
        }
        watcher::Event::Init => {}
        watcher::Event::InitDone => {
            if let Some(tx) = synced.take() {
                let _ = tx.send(());
            }
        }
    }
}

fn pod_display_name(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or(""),
        pod.metadata.name.as_deref().unwrap_or("")
    )
}

fn pod_ip(pod: &Pod) -> Option<String> {
    pod.status.as_ref().and_then(|s| s.pod_ip.clone())
}

fn service_display_name(svc: &Service) -> String {
    format!(
        "{}/{}",
        svc.metadata.namespace.as_deref().unwrap_or(""),
        svc.metadata.name.as_deref().unwrap_or("")
    )
}

fn service_ip(svc: &Service) -> Option<String> {
    svc.spec.as_ref().and_then(|s| s.cluster_ip.clone())
}

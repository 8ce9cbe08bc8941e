//! Workload lifecycle events.
//!
//! Translates pod state transitions into an ordered stream of Added/Removed
//! events carrying the workload's cgroup path. Two policies exist: pod-mode
//! (one event per pod) and container-mode (one event per container status).

use std::fmt;
use std::path::PathBuf;

use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use log::warn;

use crate::error::Error;

const CONTAINER_ID_SEP: &str = "://";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Removed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Added => f.write_str("added"),
            EventKind::Removed => f.write_str("removed"),
        }
    }
}

/// A workload lifecycle event.
///
/// `name` is unique per live workload; `cgroup_path` is the absolute path of
/// the workload's cgroupv2 directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub name: String,
    pub cgroup_path: PathBuf,
}

/// Event policy, chosen at construction time.
pub enum EventFactory {
    Pods(PodEvents),
    Containers(ContainerEvents),
}

impl EventFactory {
    pub fn new(cgroup_root: String, containers: bool) -> Self {
        if containers {
            EventFactory::Containers(ContainerEvents { cgroup_root })
        } else {
            EventFactory::Pods(PodEvents { cgroup_root })
        }
    }

    pub fn add_events(&self, pod: &Pod) -> Vec<Event> {
        match self {
            EventFactory::Pods(f) => f.add_events(pod),
            EventFactory::Containers(f) => f.add_events(pod),
        }
    }

    pub fn update_events(&self, old: &Pod, new: &Pod) -> Vec<Event> {
        match self {
            EventFactory::Pods(f) => f.update_events(old, new),
            EventFactory::Containers(f) => f.update_events(old, new),
        }
    }

    pub fn delete_events(&self, pod: &Pod) -> Vec<Event> {
        match self {
            EventFactory::Pods(f) => f.delete_events(pod),
            EventFactory::Containers(f) => f.delete_events(pod),
        }
    }
}

fn pod_name(pod: &Pod) -> Option<String> {
    let namespace = pod.metadata.namespace.as_deref()?;
    let name = pod.metadata.name.as_deref()?;
    Some(format!("{namespace}/{name}"))
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
}

/// `<root>/kubepods/<qos-lower>/pod<uid>`
fn pod_cgroup_path(root: &str, pod: &Pod) -> Option<PathBuf> {
    let uid = pod.metadata.uid.as_deref()?;
    let qos = pod
        .status
        .as_ref()
        .and_then(|s| s.qos_class.as_deref())?
        .to_lowercase();
    Some(PathBuf::from(format!("{root}/kubepods/{qos}/pod{uid}")))
}

/// Strip the runtime scheme from a container id (`docker://abc` -> `abc`).
fn container_id_suffix(id: &str) -> Result<&str, Error> {
    match id.find(CONTAINER_ID_SEP) {
        Some(idx) => Ok(&id[idx + CONTAINER_ID_SEP.len()..]),
        None => Err(Error::MalformedContainerId { id: id.to_string() }),
    }
}

fn container_statuses(pod: &Pod) -> &[ContainerStatus] {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or(&[])
}

/// One event per pod, driven by the pod phase.
pub struct PodEvents {
    cgroup_root: String,
}

impl PodEvents {
    fn event(&self, pod: &Pod, kind: EventKind) -> Option<Event> {
        Some(Event {
            kind,
            name: pod_name(pod)?,
            cgroup_path: pod_cgroup_path(&self.cgroup_root, pod)?,
        })
    }

    fn add_events(&self, pod: &Pod) -> Vec<Event> {
        if pod_phase(pod) != "Running" {
            return Vec::new();
        }
        self.event(pod, EventKind::Added).into_iter().collect()
    }

    fn update_events(&self, _old: &Pod, new: &Pod) -> Vec<Event> {
        let kind = match pod_phase(new) {
            "Pending" => return Vec::new(),
            "Running" => EventKind::Added,
            _ => EventKind::Removed,
        };
        self.event(new, kind).into_iter().collect()
    }

    fn delete_events(&self, pod: &Pod) -> Vec<Event> {
        self.event(pod, EventKind::Removed).into_iter().collect()
    }
}

/// One event per container status, driven by the container state.
pub struct ContainerEvents {
    cgroup_root: String,
}

impl ContainerEvents {
    fn event(&self, pod: &Pod, status: &ContainerStatus, kind: EventKind) -> Option<Event> {
        let id = status.container_id.as_deref()?;
        let suffix = match container_id_suffix(id) {
            Ok(suffix) => suffix,
            Err(err) => {
                warn!("skipping container event: {err}");
                return None;
            }
        };
        let pod_path = pod_cgroup_path(&self.cgroup_root, pod)?;
        Some(Event {
            kind,
            name: format!("{}:{id}", pod_name(pod)?),
            cgroup_path: pod_path.join(suffix),
        })
    }

    fn add_events(&self, pod: &Pod) -> Vec<Event> {
        container_statuses(pod)
            .iter()
            .filter(|status| is_running(status))
            .filter_map(|status| self.event(pod, status, EventKind::Added))
            .collect()
    }

    fn update_events(&self, _old: &Pod, new: &Pod) -> Vec<Event> {
        container_statuses(new)
            .iter()
            .filter_map(|status| {
                let kind = if is_waiting(status) {
                    return None;
                } else if is_running(status) {
                    EventKind::Added
                } else {
                    EventKind::Removed
                };
                self.event(new, status, kind)
            })
            .collect()
    }

    fn delete_events(&self, pod: &Pod) -> Vec<Event> {
        container_statuses(pod)
            .iter()
            .filter_map(|status| self.event(pod, status, EventKind::Removed))
            .collect()
    }
}

fn is_running(status: &ContainerStatus) -> bool {
    status
        .state
        .as_ref()
        .map(|s| s.running.is_some())
        .unwrap_or(false)
}

fn is_waiting(status: &ContainerStatus) -> bool {
    status
        .state
        .as_ref()
        .map(|s| s.waiting.is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
        PodStatus,
    };

    fn pod(phase: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some("ns".to_string());
        pod.metadata.name = Some("web".to_string());
        pod.metadata.uid = Some("abc".to_string());
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            qos_class: Some("Burstable".to_string()),
            ..PodStatus::default()
        });
        pod
    }

    fn with_container(mut pod: Pod, id: &str, state: ContainerState) -> Pod {
        let status = ContainerStatus {
            container_id: Some(id.to_string()),
            state: Some(state),
            ..ContainerStatus::default()
        };
        pod.status
            .as_mut()
            .unwrap()
            .container_statuses
            .get_or_insert_with(Vec::new)
            .push(status);
        pod
    }

    fn running_state() -> ContainerState {
        ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..ContainerState::default()
        }
    }

    #[test]
    fn pod_mode_add_requires_running_phase() {
        let factory = EventFactory::new("/sys/fs/cgroup".to_string(), false);

        assert!(factory.add_events(&pod("Pending")).is_empty());

        let events = factory.add_events(&pod("Running"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Added);
        assert_eq!(events[0].name, "ns/web");
        assert_eq!(
            events[0].cgroup_path,
            PathBuf::from("/sys/fs/cgroup/kubepods/burstable/podabc")
        );
    }

    #[test]
    fn pod_mode_update_follows_phase() {
        let factory = EventFactory::new("/cg".to_string(), false);

        assert!(factory.update_events(&pod("Running"), &pod("Pending")).is_empty());

        let events = factory.update_events(&pod("Pending"), &pod("Running"));
        assert_eq!(events[0].kind, EventKind::Added);

        let events = factory.update_events(&pod("Running"), &pod("Succeeded"));
        assert_eq!(events[0].kind, EventKind::Removed);
    }

    #[test]
    fn pod_mode_delete_always_removes() {
        let factory = EventFactory::new("/cg".to_string(), false);
        let events = factory.delete_events(&pod("Running"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Removed);
    }

    #[test]
    fn container_mode_builds_container_cgroup_path() {
        let factory = EventFactory::new("/sys/fs/cgroup".to_string(), true);
        let pod = with_container(pod("Running"), "docker://xyz123", running_state());

        let events = factory.add_events(&pod);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "ns/web:docker://xyz123");
        assert_eq!(
            events[0].cgroup_path,
            PathBuf::from("/sys/fs/cgroup/kubepods/burstable/podabc/xyz123")
        );
    }

    #[test]
    fn container_mode_skips_malformed_ids() {
        let factory = EventFactory::new("/cg".to_string(), true);
        let pod = with_container(pod("Running"), "docker", running_state());

        // No scheme separator: the event is skipped, not a panic.
        assert!(factory.add_events(&pod).is_empty());
    }

    #[test]
    fn container_mode_update_follows_container_state() {
        let factory = EventFactory::new("/cg".to_string(), true);

        let waiting = with_container(
            pod("Running"),
            "docker://a",
            ContainerState {
                waiting: Some(ContainerStateWaiting::default()),
                ..ContainerState::default()
            },
        );
        assert!(factory.update_events(&waiting, &waiting).is_empty());

        let running = with_container(pod("Running"), "docker://a", running_state());
        let events = factory.update_events(&running, &running);
        assert_eq!(events[0].kind, EventKind::Added);

        let terminated = with_container(
            pod("Running"),
            "docker://a",
            ContainerState {
                terminated: Some(ContainerStateTerminated::default()),
                ..ContainerState::default()
            },
        );
        let events = factory.update_events(&terminated, &terminated);
        assert_eq!(events[0].kind, EventKind::Removed);
    }

    #[test]
    fn container_mode_add_ignores_non_running_containers() {
        let factory = EventFactory::new("/cg".to_string(), true);
        let pod = with_container(
            pod("Running"),
            "docker://a",
            ContainerState {
                waiting: Some(ContainerStateWaiting::default()),
                ..ContainerState::default()
            },
        );
        assert!(factory.add_events(&pod).is_empty());
    }

    #[test]
    fn container_id_suffix_splits_on_scheme() {
        assert_eq!(container_id_suffix("docker://xyz").unwrap(), "xyz");
        assert_eq!(container_id_suffix("containerd://abc123").unwrap(), "abc123");
        assert!(container_id_suffix("docker").is_err());
    }
}

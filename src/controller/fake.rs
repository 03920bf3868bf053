//! In-memory [`Cluster`] used by the unit tests
//!
//! Mimics the parts of API server behaviour the controllers rely on:
//! resourceVersion checks with 409 conflicts, `generateName`, owner-based
//! cascade deletion and equality-based label selectors. Pods are keyed by
//! `namespace/name`, as is every pod-level fault.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeSpec, ObjectReference, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::ResourceExt;

use super::cluster::{Cluster, EvictionOutcome};
use super::drain::pod_key;
use crate::crd::{NodeReplacement, NodeRollout};
use crate::error::{Error, Result};

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<String, Pod>,
    replacements: BTreeMap<String, NodeReplacement>,
    rollouts: BTreeMap<String, NodeRollout>,
    events: Vec<RecordedEvent>,
    version: u64,
    node_writes: usize,
    status_writes: usize,
    evictions: Vec<String>,
    force_deleted: Vec<String>,
    blocked_pods: BTreeSet<String>,
    lingering_pods: BTreeSet<String>,
    undeletable_pods: BTreeSet<String>,
    refused_pods: BTreeMap<String, String>,
    interleave: bool,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub event_type: String,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("fake api server: {}", reason),
        reason: reason.to_string(),
        code,
    })
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(|v| v == value).unwrap_or(false),
            None => labels.contains_key(term),
        })
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, name: &str, uid: &str, labels: &[(&str, &str)]) -> Node {
        let mut state = self.state.lock().unwrap();
        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(uid.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                resource_version: Some(state.next_version()),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: None,
        };
        state.nodes.insert(name.to_string(), node.clone());
        node
    }

    /// Add a pod in the `default` namespace
    pub fn add_pod(&self, name: &str, node_name: &str, owner_kind: Option<&str>) -> Pod {
        self.add_pod_in("default", name, node_name, owner_kind)
    }

    pub fn add_pod_in(
        &self,
        namespace: &str,
        name: &str,
        node_name: &str,
        owner_kind: Option<&str>,
    ) -> Pod {
        let mut state = self.state.lock().unwrap();
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: owner_kind.map(|kind| {
                    vec![OwnerReference {
                        api_version: "apps/v1".to_string(),
                        kind: kind.to_string(),
                        name: format!("{}-owner", name),
                        uid: format!("{}-owner-uid", name),
                        controller: Some(true),
                        block_owner_deletion: Some(true),
                    }]
                }),
                resource_version: Some(state.next_version()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node_name.to_string()),
                ..Default::default()
            }),
            status: None,
        };
        state.pods.insert(pod_key(&pod), pod.clone());
        pod
    }

    /// Store a rollout as if a user had created it
    pub fn add_rollout(&self, mut rollout: NodeRollout) -> NodeRollout {
        let mut state = self.state.lock().unwrap();
        let name = rollout.name_any();
        rollout.metadata.uid = Some(format!("{}-uid", name));
        rollout.metadata.resource_version = Some(state.next_version());
        if rollout.metadata.creation_timestamp.is_none() {
            rollout.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        }
        state.rollouts.insert(name, rollout.clone());
        rollout
    }

    /// Store a replacement directly, bypassing `create_replacement`
    pub fn add_replacement(&self, mut replacement: NodeReplacement) -> NodeReplacement {
        let mut state = self.state.lock().unwrap();
        let name = replacement.name_any();
        replacement.metadata.uid = Some(format!("{}-uid", name));
        replacement.metadata.resource_version = Some(state.next_version());
        state.replacements.insert(name, replacement.clone());
        replacement
    }

    pub fn rollout(&self, name: &str) -> Option<NodeRollout> {
        self.state.lock().unwrap().rollouts.get(name).cloned()
    }

    pub fn replacement(&self, name: &str) -> Option<NodeReplacement> {
        self.state.lock().unwrap().replacements.get(name).cloned()
    }

    pub fn replacements(&self) -> Vec<NodeReplacement> {
        self.state.lock().unwrap().replacements.values().cloned().collect()
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state.lock().unwrap().nodes.get(name).cloned()
    }

    pub fn pod_names(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().pods.keys().cloned().collect()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn node_writes(&self) -> usize {
        self.state.lock().unwrap().node_writes
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }

    pub fn evictions(&self) -> Vec<String> {
        self.state.lock().unwrap().evictions.clone()
    }

    pub fn force_deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().force_deleted.clone()
    }

    /// Evictions of this pod are answered with 429
    pub fn block_eviction(&self, pod: &str) {
        self.state.lock().unwrap().blocked_pods.insert(pod.to_string());
    }

    /// Evictions of this pod are accepted but the pod never terminates
    pub fn linger_after_eviction(&self, pod: &str) {
        self.state.lock().unwrap().lingering_pods.insert(pod.to_string());
    }

    /// Even forced deletion leaves this pod in place
    pub fn make_undeletable(&self, pod: &str) {
        self.state.lock().unwrap().undeletable_pods.insert(pod.to_string());
    }

    /// Evictions of this pod fail with a non-retriable error
    pub fn refuse_eviction(&self, pod: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .refused_pods
            .insert(pod.to_string(), message.to_string());
    }

    /// Make every call yield to the scheduler first, so reconciles joined on
    /// one task interleave call by call
    pub fn interleave_calls(&self) {
        self.state.lock().unwrap().interleave = true;
    }

    async fn step(&self) {
        let interleave = self.state.lock().unwrap().interleave;
        if interleave {
            tokio::task::yield_now().await;
        }
    }

    /// Bump a stored replacement's resourceVersion, as a concurrent writer would
    pub fn touch_replacement(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        if let Some(stored) = state.replacements.get_mut(name) {
            stored.metadata.resource_version = Some(version);
        }
    }

    /// Overwrite a stored replacement's phase, as its own controller would
    pub fn set_replacement_phase(&self, name: &str, phase: crate::crd::ReplacementPhase) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        if let Some(stored) = state.replacements.get_mut(name) {
            stored.status.get_or_insert_with(Default::default).phase = phase;
            stored.metadata.resource_version = Some(version);
        }
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        self.step().await;
        Ok(self.state.lock().unwrap().nodes.get(name).cloned())
    }

    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>> {
        self.step().await;
        let state = self.state.lock().unwrap();
        Ok(state
            .nodes
            .values()
            .filter(|n| matches_selector(n.labels(), label_selector))
            .cloned()
            .collect())
    }

    async fn replace_node(&self, node: &Node) -> Result<Node> {
        self.step().await;
        let mut state = self.state.lock().unwrap();
        let name = node.name_any();
        let stored_version = state
            .nodes
            .get(&name)
            .ok_or_else(|| Error::KubeError(api_error(404, "NotFound")))?
            .resource_version();
        if stored_version != node.resource_version() {
            return Err(Error::KubeError(api_error(409, "Conflict")));
        }
        let mut updated = node.clone();
        updated.metadata.resource_version = Some(state.next_version());
        state.node_writes += 1;
        state.nodes.insert(name, updated.clone());
        Ok(updated)
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        self.step().await;
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .values()
            .filter(|p| {
                p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node_name)
            })
            .cloned()
            .collect())
    }

    async fn evict_pod(&self, pod: &Pod, _grace_period: Duration) -> Result<EvictionOutcome> {
        self.step().await;
        let mut state = self.state.lock().unwrap();
        let name = pod_key(pod);
        if let Some(message) = state.refused_pods.get(&name) {
            return Err(Error::EvictionFailed {
                pod: name,
                message: message.clone(),
            });
        }
        if !state.pods.contains_key(&name) {
            return Ok(EvictionOutcome::Gone);
        }
        if state.blocked_pods.contains(&name) {
            return Ok(EvictionOutcome::Blocked);
        }
        state.evictions.push(name.clone());
        if !state.lingering_pods.contains(&name) {
            state.pods.remove(&name);
        }
        Ok(EvictionOutcome::Evicted)
    }

    async fn force_delete_pod(&self, pod: &Pod) -> Result<()> {
        self.step().await;
        let mut state = self.state.lock().unwrap();
        let name = pod_key(pod);
        state.force_deleted.push(name.clone());
        if !state.undeletable_pods.contains(&name) {
            state.pods.remove(&name);
        }
        Ok(())
    }

    async fn list_replacements(&self) -> Result<Vec<NodeReplacement>> {
        self.step().await;
        Ok(self.replacements())
    }

    async fn create_replacement(&self, replacement: &NodeReplacement) -> Result<NodeReplacement> {
        self.step().await;
        let mut state = self.state.lock().unwrap();
        let mut created = replacement.clone();
        let version = state.next_version();
        let name = match (&created.metadata.name, &created.metadata.generate_name) {
            (Some(name), _) => name.clone(),
            (None, Some(prefix)) => format!("{}{:05}", prefix, version),
            (None, None) => return Err(Error::KubeError(api_error(422, "Invalid"))),
        };
        if state.replacements.contains_key(&name) {
            return Err(Error::KubeError(api_error(409, "AlreadyExists")));
        }
        created.metadata.name = Some(name.clone());
        created.metadata.uid = Some(format!("{}-uid", name));
        created.metadata.resource_version = Some(version);
        created.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        state.replacements.insert(name, created.clone());
        Ok(created)
    }

    async fn replace_replacement_status(
        &self,
        replacement: &NodeReplacement,
    ) -> Result<NodeReplacement> {
        self.step().await;
        let mut state = self.state.lock().unwrap();
        let name = replacement.name_any();
        let stored_version = state
            .replacements
            .get(&name)
            .ok_or_else(|| Error::StatusUpdateError(api_error(404, "NotFound")))?
            .resource_version();
        if stored_version != replacement.resource_version() {
            return Err(Error::StatusUpdateError(api_error(409, "Conflict")));
        }
        let version = state.next_version();
        state.status_writes += 1;
        let stored = state
            .replacements
            .get_mut(&name)
            .ok_or_else(|| Error::StatusUpdateError(api_error(404, "NotFound")))?;
        stored.status = replacement.status.clone();
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }

    async fn replace_rollout_status(&self, rollout: &NodeRollout) -> Result<NodeRollout> {
        self.step().await;
        let mut state = self.state.lock().unwrap();
        let name = rollout.name_any();
        let stored_version = state
            .rollouts
            .get(&name)
            .ok_or_else(|| Error::StatusUpdateError(api_error(404, "NotFound")))?
            .resource_version();
        if stored_version != rollout.resource_version() {
            return Err(Error::StatusUpdateError(api_error(409, "Conflict")));
        }
        let version = state.next_version();
        state.status_writes += 1;
        let stored = state
            .rollouts
            .get_mut(&name)
            .ok_or_else(|| Error::StatusUpdateError(api_error(404, "NotFound")))?;
        stored.status = rollout.status.clone();
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }

    async fn delete_rollout(&self, name: &str) -> Result<()> {
        self.step().await;
        let mut state = self.state.lock().unwrap();
        if let Some(rollout) = state.rollouts.remove(name) {
            let uid = rollout.uid().unwrap_or_default();
            state.replacements.retain(|_, r| !r.is_owned_by_rollout(&uid));
        }
        Ok(())
    }

    async fn publish_event(
        &self,
        involved: ObjectReference,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        self.step().await;
        self.state.lock().unwrap().events.push(RecordedEvent {
            object: involved.name.unwrap_or_default(),
            event_type: event_type.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}

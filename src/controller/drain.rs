//! Node drain: resolve, cordon, classify and evict
//!
//! Every step starts from what the cluster reports right now, so a drain
//! interrupted by a restart simply runs again from the top.

use std::collections::BTreeSet;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::cluster::{Cluster, EvictionOutcome};
use super::metrics;
use crate::config::OperatorConfig;
use crate::crd::{NodeReplacement, PodReason};
use crate::error::{Error, Result};

/// Taint placed on cordoned nodes
pub const UNSCHEDULABLE_TAINT_KEY: &str = "node.kubernetes.io/unschedulable";

/// Reason recorded for pods left on the node
pub const DAEMONSET_REASON: &str = "pod owned by a DaemonSet";

/// How long force-deleted pods get to disappear before the drain gives up
const FORCE_DELETE_WINDOW: Duration = Duration::from_secs(60);

/// Look up the node a replacement targets.
///
/// `None` means the node is gone and the replacement can complete. A node
/// found under the same name but with another UID is a recreated node that
/// this replacement does not own, so it is reported as gone too.
pub async fn resolve_node(
    cluster: &dyn Cluster,
    replacement: &NodeReplacement,
) -> Result<Option<Node>> {
    let Some(node) = cluster.get_node(&replacement.spec.node_name).await? else {
        debug!("Node {} not found", replacement.spec.node_name);
        return Ok(None);
    };

    let uid = node.uid().unwrap_or_default();
    if uid != replacement.spec.node_uid {
        warn!(
            "Node {} has UID {}, replacement {} expects {}; treating the original node as gone",
            replacement.spec.node_name,
            uid,
            replacement.name_any(),
            replacement.spec.node_uid
        );
        return Ok(None);
    }

    Ok(Some(node))
}

/// Mark `node` unschedulable and add the unschedulable taint.
///
/// Returns whether anything had to change.
pub fn cordon_node_spec(node: &mut Node) -> bool {
    let spec = node.spec.get_or_insert_with(Default::default);
    let mut changed = false;

    if spec.unschedulable != Some(true) {
        spec.unschedulable = Some(true);
        changed = true;
    }

    let taints = spec.taints.get_or_insert_with(Vec::new);
    let tainted = taints
        .iter()
        .any(|t| t.key == UNSCHEDULABLE_TAINT_KEY && t.effect == "NoSchedule");
    if !tainted {
        taints.push(Taint {
            key: UNSCHEDULABLE_TAINT_KEY.to_string(),
            effect: "NoSchedule".to_string(),
            time_added: None,
            value: None,
        });
        changed = true;
    }

    changed
}

/// Cordon a node, writing it back only when it was not cordoned yet.
///
/// Returns whether a write happened.
#[instrument(skip(cluster, node), fields(node = %node.name_any()))]
pub async fn cordon(cluster: &dyn Cluster, node: &Node) -> Result<bool> {
    let mut cordoned = node.clone();
    if !cordon_node_spec(&mut cordoned) {
        debug!("Node already cordoned");
        return Ok(false);
    }

    cluster.replace_node(&cordoned).await?;
    info!("Cordoned node {}", node.name_any());
    Ok(true)
}

/// Identify a pod as `namespace/name`, the form recorded in replacement status
pub fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

fn owned_by_daemonset(pod: &Pod) -> bool {
    pod.owner_references()
        .iter()
        .any(|owner| owner.kind == "DaemonSet")
}

/// Split pods into those to evict and those to leave in place, by [`pod_key`]
pub fn classify_pods(pods: &[Pod]) -> (BTreeSet<String>, BTreeSet<PodReason>) {
    let mut evictable = BTreeSet::new();
    let mut ignored = BTreeSet::new();

    for pod in pods {
        if owned_by_daemonset(pod) {
            ignored.insert(PodReason::new(pod_key(pod), DAEMONSET_REASON));
        } else {
            evictable.insert(pod_key(pod));
        }
    }

    (evictable, ignored)
}

/// List the pods bound to `node_name` and classify them
pub async fn classify_node_pods(
    cluster: &dyn Cluster,
    node_name: &str,
) -> Result<(BTreeSet<String>, BTreeSet<PodReason>)> {
    let pods = cluster.list_pods_on_node(node_name).await?;
    Ok(classify_pods(&pods))
}

/// Counters for one completed eviction run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub evicted: usize,
    pub force_deleted: usize,
}

/// Evict `pods` from `node_name` and wait until none of them is bound to it.
///
/// `pods` holds [`pod_key`]s, so a pod of the same name in another namespace
/// is never touched.
///
/// Blocked evictions are retried on every poll. Once the eviction grace
/// period has passed, pods still bound are force-deleted. Pods that outlive
/// the forced deletion as well end the drain with [`Error::DrainTimeout`].
#[instrument(skip(cluster, pods, config), fields(pods = pods.len()))]
pub async fn evict(
    cluster: &dyn Cluster,
    node_name: &str,
    pods: &BTreeSet<String>,
    config: &OperatorConfig,
) -> Result<DrainStats> {
    let started = Instant::now();
    let force_at = started + config.eviction_grace_period;
    let give_up_at = force_at + FORCE_DELETE_WINDOW;

    let mut requested = BTreeSet::new();
    let mut forced = BTreeSet::new();
    let mut stats = DrainStats::default();

    loop {
        let remaining: Vec<Pod> = cluster
            .list_pods_on_node(node_name)
            .await?
            .into_iter()
            .filter(|p| pods.contains(&pod_key(p)))
            .collect();

        if remaining.is_empty() {
            info!(
                "Drained node {}: {} evicted, {} force-deleted",
                node_name, stats.evicted, stats.force_deleted
            );
            return Ok(stats);
        }

        let now = Instant::now();
        if now >= give_up_at {
            return Err(Error::DrainTimeout {
                node: node_name.to_string(),
                remaining: remaining.len(),
            });
        }

        for pod in &remaining {
            let name = pod_key(pod);

            if now >= force_at {
                if forced.insert(name.clone()) {
                    warn!("Pod {} outlived the grace period, force-deleting", name);
                    cluster.force_delete_pod(pod).await?;
                    metrics::record_pod_force_deleted();
                    stats.force_deleted += 1;
                }
                continue;
            }

            if requested.contains(&name) {
                continue;
            }

            match cluster
                .evict_pod(pod, config.eviction_grace_period)
                .await?
            {
                EvictionOutcome::Evicted => {
                    debug!("Evicted pod {}", name);
                    metrics::record_pod_evicted();
                    stats.evicted += 1;
                    requested.insert(name);
                }
                EvictionOutcome::Gone => {}
                EvictionOutcome::Blocked => {
                    debug!("Eviction of pod {} blocked, retrying", name);
                }
            }
        }

        tokio::time::sleep(config.drain_poll_interval).await;
    }
}

//! NodeReplacement reconciliation
//!
//! One pass re-reads every replacement, asks the admission gate whether this
//! one may run, then drives the drain of its node as far as it can. A `New`
//! replacement claims admission and checks for rival claims before it moves
//! to `InProgress`, so nothing is cordoned while another drain may be
//! starting. All progress is kept in the status, so a pass can stop anywhere
//! and the next one picks up from what is persisted.

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::admission;
use super::cluster::{emit_event, Cluster};
use super::drain;
use super::metrics;
use super::status::{update_replacement_status, ReplacementResult};
use crate::config::OperatorConfig;
use crate::crd::{NodeReplacement, ReplacementConditionType, ReplacementPhase};
use crate::error::Result;

pub const ADMITTED_REASON: &str = "Admitted";
pub const DRAINED_REASON: &str = "Drained";
pub const NODE_GONE_REASON: &str = "NodeGone";
pub const DRAIN_FAILED_REASON: &str = "DrainFailed";

/// Persist `result` and count the phase change it causes, if any
async fn record(
    cluster: &dyn Cluster,
    replacement: &NodeReplacement,
    result: &ReplacementResult,
) -> Result<NodeReplacement> {
    let updated = update_replacement_status(cluster, replacement, result, Utc::now()).await?;
    if updated.phase() != replacement.phase() {
        info!(
            "NodeReplacement {} moved from {} to {}",
            replacement.name_any(),
            replacement.phase(),
            updated.phase()
        );
        metrics::record_phase_transition("NodeReplacement", &updated.phase().to_string());
    }
    Ok(updated)
}

/// Record `Admitted=False` and publish an event when that changed anything
async fn hold_back(
    cluster: &dyn Cluster,
    replacement: &NodeReplacement,
    reason: &str,
    message: &str,
) -> Result<()> {
    let result = ReplacementResult::default().with_condition(
        ReplacementConditionType::Admitted,
        false,
        reason,
        message,
    );
    let updated = record(cluster, replacement, &result).await?;
    if updated.resource_version() != replacement.resource_version() {
        emit_event(cluster, replacement.object_ref(&()), "Normal", reason, message).await;
    }
    Ok(())
}

/// Run one reconcile pass for a replacement
#[instrument(skip(cluster, config, replacement), fields(name = %replacement.name_any(), node = %replacement.spec.node_name))]
pub async fn reconcile_replacement(
    cluster: &dyn Cluster,
    config: &OperatorConfig,
    replacement: &NodeReplacement,
) -> Result<Action> {
    let name = replacement.name_any();
    let phase = replacement.phase();

    if phase.is_terminal() {
        debug!("NodeReplacement {} is {}, nothing to do", name, phase);
        return Ok(Action::await_change());
    }

    let all = cluster.list_replacements().await?;
    if let Some(blocker) = admission::blocker(replacement, &all) {
        let message = blocker.to_string();
        info!("NodeReplacement {} not admitted: {}", name, message);
        metrics::record_admission_blocked();
        hold_back(cluster, replacement, blocker.reason(), &message).await?;
        return Ok(Action::requeue(config.requeue_interval));
    }

    let node_name = replacement.spec.node_name.clone();
    let Some(node) = drain::resolve_node(cluster, replacement).await? else {
        let result = ReplacementResult::phase(ReplacementPhase::Completed)
            .with_condition(ReplacementConditionType::Admitted, true, ADMITTED_REASON, "")
            .with_condition(
                ReplacementConditionType::NodeDrained,
                true,
                NODE_GONE_REASON,
                format!("node {} no longer exists", node_name),
            );
        record(cluster, replacement, &result).await?;
        emit_event(
            cluster,
            replacement.object_ref(&()),
            "Normal",
            NODE_GONE_REASON,
            &format!("Node {} is gone, nothing to drain", node_name),
        )
        .await;
        return Ok(Action::await_change());
    };

    let mut current = replacement.clone();
    if phase == ReplacementPhase::New {
        let claim = ReplacementResult::default().with_condition(
            ReplacementConditionType::Admitted,
            true,
            ADMITTED_REASON,
            "",
        );
        current = record(cluster, &current, &claim).await?;

        let all = cluster.list_replacements().await?;
        if let Some(rival) = admission::contender(&current, &all) {
            let message = if rival.phase() == ReplacementPhase::InProgress {
                format!("NodeReplacement \"{}\" is already in-progress", rival.name_any())
            } else {
                format!(
                    "NodeReplacement \"{}\" claimed admission at the same time",
                    rival.name_any()
                )
            };
            info!("NodeReplacement {} backs off: {}", name, message);
            metrics::record_admission_blocked();
            hold_back(cluster, &current, admission::ADMISSION_CONFLICT_REASON, &message).await?;
            return Ok(Action::requeue(config.requeue_interval));
        }

        current = record(
            cluster,
            &current,
            &ReplacementResult::phase(ReplacementPhase::InProgress),
        )
        .await?;
        emit_event(
            cluster,
            current.object_ref(&()),
            "Normal",
            ADMITTED_REASON,
            &format!("Starting drain of node {}", node_name),
        )
        .await;
    }

    if drain::cordon(cluster, &node).await? {
        emit_event(
            cluster,
            current.object_ref(&()),
            "Normal",
            "Cordoned",
            &format!("Cordoned node {}", node_name),
        )
        .await;
    }

    let pods = match current.status.as_ref().and_then(|s| s.node_pods.clone()) {
        Some(pods) => pods,
        None => {
            let (evictable, ignored) = drain::classify_node_pods(cluster, &node_name).await?;
            debug!(
                "Node {}: {} pod(s) to evict, {} ignored",
                node_name,
                evictable.len(),
                ignored.len()
            );
            let result = ReplacementResult {
                node_pods: Some(evictable.clone()),
                ignored_pods: Some(ignored),
                ..Default::default()
            };
            current = record(cluster, &current, &result).await?;
            evictable
        }
    };

    match drain::evict(cluster, &node_name, &pods, config).await {
        Ok(stats) => {
            let message = format!(
                "{} pod(s) evicted, {} force-deleted",
                stats.evicted, stats.force_deleted
            );
            let result = ReplacementResult::phase(ReplacementPhase::Completed).with_condition(
                ReplacementConditionType::NodeDrained,
                true,
                DRAINED_REASON,
                message.as_str(),
            );
            record(cluster, &current, &result).await?;
            emit_event(
                cluster,
                current.object_ref(&()),
                "Normal",
                DRAINED_REASON,
                &format!("Node {} drained: {}", node_name, message),
            )
            .await;
            Ok(Action::await_change())
        }
        Err(e) if e.is_retriable() => Err(e),
        Err(e) => {
            warn!("Drain of node {} failed: {}", node_name, e);
            let result = ReplacementResult::phase(ReplacementPhase::Failed).with_condition(
                ReplacementConditionType::NodeDrained,
                false,
                DRAIN_FAILED_REASON,
                e.status_message(),
            );
            record(cluster, &current, &result).await?;
            emit_event(
                cluster,
                current.object_ref(&()),
                "Warning",
                DRAIN_FAILED_REASON,
                &e.status_message(),
            )
            .await;
            Ok(Action::await_change())
        }
    }
}

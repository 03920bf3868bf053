//! NodeRollout reconciliation
//!
//! A `New` rollout is expanded into one NodeReplacement per target node. An
//! `InProgress` rollout folds the outcome of its replacements into its own
//! status. A finished rollout is deleted once it is older than the
//! configured maximum age.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::cluster::{emit_event, selector_string, Cluster};
use super::metrics;
use super::status::{update_rollout_status, RolloutResult, REPLACEMENTS_COMPLETED_REASON};
use crate::config::OperatorConfig;
use crate::crd::{
    effective_priority, NodeReplacement, NodeReplacementSpec, NodeRollout, NodeRolloutSpec,
    ReplacementPhase, RolloutPhase, ROLLOUT_LABEL,
};
use crate::error::{Error, Result};

pub const REPLACEMENTS_CREATED_REASON: &str = "ReplacementsCreated";
pub const CREATE_FAILED_REASON: &str = "CreateFailed";
pub const INVALID_SPEC_REASON: &str = "InvalidSpec";
pub const REPLACEMENTS_IN_PROGRESS_REASON: &str = "ReplacementsInProgress";

/// A node selected by a rollout, with the highest priority any entry gave it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub uid: String,
    pub priority: i32,
}

fn add_target(targets: &mut BTreeMap<String, Target>, node: &Node, priority: i32) -> Result<()> {
    let name = node.name_any();
    let uid = node.uid().ok_or_else(|| Error::MissingField {
        field: "metadata.uid",
        kind: "Node",
        name: name.clone(),
    })?;

    targets
        .entry(name.clone())
        .and_modify(|t| t.priority = t.priority.max(priority))
        .or_insert(Target {
            name,
            uid,
            priority,
        });
    Ok(())
}

/// Resolve every name and selector entry to the nodes it matches
pub async fn expand_targets(
    cluster: &dyn Cluster,
    spec: &NodeRolloutSpec,
) -> Result<BTreeMap<String, Target>> {
    let mut targets = BTreeMap::new();

    for entry in &spec.node_names {
        match cluster.get_node(&entry.name).await? {
            Some(node) => add_target(&mut targets, &node, effective_priority(entry.priority))?,
            None => warn!("Node {} does not exist, skipping", entry.name),
        }
    }

    for entry in &spec.node_selectors {
        let selector = selector_string(&entry.label_selector)?;
        let nodes = cluster.list_nodes(&selector).await?;
        debug!("Selector {:?} matched {} node(s)", selector, nodes.len());
        for node in &nodes {
            add_target(&mut targets, node, effective_priority(entry.priority))?;
        }
    }

    Ok(targets)
}

/// Build the replacement for `target`, owned by both the node and the rollout
pub fn replacement_for(rollout: &NodeRollout, target: &Target) -> Result<NodeReplacement> {
    let rollout_owner = rollout
        .controller_owner_ref(&())
        .ok_or_else(|| Error::MissingField {
            field: "metadata.uid",
            kind: "NodeRollout",
            name: rollout.name_any(),
        })?;
    let node_owner = OwnerReference {
        api_version: "v1".to_string(),
        kind: "Node".to_string(),
        name: target.name.clone(),
        uid: target.uid.clone(),
        controller: None,
        block_owner_deletion: None,
    };

    Ok(NodeReplacement {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", target.name)),
            labels: Some(BTreeMap::from([(
                ROLLOUT_LABEL.to_string(),
                rollout.name_any(),
            )])),
            owner_references: Some(vec![node_owner, rollout_owner]),
            ..Default::default()
        },
        spec: NodeReplacementSpec {
            node_name: target.name.clone(),
            node_uid: target.uid.clone(),
            priority: target.priority,
        },
        status: None,
    })
}

fn rollout_uid(rollout: &NodeRollout) -> Result<String> {
    rollout.uid().ok_or_else(|| Error::MissingField {
        field: "metadata.uid",
        kind: "NodeRollout",
        name: rollout.name_any(),
    })
}

/// Persist `result` and count the phase change it causes, if any
async fn record(
    cluster: &dyn Cluster,
    rollout: &NodeRollout,
    result: &RolloutResult,
    now: DateTime<Utc>,
) -> Result<()> {
    update_rollout_status(cluster, rollout, result, now).await?;
    if let Some(phase) = result.phase {
        if phase != rollout.phase() {
            info!(
                "NodeRollout {} moved from {} to {}",
                rollout.name_any(),
                rollout.phase(),
                phase
            );
            metrics::record_phase_transition("NodeRollout", &phase.to_string());
        }
    }
    Ok(())
}

/// Run one reconcile pass for a rollout
#[instrument(skip(cluster, config, rollout, now), fields(name = %rollout.name_any(), phase = %rollout.phase()))]
pub async fn reconcile_rollout(
    cluster: &dyn Cluster,
    config: &OperatorConfig,
    rollout: &NodeRollout,
    now: DateTime<Utc>,
) -> Result<Action> {
    match rollout.phase() {
        RolloutPhase::New => create_replacements(cluster, config, rollout, now).await,
        RolloutPhase::InProgress => aggregate(cluster, config, rollout, now).await,
        RolloutPhase::Completed | RolloutPhase::Failed => {
            collect_garbage(cluster, config, rollout, now).await
        }
    }
}

async fn create_replacements(
    cluster: &dyn Cluster,
    config: &OperatorConfig,
    rollout: &NodeRollout,
    now: DateTime<Utc>,
) -> Result<Action> {
    let name = rollout.name_any();

    if let Err(e) = rollout.spec.validate() {
        warn!("NodeRollout {} is invalid: {}", name, e);
        let result = RolloutResult {
            phase: Some(RolloutPhase::Failed),
            replacements_created_reason: Some(INVALID_SPEC_REASON.to_string()),
            replacements_created_error: Some(e.clone()),
            completion_timestamp: Some(now),
            ..Default::default()
        };
        record(cluster, rollout, &result, now).await?;
        emit_event(cluster, rollout.object_ref(&()), "Warning", INVALID_SPEC_REASON, &e).await;
        return Ok(Action::await_change());
    }

    let targets = expand_targets(cluster, &rollout.spec).await?;
    let uid = rollout_uid(rollout)?;

    // Replacements left over from an interrupted pass are reused
    let existing: BTreeSet<String> = cluster
        .list_replacements()
        .await?
        .into_iter()
        .filter(|r| r.is_owned_by_rollout(&uid) && r.phase() != ReplacementPhase::Failed)
        .map(|r| r.spec.node_name)
        .collect();

    let mut created = BTreeSet::new();
    for target in targets.values() {
        if existing.contains(&target.name) {
            created.insert(target.name.clone());
            continue;
        }

        let replacement = replacement_for(rollout, target)?;
        match cluster.create_replacement(&replacement).await {
            Ok(stored) => {
                info!(
                    "Created NodeReplacement {} for node {} with priority {}",
                    stored.name_any(),
                    target.name,
                    target.priority
                );
                created.insert(target.name.clone());
            }
            Err(e) => {
                warn!("Failed to create NodeReplacement for node {}: {}", target.name, e);
                let result = RolloutResult {
                    replacements_created_reason: Some(CREATE_FAILED_REASON.to_string()),
                    replacements_created_error: Some(e.status_message()),
                    ..Default::default()
                };
                record(cluster, rollout, &result, now).await?;
                return Err(e);
            }
        }
    }

    let message = format!("Created {} NodeReplacement(s)", created.len());
    let result = RolloutResult {
        phase: Some(RolloutPhase::InProgress),
        replacements_created: Some(created),
        replacements_created_reason: Some(REPLACEMENTS_CREATED_REASON.to_string()),
        replacements_in_progress_reason: Some(REPLACEMENTS_IN_PROGRESS_REASON.to_string()),
        ..Default::default()
    };
    record(cluster, rollout, &result, now).await?;
    emit_event(
        cluster,
        rollout.object_ref(&()),
        "Normal",
        REPLACEMENTS_CREATED_REASON,
        &message,
    )
    .await;

    Ok(Action::requeue(config.requeue_interval))
}

/// Outcome of a rollout's replacements, per node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub completed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
}

/// Group the rollout's replacements by node. A node counts as completed if
/// any of its replacements completed, and as failed only otherwise.
pub fn outcome(replacements: &[NodeReplacement], created: &BTreeSet<String>) -> Outcome {
    let mut outcome = Outcome::default();
    for r in replacements {
        if !created.contains(&r.spec.node_name) {
            continue;
        }
        match r.phase() {
            ReplacementPhase::Completed => {
                outcome.completed.insert(r.spec.node_name.clone());
            }
            ReplacementPhase::Failed => {
                outcome.failed.insert(r.spec.node_name.clone());
            }
            _ => {}
        }
    }
    outcome.failed.retain(|n| !outcome.completed.contains(n));
    outcome
}

async fn aggregate(
    cluster: &dyn Cluster,
    config: &OperatorConfig,
    rollout: &NodeRollout,
    now: DateTime<Utc>,
) -> Result<Action> {
    let status = rollout.status.clone().unwrap_or_default();
    let created = status.replacements_created.clone().unwrap_or_default();
    let uid = rollout_uid(rollout)?;

    let owned: Vec<NodeReplacement> = cluster
        .list_replacements()
        .await?
        .into_iter()
        .filter(|r| r.is_owned_by_rollout(&uid))
        .collect();
    let Outcome { completed, mut failed } = outcome(&owned, &created);

    let all_completed: BTreeSet<String> = status
        .replacements_completed
        .union(&completed)
        .cloned()
        .collect();
    failed.retain(|n| !all_completed.contains(n));

    let newly_completed: BTreeSet<String> = completed
        .difference(&status.replacements_completed)
        .cloned()
        .collect();

    let mut result = RolloutResult {
        replacements_completed: (!newly_completed.is_empty()).then_some(newly_completed),
        replacements_failed: Some(failed.clone()),
        replacements_in_progress_reason: Some(REPLACEMENTS_IN_PROGRESS_REASON.to_string()),
        ..Default::default()
    };

    let finished = all_completed.len() + failed.len() >= created.len();
    if finished {
        let phase = if failed.is_empty() {
            RolloutPhase::Completed
        } else {
            RolloutPhase::Failed
        };
        result.phase = Some(phase);
        result.replacements_in_progress_reason = Some(REPLACEMENTS_COMPLETED_REASON.to_string());
        if status.completion_timestamp.is_none() {
            result.completion_timestamp = Some(now);
        }

        record(cluster, rollout, &result, now).await?;
        let (event_type, message) = if failed.is_empty() {
            ("Normal", format!("All {} node(s) replaced", all_completed.len()))
        } else {
            (
                "Warning",
                format!(
                    "{} node(s) replaced, {} failed",
                    all_completed.len(),
                    failed.len()
                ),
            )
        };
        emit_event(
            cluster,
            rollout.object_ref(&()),
            event_type,
            &format!("Rollout{}", phase),
            &message,
        )
        .await;
        return Ok(Action::await_change());
    }

    debug!(
        "NodeRollout {}: {}/{} completed, {} failed",
        rollout.name_any(),
        all_completed.len(),
        created.len(),
        failed.len()
    );
    record(cluster, rollout, &result, now).await?;
    Ok(Action::requeue(config.requeue_interval))
}

async fn collect_garbage(
    cluster: &dyn Cluster,
    config: &OperatorConfig,
    rollout: &NodeRollout,
    now: DateTime<Utc>,
) -> Result<Action> {
    let max_age = chrono::Duration::from_std(config.rollout_max_age)
        .map_err(|e| Error::ConfigError(format!("invalid rollout max age: {}", e)))?;
    let created_at = rollout
        .creation_timestamp()
        .map(|t| t.0)
        .unwrap_or(now);
    let expires_at = created_at + max_age;

    if now >= expires_at {
        info!(
            "Deleting {} NodeRollout {} created at {}",
            rollout.phase(),
            rollout.name_any(),
            created_at
        );
        cluster.delete_rollout(&rollout.name_any()).await?;
        return Ok(Action::await_change());
    }

    let remaining = (expires_at - now)
        .to_std()
        .unwrap_or(config.rollout_max_age);
    Ok(Action::requeue(remaining))
}

//! Status merge for NodeRollout and NodeReplacement
//!
//! A reconcile pass never writes status fields directly. It describes what it
//! learned in a [`RolloutResult`] or [`ReplacementResult`], and the merge
//! folds that into the persisted status:
//!
//! - `replacementsCreated` and `completionTimestamp` are write-once
//! - `replacementsCompleted` only grows
//! - `replacementsFailed` is replaced by the latest snapshot
//! - replacement phases only move forward, pod lists are write-once
//!
//! The merged status is written back only when it differs from what was read,
//! guarded by the resourceVersion of that read.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::debug;

use super::cluster::Cluster;
use crate::crd::{
    Condition, ConditionStatus, NodeReplacement, NodeReplacementStatus, NodeRollout,
    NodeRolloutStatus, PodReason, ReplacementConditionType, ReplacementPhase,
    RolloutConditionType, RolloutPhase,
};
use crate::error::{Error, Result};

/// In-progress reason that marks the rollout as finished
pub const REPLACEMENTS_COMPLETED_REASON: &str = "ReplacementsCompleted";

/// What one pass of the rollout controller learned
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RolloutResult {
    /// Overwrites the phase when set
    pub phase: Option<RolloutPhase>,

    /// Nodes replacements were created for. Only set on the first pass.
    pub replacements_created: Option<BTreeSet<String>>,
    pub replacements_created_reason: Option<String>,
    pub replacements_created_error: Option<String>,

    pub replacements_in_progress_reason: Option<String>,
    pub replacements_in_progress_error: Option<String>,

    /// Newly completed nodes, merged into the stored set
    pub replacements_completed: Option<BTreeSet<String>>,

    /// Nodes currently failed, replacing the stored set
    pub replacements_failed: Option<BTreeSet<String>>,

    pub completion_timestamp: Option<DateTime<Utc>>,
}

impl RolloutResult {
    /// The first error recorded in this result, if any
    pub fn error(&self) -> Option<&str> {
        self.replacements_created_error
            .as_deref()
            .or(self.replacements_in_progress_error.as_deref())
    }
}

fn reason_of(reason: &Option<String>) -> Option<&str> {
    reason.as_deref().filter(|r| !r.is_empty())
}

/// Merge `result` into a copy of `status`.
///
/// On error the input is untouched and nothing from `result` is applied.
pub fn apply_rollout_result(
    status: &NodeRolloutStatus,
    result: &RolloutResult,
    now: DateTime<Utc>,
) -> Result<NodeRolloutStatus> {
    let mut status = status.clone();

    if let Some(phase) = result.phase {
        status.phase = phase;
    }

    if let Some(created) = &result.replacements_created {
        if status.replacements_created.is_some() {
            return Err(Error::ImmutableField {
                field: "ReplacementsCreated",
            });
        }
        status.replacements_created_count = created.len();
        status.replacements_created = Some(created.clone());
    }

    if let Some(completed) = &result.replacements_completed {
        status.replacements_completed.extend(completed.iter().cloned());
        status.replacements_completed_count = status.replacements_completed.len();
    }

    if let Some(failed) = &result.replacements_failed {
        status.replacements_failed = failed.clone();
        status.replacements_failed_count = failed.len();
    }

    if let Some(timestamp) = result.completion_timestamp {
        if status.completion_timestamp.is_some() {
            return Err(Error::ImmutableField {
                field: "CompletionTimestamp",
            });
        }
        status.completion_timestamp = Some(timestamp);
    }

    set_created_condition(&mut status, result, now)?;
    set_in_progress_condition(&mut status, result, now)?;

    Ok(status)
}

fn set_created_condition(
    status: &mut NodeRolloutStatus,
    result: &RolloutResult,
    now: DateTime<Utc>,
) -> Result<()> {
    let reason = reason_of(&result.replacements_created_reason);
    if result.replacements_created_error.is_some() && reason.is_none() {
        return Err(Error::MalformedResult {
            field: "ReplacementsCreated",
        });
    }

    if let Some(reason) = reason {
        let condition = match &result.replacements_created_error {
            Some(err) => Condition::new(ConditionStatus::False, reason, err.as_str(), now),
            None => Condition::new(ConditionStatus::True, reason, "", now),
        };
        status
            .conditions
            .set(RolloutConditionType::ReplacementsCreated, condition);
    }

    Ok(())
}

fn set_in_progress_condition(
    status: &mut NodeRolloutStatus,
    result: &RolloutResult,
    now: DateTime<Utc>,
) -> Result<()> {
    let reason = reason_of(&result.replacements_in_progress_reason);
    if result.replacements_in_progress_error.is_some() && reason.is_none() {
        return Err(Error::MalformedResult {
            field: "ReplacementsInProgress",
        });
    }

    if let Some(reason) = reason {
        let mut condition = match &result.replacements_in_progress_error {
            Some(err) => Condition::new(ConditionStatus::False, reason, err.as_str(), now),
            None => Condition::new(ConditionStatus::True, reason, "", now),
        };
        if reason == REPLACEMENTS_COMPLETED_REASON {
            condition.status = ConditionStatus::False;
        }
        status
            .conditions
            .set(RolloutConditionType::ReplacementsInProgress, condition);
    }

    Ok(())
}

/// Merge `result` into the rollout's status and persist it if anything changed.
///
/// Returns the stored object after the write, or `None` when no write was needed.
pub async fn update_rollout_status(
    cluster: &dyn Cluster,
    rollout: &NodeRollout,
    result: &RolloutResult,
    now: DateTime<Utc>,
) -> Result<Option<NodeRollout>> {
    let current = rollout.status.clone().unwrap_or_default();
    let merged = apply_rollout_result(&current, result, now)?;

    if merged == current {
        debug!("Status of NodeRollout {} unchanged", rollout.name_any());
        return Ok(None);
    }

    let mut updated = rollout.clone();
    updated.status = Some(merged);
    cluster.replace_rollout_status(&updated).await.map(Some)
}

/// A condition a replacement pass wants recorded
#[derive(Clone, Debug, PartialEq)]
pub struct ConditionUpdate {
    pub type_: ReplacementConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
}

/// What one pass of the replacement controller learned
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplacementResult {
    pub phase: Option<ReplacementPhase>,
    pub node_pods: Option<BTreeSet<String>>,
    pub ignored_pods: Option<BTreeSet<PodReason>>,
    pub conditions: Vec<ConditionUpdate>,
}

impl ReplacementResult {
    pub fn phase(phase: ReplacementPhase) -> Self {
        Self {
            phase: Some(phase),
            ..Default::default()
        }
    }

    pub fn with_condition(
        mut self,
        type_: ReplacementConditionType,
        status: impl Into<ConditionStatus>,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        self.conditions.push(ConditionUpdate {
            type_,
            status: status.into(),
            reason: reason.to_string(),
            message: message.into(),
        });
        self
    }
}

/// Merge `result` into a copy of a replacement status
pub fn apply_replacement_result(
    status: &NodeReplacementStatus,
    result: &ReplacementResult,
    now: DateTime<Utc>,
) -> Result<NodeReplacementStatus> {
    let mut status = status.clone();

    if let Some(phase) = result.phase {
        if !status.phase.can_transition_to(phase) {
            return Err(Error::InvalidPhaseTransition {
                from: status.phase.to_string(),
                to: phase.to_string(),
            });
        }
        status.phase = phase;
    }

    if let Some(pods) = &result.node_pods {
        if status.node_pods.is_some() {
            return Err(Error::ImmutableField { field: "NodePods" });
        }
        status.node_pods = Some(pods.clone());
    }

    if let Some(pods) = &result.ignored_pods {
        if status.ignored_pods.is_some() {
            return Err(Error::ImmutableField {
                field: "IgnoredPods",
            });
        }
        status.ignored_pods = Some(pods.clone());
    }

    for update in &result.conditions {
        status.conditions.set(
            update.type_,
            Condition::new(update.status, update.reason.as_str(), update.message.as_str(), now),
        );
    }

    Ok(status)
}

/// Merge `result` into the replacement's status and persist it if anything changed.
///
/// Returns the latest known object: the stored one after a write, or a copy
/// of the input when nothing changed.
pub async fn update_replacement_status(
    cluster: &dyn Cluster,
    replacement: &NodeReplacement,
    result: &ReplacementResult,
    now: DateTime<Utc>,
) -> Result<NodeReplacement> {
    let current = replacement.status.clone().unwrap_or_default();
    let merged = apply_replacement_result(&current, result, now)?;

    if merged == current {
        return Ok(replacement.clone());
    }

    let mut updated = replacement.clone();
    updated.status = Some(merged);
    cluster.replace_replacement_status(&updated).await
}

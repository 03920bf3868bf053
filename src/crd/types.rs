//! Shared types for NodeRollout and NodeReplacement specifications
//!
//! These types are used across the CRD definitions and controller logic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a NodeRollout
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RolloutPhase {
    /// Accepted, no replacements created yet
    #[default]
    New,
    /// Replacements exist and at least one has not finished
    InProgress,
    /// Every replacement completed
    Completed,
    /// Every replacement finished and at least one failed
    Failed,
}

impl RolloutPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RolloutPhase::Completed | RolloutPhase::Failed)
    }
}

impl std::fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RolloutPhase::New => write!(f, "New"),
            RolloutPhase::InProgress => write!(f, "InProgress"),
            RolloutPhase::Completed => write!(f, "Completed"),
            RolloutPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Lifecycle phase of a NodeReplacement
///
/// Phases only move forward: `New -> InProgress -> Completed | Failed`.
/// A replacement whose node is already gone may go straight from `New`
/// to `Completed`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ReplacementPhase {
    #[default]
    New,
    InProgress,
    Completed,
    Failed,
}

impl ReplacementPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplacementPhase::Completed | ReplacementPhase::Failed)
    }

    /// Whether moving from `self` to `next` respects the forward-only lifecycle.
    /// Staying in the same phase is always allowed.
    pub fn can_transition_to(&self, next: ReplacementPhase) -> bool {
        use ReplacementPhase::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (New, InProgress) | (New, Completed) | (New, Failed) => true,
            (InProgress, Completed) | (InProgress, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ReplacementPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplacementPhase::New => write!(f, "New"),
            ReplacementPhase::InProgress => write!(f, "InProgress"),
            ReplacementPhase::Completed => write!(f, "Completed"),
            ReplacementPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// A node selected by name, with the priority its replacement should carry
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PriorityName {
    /// Name of the Node object
    pub name: String,
    /// Larger is more urgent. Defaults to 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

/// Nodes selected by label, with the priority their replacements should carry
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriorityLabelSelector {
    /// Standard Kubernetes label selector evaluated against Node labels
    #[schemars(with = "serde_json::Value")]
    pub label_selector: LabelSelector,
    /// Larger is more urgent. Defaults to 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

/// A pod deliberately left on the node, and why
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub struct PodReason {
    pub name: String,
    pub reason: String,
}

impl PodReason {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Condition types recorded on a NodeRollout
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum RolloutConditionType {
    ReplacementsCreated,
    ReplacementsInProgress,
}

/// Condition types recorded on a NodeReplacement
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum ReplacementConditionType {
    /// Whether the admission gate lets this replacement run
    Admitted,
    /// Whether the node has been emptied of evictable pods
    NodeDrained,
}

/// Status of a condition (Kubernetes convention, without `Unknown`)
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// Condition for status reporting (Kubernetes convention)
///
/// The condition type is the key under which it is stored in [`Conditions`].
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub status: ConditionStatus,
    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Last time the reason or status changed
    pub last_update_time: DateTime<Utc>,
    /// Last time the status changed
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            reason: reason.into(),
            message: message.into(),
            last_update_time: now,
            last_transition_time: now,
        }
    }
}

/// Conditions keyed by type, so an object carries at most one per type
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(transparent)]
pub struct Conditions<T: Ord>(BTreeMap<T, Condition>);

impl<T: Ord> Default for Conditions<T> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<T: Ord + Copy> Conditions<T> {
    pub fn get(&self, type_: T) -> Option<&Condition> {
        self.0.get(&type_)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&T, &Condition)> {
        self.0.iter()
    }

    /// Record `condition` under `type_`.
    ///
    /// Re-applying the same status and reason leaves the stored entry
    /// untouched, message and timestamps included. A new reason under the
    /// same status keeps the previous `last_transition_time`. Returns
    /// whether anything changed.
    pub fn set(&mut self, type_: T, mut condition: Condition) -> bool {
        if let Some(current) = self.0.get(&type_) {
            if current.status == condition.status && current.reason == condition.reason {
                return false;
            }
            if current.status == condition.status {
                condition.last_transition_time = current.last_transition_time;
            }
        }
        self.0.insert(type_, condition);
        true
    }
}

/// Effective priority of an entry whose priority was omitted
pub fn effective_priority(priority: Option<i32>) -> i32 {
    priority.unwrap_or(0)
}

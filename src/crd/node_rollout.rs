//! NodeRollout Custom Resource Definition
//!
//! A NodeRollout asks the operator to replace a set of cluster nodes. Nodes
//! are picked by name or by label selector, each entry carrying a priority.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Conditions, PriorityLabelSelector, PriorityName, RolloutConditionType, RolloutPhase,
};

/// The NodeRollout CRD represents a request to replace cluster nodes.
///
/// # Example
///
/// ```yaml
/// apiVersion: nodeops.io/v1alpha1
/// kind: NodeRollout
/// metadata:
///   name: kernel-upgrade
/// spec:
///   nodeNames:
///     - name: master-1
///       priority: 20
///   nodeSelectors:
///     - labelSelector:
///         matchLabels:
///           node-role.kubernetes.io/worker: ""
///       priority: 10
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "nodeops.io",
    version = "v1alpha1",
    kind = "NodeRollout",
    status = "NodeRolloutStatus",
    shortname = "nro",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Created","type":"integer","jsonPath":".status.replacementsCreatedCount"}"#,
    printcolumn = r#"{"name":"Completed","type":"integer","jsonPath":".status.replacementsCompletedCount"}"#,
    printcolumn = r#"{"name":"Failed","type":"integer","jsonPath":".status.replacementsFailedCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeRolloutSpec {
    /// Nodes to replace, selected by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_names: Vec<PriorityName>,

    /// Nodes to replace, selected by label
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_selectors: Vec<PriorityLabelSelector>,
}

impl NodeRolloutSpec {
    /// Validate the spec before any replacement is created
    pub fn validate(&self) -> Result<(), String> {
        if self.node_names.is_empty() && self.node_selectors.is_empty() {
            return Err("at least one of nodeNames or nodeSelectors must be set".to_string());
        }

        for (i, entry) in self.node_names.iter().enumerate() {
            if entry.name.trim().is_empty() {
                return Err(format!("nodeNames[{}].name must not be empty", i));
            }
        }

        for (i, entry) in self.node_selectors.iter().enumerate() {
            let expressions = entry.label_selector.match_expressions.iter().flatten();
            for (j, expr) in expressions.enumerate() {
                let path = format!("nodeSelectors[{}].labelSelector.matchExpressions[{}]", i, j);
                let has_values = expr.values.as_ref().is_some_and(|v| !v.is_empty());
                match expr.operator.as_str() {
                    "In" | "NotIn" if !has_values => {
                        return Err(format!("{}: operator {} needs values", path, expr.operator));
                    }
                    "Exists" | "DoesNotExist" if has_values => {
                        return Err(format!(
                            "{}: operator {} takes no values",
                            path, expr.operator
                        ));
                    }
                    "In" | "NotIn" | "Exists" | "DoesNotExist" => {}
                    other => {
                        return Err(format!("{}: unknown operator {:?}", path, other));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Status subresource for NodeRollout
///
/// Written only by the rollout controller, through the status merge.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeRolloutStatus {
    #[serde(default)]
    pub phase: RolloutPhase,

    /// Nodes a replacement was created for. Write-once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacements_created: Option<BTreeSet<String>>,

    #[serde(default)]
    pub replacements_created_count: usize,

    /// Nodes whose replacement completed. Only ever grows.
    #[serde(default)]
    pub replacements_completed: BTreeSet<String>,

    #[serde(default)]
    pub replacements_completed_count: usize,

    /// Nodes whose replacement failed, as last observed. Always serialized so
    /// that a merge patch can shrink it.
    #[serde(default)]
    pub replacements_failed: BTreeSet<String>,

    #[serde(default)]
    pub replacements_failed_count: usize,

    /// When the rollout reached a terminal phase. Write-once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions<RolloutConditionType>,
}

impl NodeRollout {
    /// Current phase, `New` when no status was written yet
    pub fn phase(&self) -> RolloutPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}

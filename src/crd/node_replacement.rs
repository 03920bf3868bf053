//! NodeReplacement Custom Resource Definition
//!
//! One NodeReplacement tracks the drain of a single node. It is owned by the
//! Node it targets and by the NodeRollout that created it, so deleting
//! either one garbage-collects it.

use std::collections::BTreeSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Conditions, PodReason, ReplacementConditionType, ReplacementPhase};

/// Label carrying the name of the NodeRollout a replacement belongs to
pub const ROLLOUT_LABEL: &str = "nodeops.io/rollout";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "nodeops.io",
    version = "v1alpha1",
    kind = "NodeReplacement",
    status = "NodeReplacementStatus",
    shortname = "nrp",
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Priority","type":"integer","jsonPath":".spec.priority"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeReplacementSpec {
    /// Name of the node to drain
    pub node_name: String,

    /// UID of the node, to tell it apart from a node recreated under the same name
    #[serde(rename = "nodeUID")]
    pub node_uid: String,

    /// Larger is more urgent
    #[serde(default)]
    pub priority: i32,
}

/// Status subresource for NodeReplacement
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeReplacementStatus {
    #[serde(default)]
    pub phase: ReplacementPhase,

    /// Pods selected for eviction. Write-once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_pods: Option<BTreeSet<String>>,

    /// Pods left on the node on purpose. Write-once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignored_pods: Option<BTreeSet<PodReason>>,

    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions<ReplacementConditionType>,
}

impl NodeReplacement {
    /// Current phase, `New` when no status was written yet
    pub fn phase(&self) -> ReplacementPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Whether an owner reference points at the given NodeRollout UID
    pub fn is_owned_by_rollout(&self, rollout_uid: &str) -> bool {
        self.metadata
            .owner_references
            .as_ref()
            .map(|refs| {
                refs.iter()
                    .any(|r| r.kind == "NodeRollout" && r.uid == rollout_uid)
            })
            .unwrap_or(false)
    }
}

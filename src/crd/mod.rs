//! Custom Resource Definitions for the node rollout operator
//!
//! This module defines the Kubernetes CRDs for requesting and tracking node replacements.

mod node_replacement;
mod node_rollout;
mod types;

pub use node_replacement::{
    NodeReplacement, NodeReplacementSpec, NodeReplacementStatus, ROLLOUT_LABEL,
};
pub use node_rollout::{NodeRollout, NodeRolloutSpec, NodeRolloutStatus};
pub use types::*;

//! Controller module for NodeRollout and NodeReplacement reconciliation
//!
//! This module contains the controller loops, the status merge, the
//! admission gate and the node drain pipeline.

pub mod admission;
pub mod cluster;
pub mod drain;
#[cfg(test)]
mod fake;
pub mod metrics;
mod reconciler;
pub mod replacement;
pub mod rollout;
pub mod status;

pub use cluster::{Cluster, KubeCluster};
pub use reconciler::{retry_delay, run_controllers, ControllerState};

//! node-rollout-operator: drains and replaces Kubernetes nodes
//!
//! A `NodeRollout` names the nodes to replace, by name or label selector,
//! each with a priority. The operator creates one `NodeReplacement` per node
//! and drains those nodes one at a time, most urgent first.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod rest_api;

pub use error::{Error, Result};

//! Central error types for the node rollout operator
//!
//! Uses `thiserror` for ergonomic, type-safe error handling with
//! automatic `Display` and `Error` trait implementations.

use thiserror::Error;

/// Central error type for the node rollout operator
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error from kube-rs
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A label selector cannot be expressed in API server syntax
    #[error("invalid label selector: {0}")]
    InvalidSelector(String),

    /// A write-once status field was written a second time
    #[error("cannot update {field}, field is immutable once set")]
    ImmutableField { field: &'static str },

    /// A result carried an error without the reason that must explain it
    #[error("if {field}Error is set, {field}Reason must also be set")]
    MalformedResult { field: &'static str },

    /// A replacement phase was asked to move backwards
    #[error("invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    /// Writing a merged status back to the cluster failed
    #[error("error updating status: {0}")]
    StatusUpdateError(#[source] kube::Error),

    /// A required metadata field was absent on an object read from the cluster
    #[error("Missing required field: {field} on {kind}/{name}")]
    MissingField {
        field: &'static str,
        kind: &'static str,
        name: String,
    },

    /// The API server refused an eviction for a reason that retrying will not fix
    #[error("failed to evict pod {pod}: {message}")]
    EvictionFailed { pod: String, message: String },

    /// Pods were still bound to the node once the drain window ran out
    #[error("node {node} still has {remaining} evictable pod(s) after the grace period")]
    DrainTimeout { node: String, remaining: usize },
}

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Check if this error type should trigger a retry
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_)
                | Error::StatusUpdateError(_)
                | Error::DrainTimeout { .. }
        )
    }

    /// Check if this error is an optimistic concurrency conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) | Error::StatusUpdateError(kube::Error::Api(e)) => {
                e.code == 409
            }
            _ => false,
        }
    }

    /// Convert to a human-readable message for status updates
    pub fn status_message(&self) -> String {
        match self {
            Error::KubeError(e) => format!("Kubernetes error: {}", e),
            Error::EvictionFailed { pod, message } => {
                format!("Eviction of {} failed: {}", pod, message)
            }
            _ => self.to_string(),
        }
    }
}

//! Operator configuration
//!
//! Command-line flags (with environment fallbacks) are parsed by `clap` and
//! folded into [`OperatorConfig`], which the controllers read at runtime.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Args;

/// Runtime settings consumed by the controllers
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// How long an evicted pod may take to terminate before it is force-deleted
    pub eviction_grace_period: Duration,
    /// Age after which a Completed or Failed NodeRollout is deleted
    pub rollout_max_age: Duration,
    /// Delay between re-lists of a node's pods while draining
    pub drain_poll_interval: Duration,
    /// Delay before a blocked replacement is reconsidered
    pub requeue_interval: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            eviction_grace_period: Duration::from_secs(30),
            rollout_max_age: Duration::from_secs(48 * 60 * 60),
            drain_poll_interval: Duration::from_secs(5),
            requeue_interval: Duration::from_secs(30),
        }
    }
}

/// Flags for the `run` subcommand
#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Maximum wait for a pod to terminate after eviction before forcing its removal
    #[arg(long, env = "EVICTION_GRACE_PERIOD", default_value = "30s", value_parser = humantime::parse_duration)]
    pub eviction_grace_period: Duration,

    /// Age after which a finished NodeRollout is garbage-collected
    #[arg(long, env = "ROLLOUT_MAX_AGE", default_value = "48h", value_parser = humantime::parse_duration)]
    pub rollout_max_age: Duration,

    /// Interval between pod re-lists while draining a node
    #[arg(long, env = "DRAIN_POLL_INTERVAL", default_value = "5s", value_parser = humantime::parse_duration)]
    pub drain_poll_interval: Duration,

    /// Delay before a replacement blocked by admission is reconsidered
    #[arg(long, env = "REQUEUE_INTERVAL", default_value = "30s", value_parser = humantime::parse_duration)]
    pub requeue_interval: Duration,

    /// Address for the health and metrics HTTP server
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8080")]
    pub http_addr: SocketAddr,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl RunArgs {
    pub fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            eviction_grace_period: self.eviction_grace_period,
            rollout_max_age: self.rollout_max_age,
            drain_poll_interval: self.drain_poll_interval,
            requeue_interval: self.requeue_interval,
        }
    }
}

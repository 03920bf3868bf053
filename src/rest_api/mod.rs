//! HTTP endpoints for probes and scraping
//!
//! Serves `/health` for liveness checks and `/metrics` in the Prometheus
//! text format.

mod server;

pub use server::{router, run_server};

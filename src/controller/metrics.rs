//! Prometheus metrics for the node rollout operator

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Labels for the reconcile counter
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub controller: String,
    pub outcome: String,
}

/// Labels for phase transitions
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub kind: String,
    pub phase: String,
}

/// Reconcile passes per controller and outcome
pub static RECONCILE_TOTAL: Lazy<Family<ReconcileLabels, Counter>> = Lazy::new(Family::default);

/// Phases entered by rollouts and replacements
pub static PHASE_TRANSITIONS: Lazy<Family<PhaseLabels, Counter>> = Lazy::new(Family::default);

pub static PODS_EVICTED: Lazy<Counter> = Lazy::new(Counter::default);

pub static PODS_FORCE_DELETED: Lazy<Counter> = Lazy::new(Counter::default);

/// Passes in which a replacement was held back by admission
pub static ADMISSION_BLOCKED: Lazy<Counter> = Lazy::new(Counter::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "node_rollout_reconcile",
        "Reconcile passes by controller and outcome",
        RECONCILE_TOTAL.clone(),
    );
    registry.register(
        "node_rollout_phase_transitions",
        "Phase transitions of NodeRollouts and NodeReplacements",
        PHASE_TRANSITIONS.clone(),
    );
    registry.register(
        "node_rollout_pods_evicted",
        "Pods evicted while draining nodes",
        PODS_EVICTED.clone(),
    );
    registry.register(
        "node_rollout_pods_force_deleted",
        "Pods force-deleted after the eviction grace period",
        PODS_FORCE_DELETED.clone(),
    );
    registry.register(
        "node_rollout_admission_blocked",
        "Reconciles in which admission held a replacement back",
        ADMISSION_BLOCKED.clone(),
    );
    registry
});

pub fn record_reconcile(controller: &str, outcome: &str) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
        outcome: outcome.to_string(),
    };
    RECONCILE_TOTAL.get_or_create(&labels).inc();
}

pub fn record_phase_transition(kind: &str, phase: &str) {
    let labels = PhaseLabels {
        kind: kind.to_string(),
        phase: phase.to_string(),
    };
    PHASE_TRANSITIONS.get_or_create(&labels).inc();
}

pub fn record_pod_evicted() {
    PODS_EVICTED.inc();
}

pub fn record_pod_force_deleted() {
    PODS_FORCE_DELETED.inc();
}

pub fn record_admission_blocked() {
    ADMISSION_BLOCKED.inc();
}

/// Render the registry in the Prometheus text format
pub fn encode() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}

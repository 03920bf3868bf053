//! Controller wiring for NodeRollout and NodeReplacement
//!
//! Both controllers run on `kube::runtime::Controller`. The reconcile
//! functions here only adapt the runtime's signature to the cluster-agnostic
//! logic in the `rollout` and `replacement` modules.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{error, info, instrument, warn};

use super::cluster::{Cluster, KubeCluster};
use super::metrics;
use super::replacement::reconcile_replacement;
use super::rollout::reconcile_rollout;
use crate::config::OperatorConfig;
use crate::crd::{NodeReplacement, NodeRollout};
use crate::error::{Error, Result};

/// Shared state for the controllers
pub struct ControllerState {
    pub cluster: Arc<dyn Cluster>,
    pub config: OperatorConfig,
}

impl ControllerState {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            cluster: Arc::new(KubeCluster::new(client)),
            config,
        }
    }
}

/// Fail early with a clear message when a CRD is not installed
async fn ensure_crd<K>(api: &Api<K>, kind: &str) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.list(&ListParams::default().limit(1)).await {
        Ok(_) => {
            info!("{} CRD is available", kind);
            Ok(())
        }
        Err(e) => {
            error!("{} CRD not found. Please install the CRD first: {:?}", kind, e);
            Err(Error::ConfigError(format!("{} CRD not installed", kind)))
        }
    }
}

/// Main entry point: run both controllers until shutdown
pub async fn run_controllers(client: Client, state: Arc<ControllerState>) -> Result<()> {
    let rollouts: Api<NodeRollout> = Api::all(client.clone());
    let replacements: Api<NodeReplacement> = Api::all(client.clone());

    ensure_crd(&rollouts, "NodeRollout").await?;
    ensure_crd(&replacements, "NodeReplacement").await?;

    info!("Starting NodeRollout and NodeReplacement controllers");

    let rollout_controller = Controller::new(rollouts, Config::default())
        // Replacement phase changes feed back into the owning rollout
        .owns::<NodeReplacement>(replacements.clone(), Config::default())
        .shutdown_on_signal()
        .run(reconcile_rollout_object, rollout_error_policy, state.clone())
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("Reconciled NodeRollout: {:?}", obj),
                Err(e) => error!("NodeRollout reconcile error: {:?}", e),
            }
        });

    let replacement_controller = Controller::new(replacements, Config::default())
        .shutdown_on_signal()
        .run(
            reconcile_replacement_object,
            replacement_error_policy,
            state,
        )
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("Reconciled NodeReplacement: {:?}", obj),
                Err(e) => error!("NodeReplacement reconcile error: {:?}", e),
            }
        });

    futures::join!(rollout_controller, replacement_controller);
    Ok(())
}

fn outcome_label(result: &Result<Action>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(e) if e.is_conflict() => "conflict",
        Err(_) => "error",
    }
}

#[instrument(skip(ctx), fields(name = %obj.name_any()))]
async fn reconcile_rollout_object(
    obj: Arc<NodeRollout>,
    ctx: Arc<ControllerState>,
) -> Result<Action> {
    info!("Reconciling NodeRollout {} ({})", obj.name_any(), obj.phase());
    let result =
        reconcile_rollout(ctx.cluster.as_ref(), &ctx.config, &obj, chrono::Utc::now()).await;
    metrics::record_reconcile("rollout", outcome_label(&result));
    result
}

#[instrument(skip(ctx), fields(name = %obj.name_any()))]
async fn reconcile_replacement_object(
    obj: Arc<NodeReplacement>,
    ctx: Arc<ControllerState>,
) -> Result<Action> {
    info!(
        "Reconciling NodeReplacement {} for node {} ({})",
        obj.name_any(),
        obj.spec.node_name,
        obj.phase()
    );
    let result = reconcile_replacement(ctx.cluster.as_ref(), &ctx.config, &obj).await;
    metrics::record_reconcile("replacement", outcome_label(&result));
    result
}

/// Requeue delay for a failed reconcile
pub fn retry_delay(error: &Error) -> Duration {
    if error.is_conflict() {
        Duration::from_secs(1)
    } else if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}

fn rollout_error_policy(obj: Arc<NodeRollout>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    if error.is_conflict() {
        warn!("Conflict writing NodeRollout {}, retrying", obj.name_any());
    } else {
        error!("Reconciliation error for NodeRollout {}: {:?}", obj.name_any(), error);
    }
    Action::requeue(retry_delay(error))
}

fn replacement_error_policy(
    obj: Arc<NodeReplacement>,
    error: &Error,
    _ctx: Arc<ControllerState>,
) -> Action {
    if error.is_conflict() {
        warn!("Conflict writing NodeReplacement {}, retrying", obj.name_any());
    } else {
        error!(
            "Reconciliation error for NodeReplacement {}: {:?}",
            obj.name_any(),
            error
        );
    }
    Action::requeue(retry_delay(error))
}

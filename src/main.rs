//! node-rollout-operator binary
//!
//! - `node-rollout-operator run` starts both controllers and the HTTP server
//! - `node-rollout-operator crd` prints the CustomResourceDefinitions as YAML

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use node_rollout_operator::config::RunArgs;
use node_rollout_operator::controller::{run_controllers, ControllerState};
use node_rollout_operator::crd::{NodeReplacement, NodeRollout};
use node_rollout_operator::rest_api;

#[derive(Parser)]
#[command(name = "node-rollout-operator")]
#[command(about = "Drains and replaces Kubernetes nodes in priority order", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controllers
    Run(RunArgs),
    /// Print the CRDs as YAML
    Crd,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_crds() -> anyhow::Result<()> {
    let rollout = serde_yaml::to_string(&NodeRollout::crd())?;
    let replacement = serde_yaml::to_string(&NodeReplacement::crd())?;
    print!("{}---\n{}", rollout, replacement);
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(args.log_json);
    info!(
        "Starting node-rollout-operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let config = args.operator_config();
    info!(
        "Eviction grace period {:?}, rollout max age {:?}",
        config.eviction_grace_period, config.rollout_max_age
    );
    let state = Arc::new(ControllerState::new(client.clone(), config));

    let http_addr = args.http_addr;
    tokio::spawn(async move {
        if let Err(e) = rest_api::run_server(http_addr).await {
            error!("HTTP server error: {:?}", e);
        }
    });

    run_controllers(client, state)
        .await
        .context("controllers stopped with an error")?;

    info!("Controllers shut down");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Crd => print_crds(),
    }
}

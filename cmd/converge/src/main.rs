use clap::Parser;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use pkg_constants::controller::{
    AUTOSCALE_INTERVAL_SECS, RECONCILE_INTERVAL_SECS, ROLLOUT_INTERVAL_SECS,
};
use pkg_constants::paths::{DEFAULT_CONFIG, DEFAULT_DATA_DIR};
use pkg_constants::state::DEPLOYMENTS_PREFIX;
use pkg_controllers::autoscale::AutoscaleController;
use pkg_controllers::replicaset::ReplicaSetReconciler;
use pkg_controllers::rollout::RolloutController;
use pkg_runtime::SimulatedRuntime;
use pkg_state::client::StateStore;
use pkg_types::config::{ControllerConfigFile, load_config_file};
use pkg_types::deployment::{Deployment, DeploymentSpec};
use pkg_types::validate::validate_deployment;

#[derive(Parser, Debug)]
#[command(name = "converge", about = "converge deployment control plane")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_CONFIG)]
    config: String,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Use an in-memory state store (nothing survives a restart)
    #[arg(long)]
    in_memory: bool,

    /// Deployment manifest(s) to apply on startup, YAML
    #[arg(long = "apply")]
    apply: Vec<String>,
}

/// On-disk Deployment manifest: a name plus the desired spec.
#[derive(Debug, Deserialize)]
struct DeploymentManifest {
    name: String,
    spec: DeploymentSpec,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: ControllerConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let data_dir = cli
        .data_dir
        .or(file_cfg.data_dir)
        .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
    let reconcile_interval = file_cfg
        .reconcile_interval_secs
        .unwrap_or(RECONCILE_INTERVAL_SECS);
    let rollout_interval = file_cfg
        .rollout_interval_secs
        .unwrap_or(ROLLOUT_INTERVAL_SECS);
    let autoscale_interval = file_cfg
        .autoscale_interval_secs
        .unwrap_or(AUTOSCALE_INTERVAL_SECS);

    info!("Starting converge");
    if cli.in_memory {
        info!("  Store:     in-memory");
    } else {
        info!("  Data dir:  {}", data_dir);
    }
    info!("  Intervals: reconcile={reconcile_interval}s rollout={rollout_interval}s autoscale={autoscale_interval}s");

    let store = if cli.in_memory {
        StateStore::new_in_memory().await?
    } else {
        StateStore::new(&data_dir).await?
    };
    let runtime = Arc::new(SimulatedRuntime::new());

    for path in &cli.apply {
        apply_manifest(&store, path).await?;
    }

    let reconciler = ReplicaSetReconciler::new(store.clone(), runtime.clone())
        .with_interval(Duration::from_secs(reconcile_interval))
        .start();
    let rollout = RolloutController::new(store.clone())
        .with_interval(Duration::from_secs(rollout_interval))
        .start();
    let autoscale = AutoscaleController::new(store.clone(), runtime)
        .with_interval(Duration::from_secs(autoscale_interval))
        .start();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    reconciler.abort();
    rollout.abort();
    autoscale.abort();
    store.close().await?;
    Ok(())
}

/// Apply one manifest: create the Deployment, or update the spec of the
/// existing Deployment with the same name (generation bumps so controllers
/// pick it up).
async fn apply_manifest(store: &StateStore, path: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read manifest {}: {}", path, e))?;
    let manifest: DeploymentManifest = serde_yaml::from_str(&content)?;

    let existing = store
        .list_prefix_json::<Deployment>(DEPLOYMENTS_PREFIX)
        .await?
        .into_iter()
        .find(|(_, d, _)| d.name == manifest.name);

    match existing {
        Some((key, mut deploy, _)) => {
            deploy.spec = manifest.spec;
            deploy.generation += 1;
            validate_deployment(&deploy)?;
            store.put_json(&key, &deploy).await?;
            info!(
                "Updated deployment {} (generation {})",
                deploy.name, deploy.generation
            );
        }
        None => {
            let deploy = Deployment {
                id: Uuid::new_v4().to_string(),
                name: manifest.name,
                spec: manifest.spec,
                status: Default::default(),
                generation: 1,
                observed_generation: 0,
                active_replicaset: None,
                previous_replicaset: None,
                history: Vec::new(),
                created_at: chrono::Utc::now(),
            };
            validate_deployment(&deploy)?;
            store
                .put_json(&format!("{}{}", DEPLOYMENTS_PREFIX, deploy.id), &deploy)
                .await?;
            info!("Created deployment {} ({})", deploy.name, deploy.id);
        }
    }
    Ok(())
}

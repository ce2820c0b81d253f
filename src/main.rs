//! CacheWorkerSet controller - ordinal cache worker management for Kubernetes

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use cacheworkerset::config::ControllerConfig;
use cacheworkerset::controller::{error_policy, reconcile, Context};
use cacheworkerset::crd::CacheWorkerSet;
use cacheworkerset::retry::{retry_with_backoff, RetryPolicy};
use cacheworkerset::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use cacheworkerset::workerset::{scale_worker_set, KubeWorkerSetSource, WorkerSet, WorkerType};
use cacheworkerset::DEFAULT_FIELD_MANAGER;

/// CacheWorkerSet - StatefulSet-style controller for distributed cache workers
#[derive(Parser, Debug)]
#[command(name = "cacheworkerset", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log line format
    #[arg(long, value_enum, env = "CWS_LOG_FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// OTLP collector endpoint for traces and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT", global = true)]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches CacheWorkerSets and the pods they own, reconciling each set
    /// towards its desired replicas, template revision and reservations.
    Controller(ControllerArgs),

    /// Show the replica summary of a cache worker set
    Inspect(WorkerSetArgs),

    /// Change the replica count of a CacheWorkerSet
    Scale(ScaleArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Field manager recorded on writes and events
    #[arg(long, env = "CWS_FIELD_MANAGER", default_value = DEFAULT_FIELD_MANAGER)]
    field_manager: String,

    /// Seconds before a converged set is looked at again
    #[arg(long, default_value = "300")]
    requeue_secs: u64,

    /// Seconds before a failed pass is retried
    #[arg(long, default_value = "5")]
    error_requeue_secs: u64,

    /// Seconds a scale-in mark stands before the pod is removed
    #[arg(long, env = "CWS_SCALE_IN_WINDOW_SECS", default_value = "30")]
    scale_in_window_secs: u64,

    /// Do not install or update the CRD on startup
    #[arg(long)]
    skip_crd_install: bool,
}

impl ControllerArgs {
    fn config(&self) -> ControllerConfig {
        ControllerConfig::default()
            .with_field_manager(&self.field_manager)
            .with_requeue(
                Duration::from_secs(self.requeue_secs),
                Duration::from_secs(self.error_requeue_secs),
            )
            .with_scale_in_window(Duration::from_secs(self.scale_in_window_secs))
    }
}

/// Identifies one worker set
#[derive(Parser, Debug)]
struct WorkerSetArgs {
    /// Name of the worker set
    name: String,

    /// Namespace of the worker set
    #[arg(short, long, default_value = "default")]
    namespace: String,

    /// Kind of workload backing the workers
    #[arg(long = "type", default_value = "statefulset")]
    worker_type: WorkerType,
}

/// Scale mode arguments
#[derive(Parser, Debug)]
struct ScaleArgs {
    /// Name of the CacheWorkerSet
    name: String,

    /// Namespace of the CacheWorkerSet
    #[arg(short, long, default_value = "default")]
    namespace: String,

    /// New replica count
    #[arg(long)]
    replicas: i32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&CacheWorkerSet::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: DEFAULT_FIELD_MANAGER.to_string(),
        otlp_endpoint: cli.otlp_endpoint.clone(),
        log_format: cli.log_format,
    })?;

    match cli.command {
        Some(Commands::Inspect(args)) => run_inspect(args).await,
        Some(Commands::Scale(args)) => run_scale(args).await,
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::parse_from(["controller"])).await,
    }
}

async fn kube_client() -> anyhow::Result<Client> {
    Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))
}

/// Ensure the CacheWorkerSet CRD is installed
///
/// Uses server-side apply so the installed schema always matches this
/// binary.
async fn ensure_crds_installed(client: &Client, field_manager: &str) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(field_manager).force();
    let crd = CacheWorkerSet::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();

    tracing::info!(crd = %name, "Installing CacheWorkerSet CRD...");
    retry_with_backoff(&RetryPolicy::with_max_attempts(5), "install_crd", || {
        let (crds, params, crd, name) = (crds.clone(), params.clone(), crd.clone(), name.clone());
        async move { crds.patch(&name, &params, &Patch::Apply(&crd)).await }
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install CacheWorkerSet CRD: {}", e))?;

    tracing::info!("CacheWorkerSet CRD installed/updated");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("CacheWorkerSet controller starting...");
    let config = args.config();
    let client = kube_client().await?;

    if !args.skip_crd_install {
        ensure_crds_installed(&client, &config.field_manager).await?;
    }

    let ctx = Arc::new(Context::builder(client.clone()).config(config).build());

    let sets: Api<CacheWorkerSet> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);

    Controller::new(sets, WatcherConfig::default())
        .owns(pods, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "CacheWorkerSet reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "CacheWorkerSet reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("CacheWorkerSet controller shutting down");
    Ok(())
}

async fn run_inspect(args: WorkerSetArgs) -> anyhow::Result<()> {
    let source = KubeWorkerSetSource::new(kube_client().await?, DEFAULT_FIELD_MANAGER);
    let set = WorkerSet::lookup(&source, &args.name, &args.namespace, args.worker_type).await?;

    println!("type:      {}", set.worker_type());
    println!("replicas:  {}", set.replicas());
    println!("ready:     {}", set.ready_replicas());
    println!("current:   {}", set.current_replicas());
    println!("deleting:  {}", set.is_deleting());
    for (key, value) in set.node_selector() {
        println!("node:      {key}={value}");
    }
    Ok(())
}

async fn run_scale(args: ScaleArgs) -> anyhow::Result<()> {
    if args.replicas < 0 {
        anyhow::bail!("replicas must be non-negative, got {}", args.replicas);
    }
    let source = KubeWorkerSetSource::new(kube_client().await?, DEFAULT_FIELD_MANAGER);
    scale_worker_set(
        &source,
        &args.name,
        &args.namespace,
        args.replicas,
        &RetryPolicy::conflict(),
    )
    .await?;
    tracing::info!(set = %args.name, replicas = args.replicas, "Scaled CacheWorkerSet");
    Ok(())
}

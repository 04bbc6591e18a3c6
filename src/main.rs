//! iSCSI Provisioner
//!
//! Dynamic PersistentVolume provisioner allocating iSCSI storage through a
//! shell script or a storage-management REST server.

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::net::SocketAddr;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use iscsi_provisioner::server::{self, ServerState, DEFAULT_HTTP_ADDR};
use iscsi_provisioner::{
    BackendFactory, ControllerContext, Error, KubeEventRecorder, KubeVolumeStore, Metrics,
    OperationMode, ProvisionController, ProvisionerConfig, Result, WatchAdapter,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Dynamic iSCSI PersistentVolume provisioner
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; flags override its values
    #[arg(long, env = "PROVISIONER_CONFIG")]
    config: Option<PathBuf>,

    /// Provisioner identity matched against StorageClass.provisioner
    #[arg(long, env = "PROVISIONER_NAME")]
    provisioner_name: Option<String>,

    /// Backend mode (script, restapi)
    #[arg(long, env = "EXEC_MODE")]
    exec_mode: Option<OperationMode>,

    /// Allocation script, run as `sh <script> <pv-name>`
    #[arg(long, env = "SCRIPT_PATH")]
    script_path: Option<PathBuf>,

    /// Deallocation script, run as `sh <script> <pv-name>`
    #[arg(long, env = "DELETE_SCRIPT_PATH")]
    delete_script_path: Option<PathBuf>,

    /// Directory where the scripts run and leave volume artifacts
    #[arg(long, env = "ARTIFACT_DIR")]
    artifact_dir: Option<PathBuf>,

    /// REST server URL
    #[arg(long, env = "REST_URL")]
    rest_url: Option<String>,

    /// REST user
    #[arg(long, env = "REST_USER")]
    rest_user: Option<String>,

    /// REST password
    #[arg(long, env = "REST_KEY", hide_env_values = true)]
    rest_key: Option<String>,

    /// Resync period in seconds
    #[arg(long, env = "RESYNC_PERIOD")]
    resync_period_secs: Option<u64>,

    /// Attempts for saving a provisioned volume
    #[arg(long, env = "RETRY_COUNT")]
    retry_count: Option<u32>,

    /// Seconds between save attempts
    #[arg(long, env = "RETRY_INTERVAL")]
    retry_interval_secs: Option<u64>,

    /// Kubeconfig path, for running outside the cluster
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// API server URL, overrides the kubeconfig
    #[arg(long, env = "KUBE_MASTER")]
    master: Option<String>,

    /// Health and metrics bind address
    #[arg(long, env = "HTTP_ADDR", default_value = DEFAULT_HTTP_ADDR)]
    http_addr: String,

    /// Instance name reported on events
    #[arg(long, env = "HOSTNAME")]
    instance: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = provisioner_config(&args)?;
    let http_addr: SocketAddr = args
        .http_addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid HTTP address: {}", e)))?;

    info!("Starting {}", iscsi_provisioner::NAME);
    info!("  Version: {}", iscsi_provisioner::VERSION);
    info!("  Provisioner: {}", config.provisioner_name);
    info!("  Backend mode: {}", config.backend.mode);
    info!("  Resync period: {:?}", config.resync_period);
    info!(
        "  Save retries: {} every {:?}",
        config.retry_count, config.retry_interval
    );

    let client = kube_client(&args).await?;
    let backend = BackendFactory::create(&config.backend)?;
    info!("Backend initialized: {}", backend.backend_name());

    let metrics = Metrics::new()?;
    let watches = WatchAdapter::new(client.clone(), config.resync_period);
    let ctx = ControllerContext {
        volumes: Arc::new(KubeVolumeStore::new(client.clone())),
        classes: Arc::new(watches.class_cache()),
        backend,
        events: Arc::new(KubeEventRecorder::new(client, args.instance.clone())),
    };
    let controller =
        Arc::new(ProvisionController::new(&config, ctx).with_metrics(metrics.clone()));

    let shutdown = CancellationToken::new();

    let server_state = ServerState {
        metrics,
        scheduler: controller.scheduler().clone(),
        ready: watches.synced(),
    };
    let server_task = tokio::spawn(server::run(http_addr, server_state, shutdown.clone()));
    let watch_task = tokio::spawn(watches.run(controller.clone(), shutdown.clone()));

    let result = supervise(server_task, watch_task, shutdown, shutdown_signal()).await;
    info!(
        running = controller.scheduler().len(),
        "Provisioner shutdown complete"
    );
    result
}

/// Wait for a signal or for either task to stop, then cancel and drain.
///
/// A task that fails, panics or stops before shutdown was requested turns
/// into the returned error, so startup failures exit non-zero.
async fn supervise(
    mut server_task: JoinHandle<Result<()>>,
    mut watch_task: JoinHandle<Result<()>>,
    shutdown: CancellationToken,
    signal: impl Future<Output = ()>,
) -> Result<()> {
    let mut server_done = None;
    let mut watch_done = None;

    tokio::select! {
        _ = signal => info!("Shutdown signal received"),
        res = &mut server_task => server_done = Some(stopped_early(HTTP_TASK, res)),
        res = &mut watch_task => watch_done = Some(stopped_early(WATCH_TASK, res)),
    }

    shutdown.cancel();
    let drain = async {
        if server_done.is_none() {
            server_done = Some(task_result(HTTP_TASK, server_task.await));
        }
        if watch_done.is_none() {
            watch_done = Some(task_result(WATCH_TASK, watch_task.await));
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("Tasks did not stop within {:?}", DRAIN_TIMEOUT);
    }

    server_done
        .unwrap_or(Ok(()))
        .and(watch_done.unwrap_or(Ok(())))
}

const HTTP_TASK: &str = "HTTP server";
const WATCH_TASK: &str = "Watches";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn task_result(task: &str, res: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("{} failed: {}", task, e);
            Err(e)
        }
        Err(e) => {
            error!("{} task aborted: {}", task, e);
            Err(Error::Internal(format!("{} task aborted: {}", task, e)))
        }
    }
}

/// Result of a task that finished before shutdown was requested
fn stopped_early(task: &str, res: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    task_result(task, res)?;
    error!("{} stopped unexpectedly", task);
    Err(Error::Internal(format!("{} stopped unexpectedly", task)))
}

/// Merge the optional config file with flags
fn provisioner_config(args: &Args) -> Result<ProvisionerConfig> {
    let mut config = match &args.config {
        Some(path) => ProvisionerConfig::from_file(path)?,
        None => ProvisionerConfig::default(),
    };

    if let Some(name) = &args.provisioner_name {
        config.provisioner_name = name.clone();
    }
    if let Some(mode) = args.exec_mode {
        config.backend.mode = mode;
    }
    if let Some(path) = &args.script_path {
        config.backend.script_path = Some(path.clone());
    }
    if let Some(path) = &args.delete_script_path {
        config.backend.delete_script_path = Some(path.clone());
    }
    if let Some(dir) = &args.artifact_dir {
        config.backend.artifact_dir = dir.clone();
    }
    if let Some(url) = &args.rest_url {
        config.backend.rest_url = url.clone();
    }
    if let Some(user) = &args.rest_user {
        config.backend.rest_user = user.clone();
    }
    if let Some(key) = &args.rest_key {
        config.backend.rest_key = Some(key.clone());
    }
    if let Some(secs) = args.resync_period_secs {
        config.resync_period = Duration::from_secs(secs);
    }
    if let Some(count) = args.retry_count {
        config.retry_count = count;
    }
    if let Some(secs) = args.retry_interval_secs {
        config.retry_interval = Duration::from_secs(secs);
    }

    config.validate()?;
    Ok(config)
}

/// In-cluster or kubeconfig client, optionally pointed at another master
async fn kube_client(args: &Args) -> Result<Client> {
    let mut config = match &args.kubeconfig {
        Some(path) => {
            let kubeconfig =
                Kubeconfig::read_from(path).map_err(|e| Error::Kubeconfig(e.to_string()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::Kubeconfig(e.to_string()))?
        }
        None => kube::Config::infer()
            .await
            .map_err(|e| Error::Kubeconfig(e.to_string()))?,
    };

    if let Some(master) = &args.master {
        config.cluster_url = master
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid master URL {}: {}", master, e)))?;
    }

    info!("Connecting to {}", config.cluster_url);
    Ok(Client::try_from(config)?)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "tower_http=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

//! Storeplane control-plane daemon
//!
//! Hosts the two halves of the platform in one process: the intent HTTP
//! API and the Store operator. The concurrency gate, owner quota, and
//! event bus are singletons created here and passed by reference to both.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storeplane_api::prelude::{AppState, OwnerQuota, Privileged, StoreClient, WriteRateLimiter};
use storeplane_bus::EventBus;
use storeplane_operator::prelude::{
    run_controller, ConcurrencyGate, ControllerContext, HelmRenderer, OperatorConfig,
    StatusManager, Store,
};
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Storeplane control-plane daemon
#[derive(Parser, Debug)]
#[command(name = "storeplaned")]
#[command(about = "Multi-tenant store provisioning control plane")]
#[command(version)]
struct Args {
    /// Intent API listen address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,

    /// Global cap on in-flight reconciliations
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 3)]
    max_concurrent_reconciles: usize,

    /// Seconds between drift checks for Ready stores
    #[arg(long, env = "DRIFT_INTERVAL_SECONDS", default_value_t = 120)]
    drift_interval_seconds: u64,

    /// Initial reconcile backoff in seconds
    #[arg(long, env = "RECONCILE_BACKOFF_INITIAL", default_value_t = 5)]
    reconcile_backoff_initial: u64,

    /// Reconcile backoff multiplier
    #[arg(long, env = "RECONCILE_BACKOFF_FACTOR", default_value_t = 2)]
    reconcile_backoff_factor: u32,

    /// Reconcile backoff cap in seconds
    #[arg(long, env = "RECONCILE_BACKOFF_CAP", default_value_t = 60)]
    reconcile_backoff_cap: u64,

    /// Stores one owner may hold
    #[arg(long, env = "PER_OWNER_STORE_CAP", default_value_t = 5)]
    per_owner_store_cap: usize,

    /// Bound on the in-status activity log
    #[arg(long, env = "ACTIVITY_LOG_CAPACITY", default_value_t = 15)]
    activity_log_capacity: usize,

    /// Events retained per store on the durable bus stream
    #[arg(long, env = "DURABLE_STREAM_RETENTION", default_value_t = 256)]
    durable_stream_retention: usize,

    /// One readiness poll slice in seconds
    #[arg(long, env = "READINESS_SLICE_SECONDS", default_value_t = 5)]
    readiness_slice_seconds: u64,

    /// Template renderer deadline in seconds
    #[arg(long, env = "RENDERER_TIMEOUT_SECONDS", default_value_t = 60)]
    renderer_timeout_seconds: u64,

    /// Cluster API call deadline in seconds
    #[arg(long, env = "API_TIMEOUT_SECONDS", default_value_t = 10)]
    api_timeout_seconds: u64,

    /// Domain suffix for public store URLs
    #[arg(long, env = "DOMAIN_SUFFIX", default_value = "shops.local")]
    domain_suffix: String,

    /// Chart handed to the template renderer
    #[arg(long, env = "CHART_PATH", default_value = "/charts/store-stack")]
    chart_path: PathBuf,

    /// Namespace of the ingress controller admitted into tenant partitions
    #[arg(long, env = "INGRESS_NAMESPACE", default_value = "ingress-nginx")]
    ingress_namespace: String,

    /// Identities that may see every owner's stores (comma-separated)
    #[arg(
        long,
        env = "PRIVILEGED_IDENTITIES",
        default_value = "admin",
        value_delimiter = ','
    )]
    privileged_identities: Vec<String>,

    /// Create calls allowed per identity per minute
    #[arg(long, env = "RATE_LIMIT_CREATE_PER_MINUTE", default_value_t = 10)]
    rate_limit_create_per_minute: u32,

    /// Delete calls allowed per identity per minute
    #[arg(long, env = "RATE_LIMIT_DELETE_PER_MINUTE", default_value_t = 30)]
    rate_limit_delete_per_minute: u32,

    /// Start with the durable bus surface disabled
    #[arg(long, env = "DISABLE_BUS", default_value_t = false)]
    disable_bus: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    log_json: bool,

    /// Print the Store CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %args.listen_addr,
        "Starting storeplane control plane"
    );

    // Metrics recorder; the handle backs the intent API's /metrics route.
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    // Process-wide singletons shared by the operator and the intent layer.
    let bus = Arc::new(if args.disable_bus {
        EventBus::degraded(args.durable_stream_retention)
    } else {
        EventBus::new(args.durable_stream_retention)
    });
    let gate = Arc::new(ConcurrencyGate::new(args.max_concurrent_reconciles));
    let quota = Arc::new(OwnerQuota::new(args.per_owner_store_cap));
    let limiter = Arc::new(WriteRateLimiter::new(
        args.rate_limit_create_per_minute,
        args.rate_limit_delete_per_minute,
    ));

    let config = OperatorConfig {
        max_concurrent_reconciles: args.max_concurrent_reconciles,
        drift_interval: Duration::from_secs(args.drift_interval_seconds),
        backoff_initial: Duration::from_secs(args.reconcile_backoff_initial),
        backoff_factor: args.reconcile_backoff_factor,
        backoff_cap: Duration::from_secs(args.reconcile_backoff_cap),
        max_stage_attempts: 3,
        activity_log_capacity: args.activity_log_capacity,
        readiness_slice: Duration::from_secs(args.readiness_slice_seconds),
        renderer_timeout: Duration::from_secs(args.renderer_timeout_seconds),
        api_timeout: Duration::from_secs(args.api_timeout_seconds),
        domain_suffix: args.domain_suffix.clone(),
        chart_path: args.chart_path.clone(),
        ingress_namespace: args.ingress_namespace.clone(),
    };

    let renderer = Arc::new(HelmRenderer::new(
        args.chart_path.clone(),
        config.renderer_timeout,
    ));
    let status = StatusManager::new(client.clone(), bus.clone(), args.activity_log_capacity);

    let ctx = Arc::new(ControllerContext {
        client: client.clone(),
        status,
        renderer,
        gate,
        config,
        stage_attempts: dashmap::DashMap::new(),
        error_counts: dashmap::DashMap::new(),
    });

    let state = AppState::new(
        StoreClient::new(client, Duration::from_secs(args.api_timeout_seconds)),
        bus,
        quota,
        limiter,
        Privileged::new(args.privileged_identities.clone()),
        metrics_handle,
    );
    state.seed_quota().await;

    let listen_addr = args.listen_addr;
    tokio::spawn(async move {
        if let Err(e) = storeplane_api::server::serve(listen_addr, state).await {
            tracing::error!(error = %e, "Intent API server failed");
        }
    });

    run_controller(ctx).await.context("Controller failed")?;

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Print the CRD YAML for installation
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    let crd = Store::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{}", yaml);

    Ok(())
}

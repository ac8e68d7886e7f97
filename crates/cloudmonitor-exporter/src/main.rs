#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod auth;
mod handlers;
mod openapi;
mod state;

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use cloudmonitor_core::catalog::{Catalog, CategoryId};
use cloudmonitor_core::collector::{Collector, CollectorConfig};
use cloudmonitor_core::exposition::Exposition;
use cloudmonitor_core::upstream::{AliyunClient, AliyunConfig};

use auth::AccessLogLayer;
use openapi::ApiDoc;
use state::{ExporterState, SharedState};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// CloudMonitor keeps raw data points for 31 days.
const MAX_LOOKBACK_SECS: u64 = 31 * 24 * 3600;

/// Path prefixes owned by the fixed routes; the metrics path must avoid them.
const RESERVED_PREFIXES: &[&str] = &["/api/", "/api-docs", "/swagger-ui"];

// ============================================================
// CLI
// ============================================================

#[derive(Parser)]
#[command(
    name = "cloudmonitor-exporter",
    about = "Exports Aliyun CloudMonitor metrics in Prometheus format",
    version = cloudmonitor_core::VERSION
)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:9525", env = "CLOUDMONITOR_LISTEN")]
    listen: String,

    /// Path the scrape endpoint is served on.
    #[arg(long, default_value = "/metrics", env = "CLOUDMONITOR_METRICS_PATH")]
    metrics_path: String,

    /// CloudMonitor region.
    #[arg(long, default_value = "cn-hangzhou", env = "ALIBABA_CLOUD_REGION_ID")]
    region: String,

    /// Access key ID.
    #[arg(long, env = "ALIBABA_CLOUD_ACCESS_KEY_ID", hide_env_values = true)]
    access_key_id: String,

    /// Access key secret.
    #[arg(long, env = "ALIBABA_CLOUD_ACCESS_KEY_SECRET", hide_env_values = true)]
    access_key_secret: String,

    /// API endpoint override. Derived from the region if not set.
    #[arg(long, env = "CLOUDMONITOR_ENDPOINT")]
    endpoint: Option<String>,

    /// Comma-separated resource categories to export (nat, slb, rds).
    #[arg(
        long,
        env = "CLOUDMONITOR_CATEGORIES",
        default_value = "nat,slb,rds",
        value_delimiter = ','
    )]
    categories: Vec<String>,

    /// Lookback window in seconds for the most recent interval.
    #[arg(long, default_value = "300", env = "CLOUDMONITOR_LOOKBACK")]
    lookback: u64,

    /// Aggregation period in seconds requested from the API.
    #[arg(long, default_value = "60", env = "CLOUDMONITOR_PERIOD")]
    period: u64,

    /// Maximum upstream requests in flight per scrape.
    #[arg(long, default_value = "8", env = "CLOUDMONITOR_CONCURRENCY")]
    concurrency: usize,

    /// Per-request upstream timeout in seconds.
    #[arg(long, default_value = "10", env = "CLOUDMONITOR_TIMEOUT")]
    timeout: u64,

    /// Basic Auth username. If set, --auth-password is also required.
    #[arg(long, env = "CLOUDMONITOR_AUTH_USER")]
    auth_user: Option<String>,

    /// Basic Auth password.
    #[arg(long, env = "CLOUDMONITOR_AUTH_PASSWORD", hide_env_values = true)]
    auth_password: Option<String>,

    /// Increase verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };
    runtime.block_on(async_main(args));
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["cloudmonitor_exporter", "cloudmonitor_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn async_main(args: Args) {
    info!(version = cloudmonitor_core::VERSION, "starting cloudmonitor-exporter");

    let categories = match validate(&args) {
        Ok(c) => c,
        Err(reason) => {
            error!("invalid configuration: {reason}");
            process::exit(1);
        }
    };

    let catalog = match Catalog::builtin() {
        Ok(c) => Arc::new(c.restrict_to(&categories)),
        Err(e) => {
            error!(error = %e, "metric catalog is invalid");
            process::exit(1);
        }
    };

    let exposition = match Exposition::new(&catalog) {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "failed to register metric descriptors");
            process::exit(1);
        }
    };

    let mut upstream = AliyunConfig::new(&args.access_key_id, &args.access_key_secret, &args.region);
    upstream.endpoint = args.endpoint.clone();
    upstream.period = Duration::from_secs(args.period);
    upstream.timeout = Duration::from_secs(args.timeout);

    let client = match AliyunClient::new(upstream) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build CloudMonitor client");
            process::exit(1);
        }
    };

    let endpoint = client.endpoint().to_string();
    let config = CollectorConfig {
        lookback: Duration::from_secs(args.lookback),
        concurrency: args.concurrency,
    };
    let collector = Collector::new(catalog, Arc::new(client), config);

    info!(
        region = %args.region,
        endpoint = %endpoint,
        categories = ?categories.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
        metrics = collector.catalog().len(),
        lookback_secs = collector.config().lookback.as_secs(),
        concurrency = collector.config().concurrency,
        "collector configured"
    );

    // Basic Auth
    let auth_creds: Option<Arc<(String, String)>> = match (&args.auth_user, &args.auth_password) {
        (Some(user), Some(pass)) => {
            info!("basic auth enabled");
            Some(Arc::new((user.clone(), pass.clone())))
        }
        (Some(_), None) | (None, Some(_)) => {
            error!("--auth-user and --auth-password must both be set");
            process::exit(1);
        }
        _ => None,
    };

    let state: SharedState = Arc::new(ExporterState {
        collector,
        exposition,
        metrics_path: args.metrics_path.clone(),
    });

    let app = build_router(state, auth_creds).into_make_service_with_connect_info::<SocketAddr>();

    let addr: SocketAddr = match args.listen.parse() {
        Ok(a) => a,
        Err(e) => {
            error!(listen = %args.listen, error = %e, "invalid listen address");
            process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind");
            process::exit(1);
        }
    };
    info!(%addr, metrics_path = %args.metrics_path, "listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
        process::exit(1);
    }
    info!("shutdown complete");
}

fn build_router(state: SharedState, auth_creds: Option<Arc<(String, String)>>) -> Router {
    let metrics_path = state.metrics_path.clone();

    let mut app = Router::new()
        .route("/", get(handlers::handle_index))
        .route(&metrics_path, get(handlers::handle_metrics))
        .route("/api/v1/health", get(handlers::handle_health))
        .route("/api/v1/catalog", get(handlers::handle_catalog))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state);

    // Access log wraps auth so it sees the AuthUser extension.
    app = app.layer(AccessLogLayer);

    if let Some(creds) = auth_creds {
        app = app.layer(axum::middleware::from_fn_with_state(
            creds,
            auth::basic_auth_middleware,
        ));
    }

    app.layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
}

/// Checks option ranges and resolves the enabled categories.
fn validate(args: &Args) -> Result<Vec<CategoryId>, String> {
    if args.lookback == 0 || args.lookback > MAX_LOOKBACK_SECS {
        return Err(format!(
            "--lookback must be between 1 and {MAX_LOOKBACK_SECS} seconds, got {}",
            args.lookback
        ));
    }
    if args.period == 0 {
        return Err("--period must be at least 1 second".to_string());
    }
    if args.timeout == 0 {
        return Err("--timeout must be at least 1 second".to_string());
    }
    if args.concurrency == 0 {
        return Err("--concurrency must be at least 1".to_string());
    }
    validate_metrics_path(&args.metrics_path)
        .map_err(|reason| format!("--metrics-path {}: {reason}", args.metrics_path))?;

    let categories =
        parse_categories(&args.categories).map_err(|e| format!("--categories: {e}"))?;
    if categories.is_empty() {
        return Err("--categories enables no resource category".to_string());
    }
    Ok(categories)
}

fn parse_categories(raw: &[String]) -> Result<Vec<CategoryId>, cloudmonitor_core::catalog::CatalogError> {
    let mut out = Vec::new();
    for s in raw.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let id: CategoryId = s.parse()?;
        if !out.contains(&id) {
            out.push(id);
        }
    }
    Ok(out)
}

fn validate_metrics_path(path: &str) -> Result<(), &'static str> {
    if !path.starts_with('/') {
        return Err("must start with '/'");
    }
    if path == "/" {
        return Err("'/' is the landing page");
    }
    if RESERVED_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return Err("collides with a built-in route");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining connections");
}

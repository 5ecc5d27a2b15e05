//! StrataStor engine node
//!
//! Loads a cluster description, runs the engine over the in-memory adapters
//! with background rebuild workers, and serves probes and metrics.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       stratastor                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │  cluster.yaml ──▶ Topology + NodeRegistry ──▶ Engine          │
//! │                                                │              │
//! │        /healthz /readyz ◀── health server      │ rebuild      │
//! │        /metrics         ◀── metrics server ◀───┘ workers      │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stratastor::adapters::{
    InMemoryBlockStore, InMemoryMetadataStore, LoggingEventPublisher, StaticNodeRegistry,
};
use stratastor::config::ClusterConfig;
use stratastor::engine::{Engine, EnginePorts};

// =============================================================================
// CLI Arguments
// =============================================================================

/// StrataStor - erasure-coded object storage engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cluster description (YAML)
    #[arg(long, env = "STRATASTOR_CONFIG", default_value = "/etc/stratastor/cluster.yaml")]
    config: PathBuf,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Validate the cluster description and exit
    #[arg(long)]
    check: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting StrataStor");
    info!("  Cluster config: {}", args.config.display());

    let cluster = ClusterConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let topology = cluster.topology().context("invalid cluster topology")?;
    let engine_config = cluster.engine_config().context("invalid engine settings")?;

    info!(
        "  System: {} ({} pools, {} nodes, {} tiers)",
        topology.system_id,
        topology.pools().count(),
        cluster.nodes.len(),
        topology.tiers().count()
    );
    info!("  Liveness timeout: {:?}", engine_config.liveness_timeout);
    info!("  Rebuild scan interval: {:?}", engine_config.rebuild.scan_interval);

    if args.check {
        info!("Cluster description is valid");
        return Ok(());
    }

    let ports = EnginePorts {
        store: Arc::new(InMemoryMetadataStore::new()),
        registry: Arc::new(StaticNodeRegistry::with_nodes(cluster.nodes.clone())),
        blocks: Arc::new(InMemoryBlockStore::new()),
        publisher: Arc::new(LoggingEventPublisher::new()),
    };
    let engine = Arc::new(Engine::new(engine_config, topology, ports).context("building engine")?);
    engine.start();

    let health_addr = args.health_addr.clone();
    let health_engine = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_engine).await {
            error!("Health server error: {:#}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    let metrics_engine = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_engine).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    engine.shutdown().await;
    info!("StrataStor shutdown complete");
    Ok(())
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
    for directive in ["hyper=warn", "h2=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
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

// =============================================================================
// HTTP Servers
// =============================================================================

type HttpResponse = Response<Full<Bytes>>;

fn respond(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn serve<F, Fut>(addr: &str, name: &'static str, handler: F) -> anyhow::Result<()>
where
    F: Fn(Request<hyper::body::Incoming>) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = std::result::Result<HttpResponse, std::convert::Infallible>>
        + Send
        + 'static,
{
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid {} server address {}", name, addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {} server", name))?;

    info!("{} server listening on {}", name, addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .with_context(|| format!("{} server accept error", name))?;
        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                error!("{} server connection error: {}", name, e);
            }
        });
    }
}

async fn run_health_server(addr: &str, engine: Arc<Engine>) -> anyhow::Result<()> {
    serve(addr, "Health", move |req: Request<hyper::body::Incoming>| {
        let engine = engine.clone();
        async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                "/readyz" if engine.is_running() => respond(StatusCode::OK, "ok"),
                "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "rebuild workers not running"),
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
            Ok(response)
        }
    })
    .await
}

async fn run_metrics_server(addr: &str, engine: Arc<Engine>) -> anyhow::Result<()> {
    serve(addr, "Metrics", move |req: Request<hyper::body::Incoming>| {
        let engine = engine.clone();
        async move {
            let response = match req.uri().path() {
                "/metrics" => match engine.metrics().render() {
                    Ok(body) => {
                        let mut response = respond(StatusCode::OK, body);
                        if let Ok(value) = "text/plain; version=0.0.4".parse() {
                            response.headers_mut().insert("Content-Type", value);
                        }
                        response
                    }
                    Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                },
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
            Ok(response)
        }
    })
    .await
}

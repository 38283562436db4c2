//! wsgate binary: CLI parsing, logging and metrics wiring, and the serve
//! loop. Everything behind the listener lives in the library crate.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use clap::Parser;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wsgate::error::GatewayError;
use wsgate::gateway::{Gateway, GatewayConfig};
use wsgate::metrics;
use wsgate::routes::ProxyRule;

#[derive(Parser, Debug)]
#[command(name = "wsgate", version, about = "WebSocket to HTTP JSON-RPC 2.0 bridging proxy")]
struct Args {
    /// WebSocket listen address.
    #[arg(short, long, env = "WSGATE_LISTEN", default_value = "localhost:8090")]
    listen: String,

    /// Comma-separated allow-list of headers clients may set via SET/AUTH
    /// control frames.
    #[arg(long, env = "WSGATE_HEADERS", default_value = "Authorization")]
    headers: String,

    /// Timeout in seconds for upstream HTTP requests.
    #[arg(short, long, env = "WSGATE_TIMEOUT", default_value_t = 20)]
    timeout: u64,

    /// Max parallel upstream requests per session.
    #[arg(short = 'c', long = "max-parallel", env = "WSGATE_MAX_PARALLEL", default_value_t = 10)]
    max_parallel: usize,

    /// Proxy rule mapping a WebSocket endpoint to an HTTP endpoint, like
    /// /rpc:http://localhost/rpc. Repeatable.
    #[arg(short, long = "route", required = true)]
    route: Vec<String>,

    /// Disable upstream TLS certificate verification.
    #[arg(long, env = "WSGATE_INSECURE_UPSTREAM")]
    insecure_upstream: bool,

    /// Enable debug output.
    #[arg(long)]
    verbose: bool,

    /// Enable trace output.
    #[arg(long)]
    trace: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_level = if args.trace {
        "trace"
    } else if args.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting wsgate");

    let rules = args
        .route
        .iter()
        .map(|v| ProxyRule::parse(v))
        .collect::<Result<Vec<_>, _>>()?;

    let config = GatewayConfig {
        listen_addr: args.listen.clone(),
        rules,
        allowed_headers: args
            .headers
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect(),
        timeout: Duration::from_secs(args.timeout),
        max_parallel_requests: args.max_parallel,
        insecure_upstream_tls: args.insecure_upstream,
    };
    if config.insecure_upstream_tls {
        warn!("upstream TLS certificate verification is disabled");
    }

    let registry = Registry::new();
    let mut gateway = Gateway::new(config)?;
    gateway.set_observability(metrics::install(&registry)?);
    let app = gateway.router().merge(metrics_router(registry));

    let shutdown = CancellationToken::new();
    spawn_signal_handlers(shutdown.clone());

    let listener = TcpListener::bind(&args.listen)
        .await
        .map_err(|source| GatewayError::Bind {
            addr: args.listen.clone(),
            source,
        })?;
    info!(addr = %args.listen, "wsgate listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .map_err(GatewayError::Serve)?;

    info!("shut down cleanly");
    Ok(())
}

/// SIGINT and SIGTERM both begin a graceful shutdown.
fn spawn_signal_handlers(shutdown: CancellationToken) {
    let sigint = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received SIGINT, shutting down");
                sigint.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM, shutting down");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen for SIGTERM"),
        }
    });
}

/// Prometheus exposition endpoint, mounted next to the gateway router.
fn metrics_router(registry: Registry) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let registry = registry.clone();
            async move {
                let encoder = TextEncoder::new();
                let mut buffer = Vec::new();
                if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("failed to encode metrics: {e}"),
                    )
                        .into_response();
                }
                (
                    [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                    buffer,
                )
                    .into_response()
            }
        }),
    )
}

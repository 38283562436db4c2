//! Gateway construction: one WebSocket endpoint per proxy rule plus the
//! multi-route endpoint, sharing a single upstream client, trace arbiter,
//! and metric sinks.
//!
//! [`Gateway::new`] validates the configuration and builds the process-wide
//! pieces; [`Gateway::router`] produces the axum router the host serves. The
//! router must be served with
//! `into_make_service_with_connect_info::<SocketAddr>()` so sessions can see
//! their peer address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ConnectInfo;
use axum::http::HeaderMap;
use axum::http::header::{self, HeaderName};
use axum::routing::{MethodRouter, get};
use tracing::info;

use crate::error::GatewayError;
use crate::forwarder::{self, SessionParams};
use crate::metrics::Observability;
use crate::routes::{ProxyRule, RouteMode, RouteTable};
use crate::trace::{self, TraceArbiter, TraceHandle};
use crate::upstream::{UpstreamClient, UpstreamConfig};

/// Gateway configuration, assembled by the host from CLI flags.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address, e.g. `localhost:8090`.
    pub listen_addr: String,
    /// Proxy rules. At least one is required.
    pub rules: Vec<ProxyRule>,
    /// Header names clients may set with `SET`/`AUTH` control frames.
    pub allowed_headers: Vec<String>,
    /// Per-request upstream deadline.
    pub timeout: Duration,
    /// Per-session cap on in-flight upstream requests.
    pub max_parallel_requests: usize,
    /// Disable upstream TLS certificate verification.
    pub insecure_upstream_tls: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "localhost:8090".to_string(),
            rules: Vec::new(),
            allowed_headers: vec!["Authorization".to_string()],
            timeout: Duration::from_secs(20),
            max_parallel_requests: 10,
            insecure_upstream_tls: false,
        }
    }
}

/// Process-wide state handed to every session.
#[derive(Clone)]
pub struct GatewayShared {
    pub upstream: UpstreamClient,
    pub max_parallel_requests: usize,
    pub allowed_headers: Vec<String>,
    pub obs: Observability,
    pub trace: TraceHandle,
}

/// The endpoint handler factory.
pub struct Gateway {
    config: GatewayConfig,
    table: Arc<RouteTable>,
    shared: GatewayShared,
}

impl Gateway {
    /// Build the gateway: validates rules, constructs the shared upstream
    /// client, and spawns the trace arbiter. Must be called on a runtime.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        if config.rules.is_empty() {
            return Err(GatewayError::NoRoutes);
        }

        let upstream = UpstreamClient::new(&UpstreamConfig {
            timeout: config.timeout,
            accept_invalid_certs: config.insecure_upstream_tls,
            ..Default::default()
        })?;
        let trace = TraceArbiter::spawn();
        let table = Arc::new(RouteTable::new(config.rules.clone()));

        for rule in table.rules() {
            info!(
                from = %format!("ws://{}{}", config.listen_addr, rule.src),
                to = %rule.dst_url,
                allowed_headers = ?config.allowed_headers,
                timeout_secs = config.timeout.as_secs(),
                parallel_requests = config.max_parallel_requests,
                "adding rule"
            );
        }

        let shared = GatewayShared {
            upstream,
            max_parallel_requests: config.max_parallel_requests,
            allowed_headers: config.allowed_headers.clone(),
            obs: Observability::disabled(),
            trace,
        };

        Ok(Self {
            config,
            table,
            shared,
        })
    }

    /// Inject metric sinks. Without this call observations are dropped.
    pub fn set_observability(&mut self, obs: Observability) {
        self.shared.obs = obs;
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Handle for publishing to or querying the trace arbiter.
    pub fn trace_handle(&self) -> TraceHandle {
        self.shared.trace.clone()
    }

    /// Build the router: a single-mode endpoint per rule, the multi-mode
    /// endpoint at `/` (unless a rule claims `/` itself), and the
    /// `/debug/conns` surface.
    pub fn router(&self) -> Router {
        let shared = Arc::new(self.shared.clone());
        let mut router = Router::new();

        for rule in self.table.rules() {
            router = router.route(
                &rule.src,
                endpoint(
                    shared.clone(),
                    rule.src.clone(),
                    RouteMode::Single {
                        dst_url: rule.dst_url.clone(),
                    },
                ),
            );
        }

        if self.table.get("/").is_none() {
            router = router.route(
                "/",
                endpoint(
                    shared.clone(),
                    "/".to_string(),
                    RouteMode::Multi {
                        table: self.table.clone(),
                    },
                ),
            );
        }

        router.merge(trace::router(self.shared.trace.clone()))
    }
}

/// One WebSocket endpoint: upgrades the connection and hands it to a session
/// forwarder wired to the given routing mode.
fn endpoint(shared: Arc<GatewayShared>, src: String, mode: RouteMode) -> MethodRouter {
    get(
        move |ws: WebSocketUpgrade, ConnectInfo(peer): ConnectInfo<SocketAddr>, headers: HeaderMap| {
            let shared = shared.clone();
            let src = src.clone();
            let mode = mode.clone();
            let user_agent = header_str(&headers, header::USER_AGENT);
            let referer = header_str(&headers, header::REFERER);
            async move {
                ws.on_upgrade(move |socket| {
                    forwarder::run(
                        socket,
                        SessionParams {
                            peer,
                            src,
                            mode,
                            user_agent,
                            referer,
                            shared,
                        },
                    )
                })
            }
        },
    )
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

//! Shared test harness: a configurable mock JSON-RPC backend, a bound
//! gateway, and a small WebSocket client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use futures_util::{SinkExt, StreamExt};
use prometheus::Registry;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use wsgate::gateway::{Gateway, GatewayConfig};
use wsgate::metrics;
use wsgate::routes::ProxyRule;

// ─────────────────────────────────────────────────────────────────────────────
// Mock JSON-RPC backend
// ─────────────────────────────────────────────────────────────────────────────

/// Configurable mock upstream. By default it answers 200 and echoes the
/// request body, which makes pass-through assertions trivial.
#[derive(Debug, Clone)]
pub struct MockBackend {
    status: StatusCode,
    response: Option<String>,
    delay: Option<Duration>,
}

/// One captured upstream request.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub body: Vec<u8>,
    /// Header names are lowercased by the HTTP stack.
    pub headers: HashMap<String, String>,
}

/// Shared state of a running mock backend.
pub struct BackendState {
    status: StatusCode,
    response: Option<String>,
    delay: Option<Duration>,
    requests: Mutex<Vec<CapturedRequest>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            response: None,
            delay: None,
        }
    }

    /// Respond with a fixed body instead of echoing the request.
    pub fn with_response(mut self, body: &str) -> Self {
        self.response = Some(body.to_string());
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Sleep before answering, for timeout and concurrency tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Bind on an ephemeral port and serve. Returns the base URL and the
    /// captured state.
    pub async fn start(self) -> (String, Arc<BackendState>) {
        let state = Arc::new(BackendState {
            status: self.status,
            response: self.response,
            delay: self.delay,
            requests: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/", post(handle_backend))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}"), state)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendState {
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<CapturedRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub fn request(&self, index: usize) -> Option<CapturedRequest> {
        self.requests.lock().unwrap().get(index).cloned()
    }

    /// Highest number of requests that were in flight at the same instant.
    pub fn max_in_flight(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

async fn handle_backend(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    state.requests.lock().unwrap().push(CapturedRequest {
        body: body.to_vec(),
        headers: headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect(),
    });

    let now = state.active.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_active.fetch_max(now, Ordering::SeqCst);
    if let Some(delay) = state.delay {
        tokio::time::sleep(delay).await;
    }
    state.active.fetch_sub(1, Ordering::SeqCst);

    let response = state
        .response
        .clone()
        .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
    (state.status, response)
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway under test
// ─────────────────────────────────────────────────────────────────────────────

pub struct TestGateway {
    pub addr: SocketAddr,
    pub registry: Registry,
}

/// Build and serve a gateway on an ephemeral port with wired metric sinks.
pub async fn start_gateway(
    rules: &[(&str, &str)],
    timeout: Duration,
    max_parallel: usize,
) -> TestGateway {
    let config = GatewayConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        rules: rules
            .iter()
            .map(|(src, dst)| ProxyRule {
                src: src.to_string(),
                dst_url: dst.to_string(),
            })
            .collect(),
        allowed_headers: vec!["Authorization".to_string()],
        timeout,
        max_parallel_requests: max_parallel,
        insecure_upstream_tls: false,
    };

    let registry = Registry::new();
    let mut gateway = Gateway::new(config).expect("gateway should build");
    gateway.set_observability(metrics::install(&registry).expect("metrics should install"));
    let app = gateway.router();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestGateway { addr, registry }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket client
// ─────────────────────────────────────────────────────────────────────────────

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn connect(addr: SocketAddr, path: &str) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}{path}"))
        .await
        .expect("websocket should connect");
    ws
}

pub async fn send_text(ws: &mut WsClient, text: &str) {
    ws.send(Message::text(text)).await.expect("send should work");
}

/// Receive the next text frame, skipping protocol frames, with a 5s guard.
pub async fn recv_text(ws: &mut WsClient) -> String {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for reply")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return text.to_string();
        }
    }
}

/// Assert that no text frame arrives within `window`.
pub async fn expect_no_reply(ws: &mut WsClient, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected reply: {text}"),
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => panic!("websocket error: {e}"),
            Ok(None) => panic!("stream ended unexpectedly"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric assertions
// ─────────────────────────────────────────────────────────────────────────────

/// Sum of `requests_total` samples carrying the given label pair.
pub fn counter_value(registry: &Registry, name: &str, label: (&str, &str)) -> f64 {
    registry
        .gather()
        .iter()
        .filter(|family| family.get_name() == name)
        .flat_map(|family| family.get_metric())
        .filter(|metric| {
            metric
                .get_label()
                .iter()
                .any(|pair| pair.get_name() == label.0 && pair.get_value() == label.1)
        })
        .map(|metric| metric.get_counter().get_value())
        .sum()
}

/// Current value of a gauge carrying the given label pair.
pub fn gauge_value(registry: &Registry, name: &str, label: (&str, &str)) -> f64 {
    registry
        .gather()
        .iter()
        .filter(|family| family.get_name() == name)
        .flat_map(|family| family.get_metric())
        .filter(|metric| {
            metric
                .get_label()
                .iter()
                .any(|pair| pair.get_name() == label.0 && pair.get_value() == label.1)
        })
        .map(|metric| metric.get_gauge().get_value())
        .sum()
}

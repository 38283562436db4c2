//! Live connection tracing.
//!
//! A single background task (the arbiter) owns two maps: live sessions and
//! their watchers. Session forwarders publish events; debugging clients
//! attach through the `/debug/conns` surface and receive copies of one
//! target session's event stream. Because all map mutation happens on the
//! arbiter task, no locking is needed anywhere; HTTP handlers read state by
//! submitting closures that run on the arbiter and answer over a oneshot
//! channel.
//!
//! # Backpressure
//!
//! The event channel is bounded at 1000. Request/response events are
//! best-effort: they are published with `try_send` and dropped when the
//! buffer is full, because stalling dispatch for observability is never
//! acceptable. Connect and disconnect events are rare and must not be lost
//! (a lost disconnect would orphan watchers), so they use blocking sends.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Capacity of the arbiter's channels and of each watcher inbox.
const EVENT_BUFFER: usize = 1000;

/// What happened on a traced session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEventKind {
    Connect,
    Disconnect,
    WsRequest,
    HttpResponse,
}

impl TraceEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::WsRequest => "ws_request",
            Self::HttpResponse => "http_response",
        }
    }
}

/// One event on a traced session.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub kind: TraceEventKind,
    /// Address of the session the event belongs to.
    pub addr: String,
    /// Frame or response bytes; empty for connect/disconnect.
    pub payload: Bytes,
    pub at: SystemTime,
    /// Session metadata, present only on connect.
    session: Option<SessionInfo>,
}

impl TraceEvent {
    fn new(kind: TraceEventKind, addr: String, payload: Bytes) -> Self {
        Self {
            kind,
            addr,
            payload,
            at: SystemTime::now(),
            session: None,
        }
    }
}

/// Metadata describing a live session, captured at WebSocket accept.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub addr: String,
    pub src: String,
    pub user_agent: String,
    pub referer: String,
}

/// Register or cancel a watcher on a target session.
struct WatchRequest {
    watcher_addr: String,
    target_addr: String,
    action: WatchAction,
}

enum WatchAction {
    Register(mpsc::Sender<TraceEvent>),
    Cancel,
}

type SessionsOp = Box<dyn FnOnce(&HashMap<String, SessionInfo>) + Send>;

/// Cloneable handle for publishing events and querying the arbiter.
#[derive(Clone)]
pub struct TraceHandle {
    events: mpsc::Sender<TraceEvent>,
    watches: mpsc::Sender<WatchRequest>,
    ops: mpsc::Sender<SessionsOp>,
}

impl TraceHandle {
    /// Announce a new session. Blocking send: connect events are never lost
    /// while the arbiter is alive.
    pub async fn session_connected(&self, info: SessionInfo) {
        let mut event = TraceEvent::new(TraceEventKind::Connect, info.addr.clone(), Bytes::new());
        event.session = Some(info);
        let _ = self.events.send(event).await;
    }

    /// Announce a session teardown. Blocking send: a lost disconnect would
    /// leave watchers attached to a dead session.
    pub async fn session_disconnected(&self, addr: String) {
        let event = TraceEvent::new(TraceEventKind::Disconnect, addr, Bytes::new());
        let _ = self.events.send(event).await;
    }

    /// Publish an inbound frame. Best-effort; dropped when the buffer is full.
    pub fn ws_request(&self, addr: &str, payload: &[u8]) {
        self.publish(TraceEvent::new(
            TraceEventKind::WsRequest,
            addr.to_string(),
            Bytes::copy_from_slice(payload),
        ));
    }

    /// Publish an outbound reply. Best-effort; dropped when the buffer is full.
    pub fn http_response(&self, addr: &str, payload: &[u8]) {
        self.publish(TraceEvent::new(
            TraceEventKind::HttpResponse,
            addr.to_string(),
            Bytes::copy_from_slice(payload),
        ));
    }

    fn publish(&self, event: TraceEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!(kind = event.kind.as_str(), "trace buffer full, event dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Attach a watcher inbox to a target session.
    pub async fn watch(&self, watcher_addr: String, target_addr: String, inbox: mpsc::Sender<TraceEvent>) {
        let _ = self
            .watches
            .send(WatchRequest {
                watcher_addr,
                target_addr,
                action: WatchAction::Register(inbox),
            })
            .await;
    }

    /// Detach a watcher from a target session.
    pub async fn unwatch(&self, watcher_addr: String, target_addr: String) {
        let _ = self
            .watches
            .send(WatchRequest {
                watcher_addr,
                target_addr,
                action: WatchAction::Cancel,
            })
            .await;
    }

    /// Run a read-only closure against the session map on the arbiter task.
    pub async fn with_sessions<F, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&HashMap<String, SessionInfo>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let op: SessionsOp = Box::new(move |sessions| {
            let _ = tx.send(f(sessions));
        });
        self.ops.send(op).await.ok()?;
        rx.await.ok()
    }

    /// Snapshot of all live sessions.
    pub async fn sessions_snapshot(&self) -> Vec<SessionInfo> {
        self.with_sessions(|sessions| sessions.values().cloned().collect())
            .await
            .unwrap_or_default()
    }

    /// Whether a session with this address is currently live.
    pub async fn is_connected(&self, addr: &str) -> bool {
        let addr = addr.to_string();
        self.with_sessions(move |sessions| sessions.contains_key(&addr))
            .await
            .unwrap_or(false)
    }
}

/// The arbiter task state. Constructed and spawned through [`TraceArbiter::spawn`].
pub struct TraceArbiter {
    events: mpsc::Receiver<TraceEvent>,
    watches: mpsc::Receiver<WatchRequest>,
    ops: mpsc::Receiver<SessionsOp>,
    sessions: HashMap<String, SessionInfo>,
    watchers: HashMap<String, HashMap<String, mpsc::Sender<TraceEvent>>>,
}

impl TraceArbiter {
    /// Spawn the arbiter onto the current runtime and return its handle.
    ///
    /// The task runs until every handle clone is dropped.
    pub fn spawn() -> TraceHandle {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (watches_tx, watches_rx) = mpsc::channel(EVENT_BUFFER);
        let (ops_tx, ops_rx) = mpsc::channel(EVENT_BUFFER);

        let arbiter = Self {
            events: events_rx,
            watches: watches_rx,
            ops: ops_rx,
            sessions: HashMap::new(),
            watchers: HashMap::new(),
        };
        tokio::spawn(arbiter.run());

        TraceHandle {
            events: events_tx,
            watches: watches_tx,
            ops: ops_tx,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(event) = self.events.recv() => self.on_event(event),
                Some(request) = self.watches.recv() => self.on_watch(request),
                Some(op) = self.ops.recv() => op(&self.sessions),
                else => break,
            }
        }
    }

    fn on_event(&mut self, event: TraceEvent) {
        match event.kind {
            TraceEventKind::Connect => {
                if let Some(info) = event.session {
                    self.sessions.insert(event.addr, info);
                }
            }
            TraceEventKind::Disconnect => {
                self.sessions.remove(&event.addr);
                // Dropping the inboxes closes them, which is the watcher-side
                // close signal.
                self.watchers.remove(&event.addr);
            }
            TraceEventKind::WsRequest | TraceEventKind::HttpResponse => {
                if let Some(inboxes) = self.watchers.get(&event.addr) {
                    for inbox in inboxes.values() {
                        // A slow watcher loses events rather than stalling
                        // the arbiter.
                        let _ = inbox.try_send(event.clone());
                    }
                }
            }
        }
    }

    fn on_watch(&mut self, request: WatchRequest) {
        match request.action {
            WatchAction::Register(inbox) => {
                self.watchers
                    .entry(request.target_addr)
                    .or_default()
                    .insert(request.watcher_addr, inbox);
            }
            WatchAction::Cancel => {
                if let Some(inboxes) = self.watchers.get_mut(&request.target_addr) {
                    inboxes.remove(&request.watcher_addr);
                    if inboxes.is_empty() {
                        self.watchers.remove(&request.target_addr);
                    }
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Debug HTTP surface
// ─────────────────────────────────────────────────────────────────────────────

/// Routes for the `/debug/conns` surface.
pub fn router(handle: TraceHandle) -> Router {
    Router::new()
        .route("/debug/conns/", get(index))
        .route("/debug/conns/trace", get(trace_page))
        .route("/debug/conns/ws", get(watch_ws))
        .with_state(handle)
}

#[derive(Debug, Deserialize)]
struct TraceQuery {
    #[serde(default)]
    addr: String,
}

/// Session list page.
async fn index(State(handle): State<TraceHandle>) -> Html<String> {
    let mut sessions = handle.sessions_snapshot().await;
    sessions.sort_by(|a, b| a.addr.cmp(&b.addr));

    let mut rows = String::new();
    for s in &sessions {
        rows.push_str(&format!(
            "<tr><td><a href=\"trace?addr={addr}\">{addr}</a></td><td>{src}</td><td>{ua}</td><td>{referer}</td></tr>\n",
            addr = s.addr,
            src = s.src,
            ua = s.user_agent,
            referer = s.referer,
        ));
    }

    Html(format!(
        "<html><head><title>/debug/conns/</title></head><body>\n\
         <p>active connections: {}</p>\n\
         <table>\n{}</table>\n\
         </body></html>",
        sessions.len(),
        rows
    ))
}

/// Event viewer page for one session.
async fn trace_page(
    State(handle): State<TraceHandle>,
    Query(query): Query<TraceQuery>,
) -> Html<String> {
    let connected = handle.is_connected(&query.addr).await;

    let body = if connected {
        format!(
            "<script>\n\
             var w = new WebSocket(\"ws://\" + document.location.host + \"/debug/conns/ws?addr={addr}\");\n\
             w.onmessage = function(e) {{\n\
               var tr = document.createElement(\"tr\");\n\
               var ev = JSON.parse(e.data);\n\
               tr.innerHTML = \"<td>\" + ev.ts + \"</td><td>\" + ev.kind + \"</td>\";\n\
               var td = document.createElement(\"td\");\n\
               td.innerText = ev.data;\n\
               tr.appendChild(td);\n\
               document.getElementById(\"output\").appendChild(tr);\n\
             }};\n\
             </script>\n\
             <table><tbody id=\"output\"></tbody></table>",
            addr = query.addr
        )
    } else {
        "client disconnected".to_string()
    };

    Html(format!(
        "<html><head><title>/debug/conns/trace</title></head><body>\n\
         <p><a href=\"/debug/conns/\">back to list</a></p>\n\
         <strong>Addr: {}</strong>\n{}\n</body></html>",
        query.addr, body
    ))
}

/// Event stream for one session, delivered to a watcher WebSocket.
async fn watch_ws(
    State(handle): State<TraceHandle>,
    Query(query): Query<TraceQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| watch_session(socket, handle, query.addr, peer.to_string()))
}

async fn watch_session(
    socket: WebSocket,
    handle: TraceHandle,
    target_addr: String,
    watcher_addr: String,
) {
    let (mut sink, mut stream) = socket.split();
    let (inbox_tx, mut inbox_rx) = mpsc::channel(EVENT_BUFFER);
    handle
        .watch(watcher_addr.clone(), target_addr.clone(), inbox_tx)
        .await;

    loop {
        tokio::select! {
            event = inbox_rx.recv() => {
                let Some(event) = event else {
                    // Inbox closed: the target session disconnected.
                    break;
                };
                let feed = serde_json::json!({
                    "kind": event.kind.as_str(),
                    "ts": unix_millis(event.at),
                    "data": String::from_utf8_lossy(&event.payload),
                })
                .to_string();
                if sink.send(Message::Text(feed.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    handle.unwatch(watcher_addr, target_addr).await;
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn info(addr: &str) -> SessionInfo {
        SessionInfo {
            addr: addr.to_string(),
            src: "/rpc".to_string(),
            user_agent: "test-agent".to_string(),
            referer: String::new(),
        }
    }

    #[tokio::test]
    async fn test_connect_and_snapshot() {
        let handle = TraceArbiter::spawn();

        handle.session_connected(info("1.2.3.4:5678")).await;
        let sessions = handle.sessions_snapshot().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].addr, "1.2.3.4:5678");
        assert!(handle.is_connected("1.2.3.4:5678").await);

        handle.session_disconnected("1.2.3.4:5678".to_string()).await;
        assert!(!handle.is_connected("1.2.3.4:5678").await);
        assert!(handle.sessions_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_watcher_receives_target_events() {
        let handle = TraceArbiter::spawn();
        handle.session_connected(info("t:1")).await;

        let (tx, mut rx) = mpsc::channel(16);
        handle.watch("w:1".to_string(), "t:1".to_string(), tx).await;
        // Barrier: the register request is processed before this resolves.
        handle.with_sessions(|_| ()).await;

        handle.ws_request("t:1", b"frame");
        handle.http_response("t:1", b"reply");

        let first = rx.recv().await.expect("first event");
        assert_eq!(first.kind, TraceEventKind::WsRequest);
        assert_eq!(&first.payload[..], b"frame");

        let second = rx.recv().await.expect("second event");
        assert_eq!(second.kind, TraceEventKind::HttpResponse);
        assert_eq!(&second.payload[..], b"reply");
    }

    #[tokio::test]
    async fn test_events_for_other_targets_are_not_delivered() {
        let handle = TraceArbiter::spawn();
        handle.session_connected(info("t:1")).await;
        handle.session_connected(info("t:2")).await;

        let (tx, mut rx) = mpsc::channel(16);
        handle.watch("w:1".to_string(), "t:1".to_string(), tx).await;
        handle.with_sessions(|_| ()).await;

        handle.ws_request("t:2", b"other");
        handle.ws_request("t:1", b"mine");

        let event = rx.recv().await.expect("event");
        assert_eq!(&event.payload[..], b"mine");
    }

    #[tokio::test]
    async fn test_target_disconnect_closes_watcher_inbox() {
        let handle = TraceArbiter::spawn();
        handle.session_connected(info("t:1")).await;

        let (tx, mut rx) = mpsc::channel(16);
        handle.watch("w:1".to_string(), "t:1".to_string(), tx).await;
        handle.with_sessions(|_| ()).await;

        handle.session_disconnected("t:1".to_string()).await;
        assert!(rx.recv().await.is_none(), "inbox should be closed");
    }

    #[tokio::test]
    async fn test_cancelled_watcher_stops_receiving() {
        let handle = TraceArbiter::spawn();
        handle.session_connected(info("t:1")).await;

        let (tx, mut rx) = mpsc::channel(16);
        handle.watch("w:1".to_string(), "t:1".to_string(), tx).await;
        handle.unwatch("w:1".to_string(), "t:1".to_string()).await;
        // The watch channel is ordered, but event delivery races it; give the
        // arbiter time to drain both queues.
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.ws_request("t:1", b"frame");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "no events after cancel");
    }
}

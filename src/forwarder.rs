//! Per-session request forwarding.
//!
//! Each accepted WebSocket gets one reader task running [`run`]. Frames are
//! read strictly in arrival order and classified: control frames (`SET `,
//! `AUTH `) mutate the session's sticky header map inline; everything else is
//! an RPC frame, admitted under the session's concurrency semaphore and
//! handed to an independent worker task. Workers forward to the upstream and
//! write their reply through a dedicated writer task, so replies may
//! interleave in any order; clients correlate by id.
//!
//! Admission blocks the reader when the semaphore is exhausted, which also
//! backpressures the client. The permit is released as soon as the upstream
//! call resolves, before the body is read, because body streaming rides the
//! already-established pooled connection.
//!
//! On read error or EOF the session drains: no new frames are admitted,
//! outstanding workers run to completion or to their upstream deadline, and
//! only then are the disconnect event and gauge decrement emitted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::ForwardError;
use crate::gateway::GatewayShared;
use crate::jsonrpc::{self, RpcErrorResponse};
use crate::metrics::STATUS_OK;
use crate::routes::RouteMode;
use crate::trace::SessionInfo;
use crate::upstream;

/// Everything an endpoint hands to a new session.
pub struct SessionParams {
    pub peer: SocketAddr,
    pub src: String,
    pub mode: RouteMode,
    pub user_agent: String,
    pub referer: String,
    pub shared: Arc<GatewayShared>,
}

/// Shared per-session state, cloned into every dispatch worker.
struct Session {
    addr: String,
    src: String,
    mode: RouteMode,
    /// Sticky headers set by control frames, read by workers at dispatch.
    headers: RwLock<HashMap<HeaderName, HeaderValue>>,
    shared: Arc<GatewayShared>,
    reply_tx: mpsc::UnboundedSender<Message>,
}

impl Session {
    /// Apply a `SET`/`AUTH` control frame. Names outside the allow-list and
    /// values that are not valid header material are logged and ignored.
    fn set_header(&self, name: &str, value: &str) {
        let Some(canonical) = self
            .shared
            .allowed_headers
            .iter()
            .find(|h| h.eq_ignore_ascii_case(name))
        else {
            debug!(peer = %self.addr, header = %name, "header not in allow-list, ignored");
            return;
        };
        let Ok(header_name) = HeaderName::try_from(canonical.as_str()) else {
            warn!(peer = %self.addr, header = %canonical, "allow-listed header has invalid name");
            return;
        };
        let Ok(header_value) = HeaderValue::from_str(value) else {
            warn!(peer = %self.addr, header = %canonical, "invalid header value, ignored");
            return;
        };
        self.headers
            .write()
            .unwrap()
            .insert(header_name, header_value);
    }

    /// Defensive copy of the sticky headers, fixing the header state a worker
    /// observes for its whole request.
    fn header_snapshot(&self) -> HeaderMap {
        let headers = self.headers.read().unwrap();
        let mut snapshot = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers.iter() {
            snapshot.insert(name.clone(), value.clone());
        }
        snapshot
    }

    /// Frame a reply back onto the session, publishing it to any watchers.
    /// A send failure means the writer is gone; the reply is discarded.
    fn send_reply(&self, body: &[u8]) {
        self.shared.trace.http_response(&self.addr, body);
        let text = String::from_utf8_lossy(body).into_owned();
        if self.reply_tx.send(Message::Text(text.into())).is_err() {
            debug!(peer = %self.addr, "session closed, reply discarded");
        }
    }
}

/// Run one session until EOF, read error, or close frame, then drain.
pub async fn run(socket: WebSocket, params: SessionParams) {
    let SessionParams {
        peer,
        src,
        mode,
        user_agent,
        referer,
        shared,
    } = params;
    let addr = peer.to_string();

    shared
        .trace
        .session_connected(SessionInfo {
            addr: addr.clone(),
            src: src.clone(),
            user_agent,
            referer,
        })
        .await;
    shared.obs.connection_opened(&src);
    debug!(peer = %addr, src = %src, "session opened");

    let (sink, stream) = socket.split();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_replies(sink, reply_rx, addr.clone()));

    let session = Arc::new(Session {
        addr: addr.clone(),
        src: src.clone(),
        mode,
        headers: RwLock::new(HashMap::new()),
        shared: shared.clone(),
        reply_tx,
    });

    let mut workers = JoinSet::new();
    read_frames(stream, &session, &mut workers).await;

    // Draining: the reader is done, so nothing new is admitted. Outstanding
    // workers run to completion or to their upstream deadline; their replies
    // on a closed socket are discarded by the writer.
    while workers.join_next().await.is_some() {}
    drop(session);
    let _ = writer.await;

    shared.obs.connection_closed(&src);
    shared.trace.session_disconnected(addr.clone()).await;
    debug!(peer = %addr, src = %src, "session closed");
}

/// Reader loop: frames are consumed strictly in arrival order.
async fn read_frames(
    mut stream: SplitStream<WebSocket>,
    session: &Arc<Session>,
    workers: &mut JoinSet<()>,
) {
    let permits = Arc::new(Semaphore::new(session.shared.max_parallel_requests));

    loop {
        let message = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                warn!(peer = %session.addr, error = %e, "error while receiving from client");
                return;
            }
            None => return,
        };
        let data: Bytes = match message {
            Message::Text(text) => text.into(),
            Message::Binary(data) => data,
            Message::Close(_) => return,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        session.shared.trace.ws_request(&session.addr, &data);

        match classify_frame(&data) {
            Frame::Control(Some((name, value))) => session.set_header(&name, &value),
            Frame::Control(None) => {
                warn!(peer = %session.addr, "malformed control frame ignored");
            }
            Frame::Rpc => {
                // Blocks the reader when the session is at its fan-out cap,
                // backpressuring the client.
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    return;
                };
                let session = session.clone();
                workers.spawn(dispatch(session, data, permit));
            }
        }
    }
}

/// Writer task: the only place that touches the WebSocket sink. Write
/// failures are warned per reply; the session itself keeps running because
/// the client may only have closed its receiving side.
async fn write_replies(
    mut sink: SplitSink<WebSocket, Message>,
    mut replies: mpsc::UnboundedReceiver<Message>,
    peer: String,
) {
    while let Some(message) = replies.recv().await {
        if let Err(e) = sink.send(message).await {
            warn!(peer = %peer, error = %e, "failed to write reply to client");
        }
    }
}

/// Frame classification result.
enum Frame {
    /// A `SET `/`AUTH ` frame; `None` means the frame was malformed.
    Control(Option<(String, String)>),
    Rpc,
}

/// Classify a frame by its ASCII prefix. The value is the remainder of the
/// frame after the first space following the header name, so values may
/// contain spaces.
fn classify_frame(data: &[u8]) -> Frame {
    if let Some(rest) = data.strip_prefix(b"SET ") {
        let parsed = std::str::from_utf8(rest).ok().and_then(|rest| {
            let (name, value) = rest.split_once(' ')?;
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        });
        return Frame::Control(parsed);
    }
    if let Some(rest) = data.strip_prefix(b"AUTH ") {
        let parsed = std::str::from_utf8(rest)
            .ok()
            .map(|value| ("Authorization".to_string(), value.to_string()));
        return Frame::Control(parsed);
    }
    Frame::Rpc
}

/// A successful forward: the upstream body, framed back verbatim.
struct Reply {
    src: String,
    method: String,
    body: Bytes,
}

/// A failed forward, with the labels and id needed for reporting.
struct Failure {
    src: String,
    method: String,
    id: Option<Value>,
    error: ForwardError,
}

/// Worker task for one admitted RPC frame.
async fn dispatch(session: Arc<Session>, frame: Bytes, permit: OwnedSemaphorePermit) {
    let started = Instant::now();
    match forward(&session, &frame, permit).await {
        Ok(reply) => {
            let obs = &session.shared.obs;
            obs.record_request(&reply.src, &reply.method, STATUS_OK);
            obs.record_duration(
                &reply.src,
                &reply.method,
                "200",
                started.elapsed().as_secs_f64(),
            );
            session.send_reply(&reply.body);
        }
        Err(failure) => {
            let obs = &session.shared.obs;
            obs.record_request(&failure.src, &failure.method, failure.error.status_label());
            obs.record_duration(
                &failure.src,
                &failure.method,
                &failure.error.code_label(),
                started.elapsed().as_secs_f64(),
            );
            warn!(
                peer = %session.addr,
                src = %failure.src,
                method = %failure.method,
                error = %failure.error,
                "request failed"
            );

            // Notifications get no error reply. A parse failure cannot prove
            // the frame was a notification, so it always replies, echoing a
            // best-effort id.
            let reply_anyway = matches!(failure.error, ForwardError::Parse);
            if failure.id.is_some() || reply_anyway {
                let envelope = RpcErrorResponse::new(
                    failure.id,
                    failure.error.jsonrpc_code(),
                    failure.error.client_message(),
                );
                session.send_reply(envelope.to_json().as_bytes());
            } else {
                debug!(peer = %session.addr, "notification failed, no reply sent");
            }
        }
    }
}

/// The parse -> route -> snapshot -> POST -> read chain for one frame.
async fn forward(
    session: &Session,
    frame: &[u8],
    permit: OwnedSemaphorePermit,
) -> Result<Reply, Failure> {
    let env = match jsonrpc::parse(frame) {
        Ok(env) => env,
        Err(e) => {
            debug!(peer = %session.addr, error = %e, "frame is not a JSON-RPC request");
            return Err(Failure {
                src: session.src.clone(),
                method: jsonrpc::method_of(frame),
                id: jsonrpc::id_of(frame),
                error: ForwardError::Parse,
            });
        }
    };

    let (src, dst_url, method, id, body) = match &session.mode {
        RouteMode::Single { dst_url } => (
            session.src.clone(),
            dst_url.clone(),
            env.method.clone(),
            env.id.clone(),
            frame.to_vec(),
        ),
        RouteMode::Multi { table } => {
            let method = env.method.clone();
            let id = env.id.clone();
            match table.rewrite(env) {
                Ok((env, rule)) => match serde_json::to_vec(&env) {
                    Ok(body) => (
                        rule.src.clone(),
                        rule.dst_url.clone(),
                        env.method.clone(),
                        env.id.clone(),
                        body,
                    ),
                    Err(e) => {
                        error!(peer = %session.addr, error = %e, "failed to re-serialize envelope");
                        return Err(Failure {
                            src: session.src.clone(),
                            method,
                            id,
                            error: ForwardError::Parse,
                        });
                    }
                },
                Err(e) => {
                    return Err(Failure {
                        src: session.src.clone(),
                        method,
                        id,
                        error: e.into(),
                    });
                }
            }
        }
    };

    let headers = session.header_snapshot();
    let result = session.shared.upstream.post(&dst_url, body, headers).await;
    // The fan-out slot is freed as soon as the call resolves; body streaming
    // proceeds on the established connection.
    drop(permit);

    let response = match result {
        Ok(response) => response,
        Err(error) => {
            return Err(Failure {
                src,
                method,
                id,
                error,
            });
        }
    };

    let status = response.status();
    if status != StatusCode::OK {
        return Err(Failure {
            src,
            method,
            id,
            error: ForwardError::UpstreamStatus(status.as_u16()),
        });
    }

    match upstream::read_body(response).await {
        Ok(body) => Ok(Reply { src, method, body }),
        Err(error) => Err(Failure {
            src,
            method,
            id,
            error,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayShared;
    use crate::metrics::Observability;
    use crate::trace::TraceArbiter;
    use crate::upstream::{UpstreamClient, UpstreamConfig};

    fn control(data: &[u8]) -> Option<(String, String)> {
        match classify_frame(data) {
            Frame::Control(parsed) => parsed,
            Frame::Rpc => panic!("expected control frame for {data:?}"),
        }
    }

    #[test]
    fn test_classify_set_frame() {
        assert_eq!(
            control(b"SET Authorization Bearer-abc"),
            Some(("Authorization".to_string(), "Bearer-abc".to_string()))
        );
        // The value is everything after the first space following the name.
        assert_eq!(
            control(b"SET X-Tag a b c"),
            Some(("X-Tag".to_string(), "a b c".to_string()))
        );
        // Name but no value separator.
        assert_eq!(control(b"SET Authorization"), None);
        assert_eq!(control(b"SET  "), None);
    }

    #[test]
    fn test_classify_auth_frame() {
        assert_eq!(
            control(b"AUTH Bearer-xyz"),
            Some(("Authorization".to_string(), "Bearer-xyz".to_string()))
        );
    }

    #[test]
    fn test_classify_rpc_frames() {
        assert!(matches!(
            classify_frame(br#"{"jsonrpc":"2.0","method":"sum","id":1}"#),
            Frame::Rpc
        ));
        // Prefix must match exactly, including the trailing space.
        assert!(matches!(classify_frame(b"SETTINGS x"), Frame::Rpc));
        assert!(matches!(classify_frame(b"AUTHX y"), Frame::Rpc));
        assert!(matches!(classify_frame(b""), Frame::Rpc));
    }

    fn test_session(allowed: &[&str]) -> Session {
        let shared = Arc::new(GatewayShared {
            upstream: UpstreamClient::new(&UpstreamConfig::default()).expect("client"),
            max_parallel_requests: 1,
            allowed_headers: allowed.iter().map(|s| s.to_string()).collect(),
            obs: Observability::disabled(),
            trace: TraceArbiter::spawn(),
        });
        let (reply_tx, _reply_rx) = mpsc::unbounded_channel();
        Session {
            addr: "1.2.3.4:5".to_string(),
            src: "/rpc".to_string(),
            mode: RouteMode::Single {
                dst_url: "http://backend".to_string(),
            },
            headers: RwLock::new(HashMap::new()),
            shared,
            reply_tx,
        }
    }

    #[tokio::test]
    async fn test_set_header_respects_allow_list() {
        let session = test_session(&["Authorization"]);

        session.set_header("Authorization", "Bearer-abc");
        session.set_header("X-Not-Allowed", "nope");

        let snapshot = session.header_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("authorization").expect("header"), "Bearer-abc");
    }

    #[tokio::test]
    async fn test_set_header_is_case_insensitive_and_overwrites() {
        let session = test_session(&["Authorization"]);

        session.set_header("authorization", "first");
        session.set_header("AUTHORIZATION", "second");

        let snapshot = session.header_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("authorization").expect("header"), "second");
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let session = test_session(&["Authorization"]);
        session.set_header("Authorization", "before");
        let snapshot = session.header_snapshot();
        session.set_header("Authorization", "after");

        assert_eq!(snapshot.get("authorization").expect("header"), "before");
        assert_eq!(
            session
                .header_snapshot()
                .get("authorization")
                .expect("header"),
            "after"
        );
    }

    #[tokio::test]
    async fn test_invalid_header_value_is_ignored() {
        let session = test_session(&["Authorization"]);
        session.set_header("Authorization", "bad\nvalue");
        assert!(session.header_snapshot().is_empty());
    }
}

//! wsgate - WebSocket to HTTP JSON-RPC 2.0 bridging proxy.
//!
//! A single WebSocket connection is a multiplexed session: the client streams
//! many logical JSON-RPC requests over it and receives many replies, in any
//! order. Each request is forwarded as an HTTP POST to the upstream selected
//! by the endpoint's proxy rule (or, on the multi-route endpoint, by the
//! method-name prefix), under a per-session fan-out cap and a per-request
//! deadline. In-band `SET`/`AUTH` control frames maintain a sticky header
//! map that is copied into every upstream request.
//!
//! # Modules
//!
//! - [`jsonrpc`] - envelope parsing and error-reply encoding
//! - [`routes`] - proxy rules and method-prefix rewriting
//! - [`upstream`] - pooled HTTP client with timeout classification
//! - [`forwarder`] - the per-session state machine
//! - [`gateway`] - endpoint factory and router assembly
//! - [`metrics`] - injected observation sinks
//! - [`trace`] - live-connection tracing and the `/debug/conns` surface
//! - [`error`] - startup and per-request error taxonomies

pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod jsonrpc;
pub mod metrics;
pub mod routes;
pub mod trace;
pub mod upstream;

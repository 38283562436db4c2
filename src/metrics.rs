//! Observability hooks.
//!
//! The gateway reports three kinds of observations: a request counter keyed
//! by `(url, method, status)`, a duration histogram keyed by
//! `(url, method, code)`, and a live-connection gauge keyed by `uri`. The
//! core never creates or registers collectors itself; it calls the record
//! methods on an [`Observability`] handle whose sinks are injected by the
//! host. Unset sinks drop observations silently, so an undecorated gateway
//! (the default) costs nothing.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};

/// Request counter outcome labels. Failures pick between the latter two via
/// [`crate::error::ForwardError::status_label`].
pub const STATUS_OK: &str = "ok";
pub const STATUS_TIMEOUT: &str = "timeout";
pub const STATUS_ERROR: &str = "error";

/// Injected metric sinks. All optional; `None` sinks are silently skipped.
#[derive(Clone, Default)]
pub struct Observability {
    requests: Option<IntCounterVec>,
    durations: Option<HistogramVec>,
    connections: Option<IntGaugeVec>,
}

impl Observability {
    /// A handle with no sinks attached. Every observation is dropped.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn set_request_counter(&mut self, counter: IntCounterVec) {
        self.requests = Some(counter);
    }

    pub fn set_duration_histogram(&mut self, histogram: HistogramVec) {
        self.durations = Some(histogram);
    }

    pub fn set_connection_gauge(&mut self, gauge: IntGaugeVec) {
        self.connections = Some(gauge);
    }

    /// Count one dispatch attempt. `status` is one of [`STATUS_OK`],
    /// [`STATUS_TIMEOUT`], [`STATUS_ERROR`].
    pub fn record_request(&self, url: &str, method: &str, status: &str) {
        if let Some(requests) = &self.requests {
            requests.with_label_values(&[url, method, status]).inc();
        }
    }

    /// Record the wall-clock duration of one dispatch. `code` is the HTTP
    /// status as a string, or the JSON-RPC error code when no response was
    /// obtained.
    pub fn record_duration(&self, url: &str, method: &str, code: &str, seconds: f64) {
        if let Some(durations) = &self.durations {
            durations
                .with_label_values(&[url, method, code])
                .observe(seconds);
        }
    }

    pub fn connection_opened(&self, uri: &str) {
        if let Some(connections) = &self.connections {
            connections.with_label_values(&[uri]).inc();
        }
    }

    pub fn connection_closed(&self, uri: &str) {
        if let Some(connections) = &self.connections {
            connections.with_label_values(&[uri]).dec();
        }
    }
}

/// Host-side convenience: build the standard sinks, register them in
/// `registry`, and return a fully wired handle.
///
/// `rpc_duration_seconds` is a histogram rather than a summary; the
/// prometheus crate does not offer summary vectors and histograms are the
/// ecosystem replacement.
pub fn install(registry: &Registry) -> Result<Observability, prometheus::Error> {
    let requests = IntCounterVec::new(
        Opts::new("requests_total", "RPC requests by endpoint and outcome"),
        &["url", "method", "status"],
    )?;
    let durations = HistogramVec::new(
        HistogramOpts::new(
            "rpc_duration_seconds",
            "RPC round-trip duration by endpoint and response code",
        ),
        &["url", "method", "code"],
    )?;
    let connections = IntGaugeVec::new(
        Opts::new("connections_total", "Live WebSocket sessions per endpoint"),
        &["uri"],
    )?;

    registry.register(Box::new(requests.clone()))?;
    registry.register(Box::new(durations.clone()))?;
    registry.register(Box::new(connections.clone()))?;

    let mut obs = Observability::disabled();
    obs.set_request_counter(requests);
    obs.set_duration_histogram(durations);
    obs.set_connection_gauge(connections);
    Ok(obs)
}

//! Observability hooks.
//!
//! The core never talks to a metrics backend directly; it emits through the
//! [`EventSink`] callback seam and external collaborators (Prometheus
//! exporters, span processors) subscribe behind it. The default sink maps
//! everything onto `tracing` so a bare deployment still gets structured
//! logs.

use std::sync::Arc;

/// Callback interface for metrics, spans and structured events.
///
/// All methods have no-op defaults so sinks only implement what they
/// consume. Implementations must be cheap: hooks are called on hot paths.
pub trait EventSink: Send + Sync {
    /// Monotonic counter increment.
    fn counter(&self, _name: &str, _value: u64, _labels: &[(&str, &str)]) {}

    /// Point-in-time gauge observation.
    fn gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}

    /// Structured event with free-form fields.
    fn event(&self, _name: &str, _fields: &[(&str, &str)]) {}

    /// Non-fatal condition worth operator attention (e.g. silent clamping
    /// of request parameters, dropped memory enhancement).
    fn warning(&self, _name: &str, _message: &str) {}
}

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn EventSink>;

/// Default sink: everything becomes a `tracing` record.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn counter(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        tracing::debug!(counter = name, value, ?labels, "metric");
    }

    fn gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        tracing::debug!(gauge = name, value, ?labels, "metric");
    }

    fn event(&self, name: &str, fields: &[(&str, &str)]) {
        tracing::info!(event = name, ?fields);
    }

    fn warning(&self, name: &str, message: &str) {
        tracing::warn!(event = name, message);
    }
}

/// Sink that drops everything. Used in tests and benchmarks.
pub struct NullSink;

impl EventSink for NullSink {}

/// The conventional default sink.
pub fn tracing_sink() -> SharedSink {
    Arc::new(TracingSink)
}

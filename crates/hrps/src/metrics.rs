use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared readiness state surfaced on the `/ready` endpoint.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a new health state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the service as ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// Connection count gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("hub_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("hub_connections_active").decrement(1.0);
    }

    /// Record the current number of groups.
    pub fn groups_active(count: usize) {
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("hub_groups_active").set(count as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Record a client connection attempt with the given status label.
    pub fn connections_total(status: &'static str) {
        metrics::counter!("hub_connections_total", "status" => status).increment(1);
    }

    /// Record a publish request with the given target kind label.
    pub fn publishes_total(kind: &'static str) {
        metrics::counter!("hub_publishes_total", "kind" => kind).increment(1);
    }

    /// Increment the pushed-messages counter.
    pub fn messages_pushed_total() {
        metrics::counter!("hub_messages_pushed_total").increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("hub_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Record a rejected publish or connect with the given auth error label.
    pub fn auth_failures_total(kind: &'static str) {
        metrics::counter!("hub_auth_failures_total", "kind" => kind).increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record a publish fan-out latency observation in seconds.
    pub fn publish_fanout_seconds(value: f64) {
        metrics::histogram!("hub_publish_fanout_seconds").record(value);
    }
}

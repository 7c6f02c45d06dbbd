//! Delivery reports returned to publishers.
//!
//! Delivery is best-effort: the report aggregates per-target outcomes and
//! partial success is a valid result, not an error. Clients receive no
//! negative acknowledgment for dropped messages.

use crate::types::ConnectionId;
use serde::{Deserialize, Serialize};

/// Why a single target delivery failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryReason {
    /// The connection's transport was closed before the push was enqueued.
    TransportClosed,
    /// The connection was found unresponsive by a bounded network write.
    Timeout,
    /// The connection's bounded outbound buffer was full.
    BufferFull,
}

/// A single failed delivery within a publish request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    /// The connection the push could not be delivered to.
    pub connection_id: ConnectionId,
    /// Why the delivery failed.
    pub reason: DeliveryReason,
}

/// Aggregate outcome of one publish request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    /// Number of targets resolved for the request.
    pub attempted: usize,
    /// Number of targets the payload was enqueued for.
    pub succeeded: usize,
    /// Number of targets that failed.
    pub failed: usize,
    /// The failed targets with reasons.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    /// Records a successful per-target delivery.
    pub fn record_success(&mut self) {
        self.attempted += 1;
        self.succeeded += 1;
    }

    /// Records a failed per-target delivery.
    pub fn record_failure(&mut self, connection_id: ConnectionId, reason: DeliveryReason) {
        self.attempted += 1;
        self.failed += 1;
        self.failures.push(DeliveryFailure {
            connection_id,
            reason,
        });
    }

    /// Returns `true` if at least one target was resolved and all failed.
    #[must_use]
    pub const fn all_failed(&self) -> bool {
        self.attempted > 0 && self.succeeded == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_stay_consistent() {
        let mut report = DeliveryReport::default();
        report.record_success();
        report.record_success();
        report.record_failure(ConnectionId(3), DeliveryReason::TransportClosed);
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.all_failed());
    }

    #[test]
    fn all_failed_requires_at_least_one_target() {
        let empty = DeliveryReport::default();
        assert!(!empty.all_failed());

        let mut report = DeliveryReport::default();
        report.record_failure(ConnectionId(1), DeliveryReason::BufferFull);
        assert!(report.all_failed());
    }

    #[test]
    fn reasons_serialize_snake_case() {
        let json = serde_json::to_value(DeliveryReason::TransportClosed).unwrap();
        assert_eq!(json, "transport_closed");
    }

    #[test]
    fn empty_failures_are_omitted_from_wire() {
        let mut report = DeliveryReport::default();
        report.record_success();
        let wire = serde_json::to_string(&report).unwrap();
        assert!(!wire.contains("failures"));
        let parsed: DeliveryReport = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed, report);
    }
}

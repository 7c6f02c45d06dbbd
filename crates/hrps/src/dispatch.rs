//! Dispatch engine: fan-out of publish requests to live connections.
//!
//! Resolves the target connection set from the registry, serializes the push
//! frame once, and enqueues it per target. Each target outcome is
//! independent: a closed or full connection never aborts sibling deliveries.
//! No retries — delivery is fire-and-forget, at most once per target.

use hrp_common::message::ServerMessage;
use hrp_common::report::{DeliveryReason, DeliveryReport};
use hrp_common::types::PublishTarget;
use hrp_common::ConnectionId;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::metrics::{counters, gauges, histograms};
use crate::outbound::{CloseReason, Enqueued, EnqueueError, OverflowPolicy};
use crate::registry::Registry;

/// A publish request resolved from the HTTP API.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    /// Who the payload goes to.
    pub target: PublishTarget,
    /// Opaque JSON payload, relayed verbatim.
    pub payload: Value,
}

/// Routes publish requests to the matching set of live connections.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    policy: OverflowPolicy,
}

impl Dispatcher {
    /// Creates a dispatcher over the given registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>, policy: OverflowPolicy) -> Self {
        Self { registry, policy }
    }

    /// Pushes the payload to every target, recording per-target outcomes.
    ///
    /// Stale handles fail fast: a connection whose queue is already closed
    /// is reported as failed and pruned from the registry on the spot.
    pub fn publish(&self, request: &PublishRequest) -> DeliveryReport {
        let start = Instant::now();
        let mut report = DeliveryReport::default();

        let frame = ServerMessage::Push {
            payload: request.payload.clone(),
        };
        let json: Arc<str> = match serde_json::to_string(&frame) {
            Ok(json) => Arc::from(json.as_str()),
            Err(e) => {
                warn!(error = %e, "failed to serialize push frame");
                return report;
            }
        };

        let targets: Vec<ConnectionId> = match &request.target {
            PublishTarget::Broadcast => self.registry.connection_ids(),
            PublishTarget::Group(group) => self.registry.members_of(group).into_iter().collect(),
            PublishTarget::User(user) => self.registry.by_user(user).into_iter().collect(),
        };

        counters::publishes_total(request.target.kind());

        for id in targets {
            let Some(handle) = self.registry.handle(id) else {
                // Unregistered between snapshot and delivery.
                report.record_failure(id, DeliveryReason::TransportClosed);
                continue;
            };
            match handle.queue.push(Arc::clone(&json), self.policy) {
                Ok(Enqueued::Queued) => {
                    counters::messages_pushed_total();
                    report.record_success();
                }
                Ok(Enqueued::DroppedOldest) => {
                    counters::messages_dropped_total("overflow");
                    counters::messages_pushed_total();
                    report.record_success();
                }
                Err(EnqueueError::Full) => {
                    counters::messages_dropped_total("buffer_full");
                    report.record_failure(id, DeliveryReason::BufferFull);
                }
                Err(EnqueueError::Closed(reason)) => {
                    counters::messages_dropped_total("closed");
                    self.registry.unregister(id);
                    let reason = match reason {
                        CloseReason::TimedOut => DeliveryReason::Timeout,
                        CloseReason::Closed => DeliveryReason::TransportClosed,
                    };
                    report.record_failure(id, reason);
                }
            }
        }

        gauges::groups_active(self.registry.group_names().len());
        histograms::publish_fanout_seconds(start.elapsed().as_secs_f64());
        debug!(
            kind = request.target.kind(),
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            "publish dispatched"
        );
        report
    }
}

//! Internal event broadcast — tokio::broadcast channel for cross-component events.
//!
//! Publishing never blocks the producer; delivery to any given subscriber is
//! at-least-once across process restarts, so consumers must be idempotent by
//! `(order_id, new_status)`.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::models::OrderStatus;

/// Orchestrator-wide events for notification, alerting, and monitoring.
#[derive(Debug, Clone, Serialize)]
pub enum SwapEvent {
    /// An observed order status transition.
    OrderStatusChanged {
        user_id: String,
        order_id: String,
        old_status: OrderStatus,
        new_status: OrderStatus,
        deposit_hash: Option<String>,
        settle_hash: Option<String>,
    },
    /// A DCA plan produced a new order.
    DcaExecuted {
        plan_id: i64,
        user_id: String,
        order_id: String,
        executed_count: i32,
    },
    /// A DCA execution was skipped (no settle address) or deferred (upstream
    /// failure); the plan was rescheduled.
    DcaDeferred {
        plan_id: i64,
        user_id: String,
        reason: String,
    },
    /// A limit order's price condition tripped.
    LimitTriggered {
        limit_id: i64,
        user_id: String,
        order_id: String,
    },
    /// A limit order exhausted its retry budget.
    LimitOrderDead {
        limit_id: i64,
        user_id: String,
        last_error: String,
    },
    /// The aggregator rejected a limit execution permanently.
    LimitOrderFailed {
        limit_id: i64,
        user_id: String,
        reason: String,
    },
    /// The aggregator rate-limited us; all polling paused.
    RateLimitPause { pause_secs: u64 },
}

/// Central event bus for broadcasting events to all subscribers.
pub struct EventBus {
    tx: broadcast::Sender<SwapEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: SwapEvent) {
        // Ignore error if no subscribers
        let _ = self.tx.send(event);
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<SwapEvent> {
        self.tx.subscribe()
    }

    /// Get current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(SwapEvent::RateLimitPause { pause_secs: 30 });
        match rx.recv().await.unwrap() {
            SwapEvent::RateLimitPause { pause_secs } => assert_eq!(pause_secs, 30),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new(4);
        bus.publish(SwapEvent::RateLimitPause { pause_secs: 60 });
        assert_eq!(bus.subscriber_count(), 0);
    }
}

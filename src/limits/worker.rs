//! Limit-order worker — evaluates armed orders against cached prices and
//! fires real swaps when a condition trips.
//!
//! The freshness-or-abstain rule is absolute: a snapshot older than the
//! staleness threshold never decides an execution, because the condition may
//! have been true when the price was written and false now. Transient
//! upstream failures back off exponentially; a spent retry budget parks the
//! order in `dead` and tells the user.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::aggregator::AggregatorApi;
use crate::config::LimitConfig;
use crate::db::models::{DbLimitOrder, DbPriceSnapshot, PriceCondition};
use crate::db::queries::{self, NewOrder};
use crate::events::bus::{EventBus, SwapEvent};
use crate::monitor::OrderTracker;

/// Exponential backoff cap in minutes.
const MAX_BACKOFF_MINS: i64 = 30;

/// Delay before the nth retry (1-based): 1m, 2m, 4m, 8m, 16m, then capped.
pub fn backoff_delay(retry_count: i32) -> ChronoDuration {
    let exp = (retry_count - 1).clamp(0, 30) as u32;
    let minutes = (1i64 << exp).min(MAX_BACKOFF_MINS);
    ChronoDuration::minutes(minutes)
}

/// True when the snapshot is too old to base an execution decision on.
pub fn is_stale(
    snapshot_updated_at: DateTime<Utc>,
    now: DateTime<Utc>,
    max_staleness: ChronoDuration,
) -> bool {
    now - snapshot_updated_at > max_staleness
}

/// What to do with a limit order after a transient execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Re-arm and retry after this delay.
    Retry(ChronoDuration),
    /// Retry budget exhausted.
    Dead,
}

pub fn failure_disposition(new_retry_count: i32, max_retries: i32) -> FailureDisposition {
    if new_retry_count >= max_retries {
        FailureDisposition::Dead
    } else {
        FailureDisposition::Retry(backoff_delay(new_retry_count))
    }
}

#[derive(Clone)]
pub struct LimitWorker {
    db: PgPool,
    aggregator: Arc<dyn AggregatorApi>,
    tracker: Arc<dyn OrderTracker>,
    event_bus: Arc<EventBus>,
    config: LimitConfig,
    running: Arc<AtomicBool>,
}

impl LimitWorker {
    pub fn new(
        db: PgPool,
        aggregator: Arc<dyn AggregatorApi>,
        tracker: Arc<dyn OrderTracker>,
        event_bus: Arc<EventBus>,
        config: LimitConfig,
    ) -> Self {
        Self {
            db,
            aggregator,
            tracker,
            event_bus,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn max_staleness(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.max_staleness_secs as i64)
    }

    /// Start the worker loop. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("limit worker already running");
            return;
        }

        info!(
            tick_secs = self.config.tick_interval_secs,
            max_retries = self.config.max_retries,
            "limit worker starting"
        );

        let worker = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(
                worker.config.tick_interval_secs,
            ));
            while worker.running.load(Ordering::SeqCst) {
                tick.tick().await;
                if let Err(e) = worker.run_tick().await {
                    warn!(error = %e, "limit tick failed; retrying next tick");
                }
            }
            info!("limit worker stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("limit worker stop requested");
    }

    /// One pass over every armed order whose retry window has elapsed.
    pub async fn run_tick(&self) -> crate::error::Result<usize> {
        let armed = queries::get_due_armed_limit_orders(&self.db).await?;
        if armed.is_empty() {
            return Ok(0);
        }
        debug!(armed = armed.len(), "evaluating armed limit orders");

        let mut fired = 0;
        for order in armed {
            if self.evaluate(&order).await {
                fired += 1;
            }
        }
        Ok(fired)
    }

    /// Evaluate one armed order; true when it fired.
    async fn evaluate(&self, order: &DbLimitOrder) -> bool {
        let now = Utc::now();

        let snapshot = match queries::get_price_snapshot(
            &self.db,
            &order.reference_asset,
            &order.reference_chain,
        )
        .await
        {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(
                    limit_id = order.id,
                    asset = %order.reference_asset,
                    "no price snapshot yet, waiting for refresher"
                );
                return false;
            }
            Err(e) => {
                warn!(limit_id = order.id, error = %e, "price lookup failed");
                return false;
            }
        };

        if is_stale(snapshot.updated_at, now, self.max_staleness()) {
            warn!(
                limit_id = order.id,
                asset = %order.reference_asset,
                age_secs = (now - snapshot.updated_at).num_seconds(),
                "price snapshot stale, abstaining this tick"
            );
            return false;
        }

        if !self.condition_met(order, &snapshot) {
            return false;
        }

        info!(
            limit_id = order.id,
            price = %snapshot.price,
            target = %order.target_price,
            condition = %order.condition,
            "limit condition met, triggering"
        );

        if let Err(e) = queries::mark_limit_triggered(&self.db, order.id).await {
            warn!(limit_id = order.id, error = %e, "failed to mark triggered");
            return false;
        }

        self.execute(order).await
    }

    fn condition_met(&self, order: &DbLimitOrder, snapshot: &DbPriceSnapshot) -> bool {
        match order.condition.parse::<PriceCondition>() {
            Ok(condition) => condition.is_met(snapshot.price, order.target_price),
            Err(e) => {
                error!(limit_id = order.id, error = %e, "unparseable condition");
                false
            }
        }
    }

    /// Quote → create → persist → track for a triggered order.
    async fn execute(&self, order: &DbLimitOrder) -> bool {
        let user = match queries::get_user(&self.db, &order.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                self.fail_permanently(order, "owner not found").await;
                return false;
            }
            Err(e) => {
                self.handle_transient(order, &format!("owner lookup failed: {e}"))
                    .await;
                return false;
            }
        };

        let Some(settle_address) = user.settle_address.as_deref() else {
            self.fail_permanently(order, "user has no settlement address")
                .await;
            return false;
        };

        // An expired or repriced quote is retryable: the next attempt starts
        // from a fresh quote anyway. Only user-fixable and fatal rejections
        // end the order.
        let quote = match self
            .aggregator
            .get_quote(
                &order.from_asset,
                &order.from_network,
                &order.to_asset,
                &order.to_network,
                order.amount,
            )
            .await
        {
            Ok(quote) => quote,
            Err(e) if e.is_retryable() => {
                self.handle_transient(order, &e.to_string()).await;
                return false;
            }
            Err(e) => {
                self.fail_permanently(order, &e.to_string()).await;
                return false;
            }
        };

        let created = match self
            .aggregator
            .create_order(&quote.id, settle_address, user.refund_address.as_deref())
            .await
        {
            Ok(created) => created,
            Err(e) if e.is_retryable() => {
                self.handle_transient(order, &e.to_string()).await;
                return false;
            }
            Err(e) => {
                self.fail_permanently(order, &e.to_string()).await;
                return false;
            }
        };

        let new_order = NewOrder {
            sideshift_order_id: created.id.clone(),
            user_id: order.user_id.clone(),
            from_asset: order.from_asset.clone(),
            from_network: order.from_network.clone(),
            from_amount: order.amount,
            to_asset: order.to_asset.clone(),
            to_network: order.to_network.clone(),
            settle_amount: created.settle_amount.or(Some(quote.settle_amount)),
            deposit_address: created.deposit_address.clone(),
            deposit_memo: created.deposit_memo.clone(),
        };

        if let Err(e) = queries::complete_limit_execution(&self.db, order.id, &new_order).await {
            error!(
                limit_id = order.id,
                order_id = %created.id,
                error = %e,
                "aggregator order created but persistence failed"
            );
            self.handle_transient(order, "persistence failed").await;
            return false;
        }

        if let Err(e) = self
            .tracker
            .track(&created.id, &order.user_id, Utc::now())
            .await
        {
            warn!(order_id = %created.id, error = %e, "monitor registration failed");
        }

        info!(limit_id = order.id, order_id = %created.id, "limit order executing");

        self.event_bus.publish(SwapEvent::LimitTriggered {
            limit_id: order.id,
            user_id: order.user_id.clone(),
            order_id: created.id,
        });
        true
    }

    /// Transient failure: bump the counter, back off or die.
    async fn handle_transient(&self, order: &DbLimitOrder, reason: &str) {
        let new_count = order.retry_count + 1;
        match failure_disposition(new_count, self.config.max_retries) {
            FailureDisposition::Retry(delay) => {
                let retry_after = Utc::now() + delay;
                warn!(
                    limit_id = order.id,
                    retry_count = new_count,
                    retry_in_secs = delay.num_seconds(),
                    reason,
                    "limit execution failed, backing off"
                );
                if let Err(e) = queries::record_limit_failure(
                    &self.db,
                    order.id,
                    Some(retry_after),
                    reason,
                    false,
                )
                .await
                {
                    error!(limit_id = order.id, error = %e, "failed to record retry state");
                }
            }
            FailureDisposition::Dead => {
                error!(
                    limit_id = order.id,
                    retry_count = new_count,
                    reason,
                    "limit order retry budget exhausted, marking dead"
                );
                if let Err(e) =
                    queries::record_limit_failure(&self.db, order.id, None, reason, true).await
                {
                    error!(limit_id = order.id, error = %e, "failed to record dead state");
                }
                self.event_bus.publish(SwapEvent::LimitOrderDead {
                    limit_id: order.id,
                    user_id: order.user_id.clone(),
                    last_error: reason.to_string(),
                });
            }
        }
    }

    /// Permanent rejection: no retry can help.
    async fn fail_permanently(&self, order: &DbLimitOrder, reason: &str) {
        error!(limit_id = order.id, reason, "limit order failed permanently");
        if let Err(e) = queries::mark_limit_failed(&self.db, order.id, reason).await {
            error!(limit_id = order.id, error = %e, "failed to record failed state");
        }
        self.event_bus.publish(SwapEvent::LimitOrderFailed {
            limit_id: order.id,
            user_id: order.user_id.clone(),
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence() {
        assert_eq!(backoff_delay(1), ChronoDuration::minutes(1));
        assert_eq!(backoff_delay(2), ChronoDuration::minutes(2));
        assert_eq!(backoff_delay(3), ChronoDuration::minutes(4));
        assert_eq!(backoff_delay(4), ChronoDuration::minutes(8));
        assert_eq!(backoff_delay(5), ChronoDuration::minutes(16));
        // Capped from here on.
        assert_eq!(backoff_delay(6), ChronoDuration::minutes(30));
        assert_eq!(backoff_delay(12), ChronoDuration::minutes(30));
    }

    #[test]
    fn staleness_guard() {
        let now = Utc::now();
        let max = ChronoDuration::minutes(10);
        // 15-minute-old snapshot must not decide anything.
        assert!(is_stale(now - ChronoDuration::minutes(15), now, max));
        // A 9-minute-old snapshot is still usable.
        assert!(!is_stale(now - ChronoDuration::minutes(9), now, max));
        // Exactly at the threshold is still fresh ("older than" trips it).
        assert!(!is_stale(now - max, now, max));
    }

    #[test]
    fn retry_budget_exhaustion() {
        // Five attempts: four backoffs, then dead on the fifth failure.
        for count in 1..5 {
            match failure_disposition(count, 5) {
                FailureDisposition::Retry(delay) => {
                    assert_eq!(delay, backoff_delay(count));
                }
                FailureDisposition::Dead => panic!("died too early at {count}"),
            }
        }
        assert_eq!(failure_disposition(5, 5), FailureDisposition::Dead);
        assert_eq!(failure_disposition(6, 5), FailureDisposition::Dead);
    }
}

//! DCA scheduler — executes each recurring plan exactly once per due window,
//! safe under multiple concurrent scheduler instances.
//!
//! Mutual exclusion lives in the database: due plans are claimed with
//! `FOR UPDATE SKIP LOCKED` and stamped with a future-dated lock sentinel in
//! the same transaction, so no application-level check-then-write race can
//! double-execute a plan. A crashed claimant's plans become due again once
//! the sentinel elapses.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::aggregator::AggregatorApi;
use crate::config::DcaConfig;
use crate::db::models::DbDcaPlan;
use crate::db::queries::{self, NewOrder};
use crate::events::bus::{EventBus, SwapEvent};
use crate::monitor::OrderTracker;

#[derive(Clone)]
pub struct DcaScheduler {
    db: PgPool,
    aggregator: Arc<dyn AggregatorApi>,
    tracker: Arc<dyn OrderTracker>,
    event_bus: Arc<EventBus>,
    config: DcaConfig,
    running: Arc<AtomicBool>,
}

impl DcaScheduler {
    pub fn new(
        db: PgPool,
        aggregator: Arc<dyn AggregatorApi>,
        tracker: Arc<dyn OrderTracker>,
        event_bus: Arc<EventBus>,
        config: DcaConfig,
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

    fn retry_delay(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.retry_delay_secs as i64)
    }

    fn max_processing_time(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.max_processing_time_secs as i64)
    }

    /// Start the scheduler loop. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("dca scheduler already running");
            return;
        }

        info!(
            tick_secs = self.config.tick_interval_secs,
            "dca scheduler starting"
        );

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(
                scheduler.config.tick_interval_secs,
            ));
            while scheduler.running.load(Ordering::SeqCst) {
                tick.tick().await;
                if let Err(e) = scheduler.process_due().await {
                    warn!(error = %e, "dca tick failed; retrying next tick");
                }
            }
            info!("dca scheduler stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("dca scheduler stop requested");
    }

    /// Claim every due plan and execute the claims concurrently. The claim
    /// itself commits before any execution starts, so a slow aggregator call
    /// never extends the lock transaction.
    pub async fn process_due(&self) -> crate::error::Result<usize> {
        let claimed = queries::claim_due_plans(&self.db, self.max_processing_time()).await?;
        if claimed.is_empty() {
            debug!("no dca plans due");
            return Ok(0);
        }

        info!(claimed = claimed.len(), "claimed due dca plans");
        let count = claimed.len();

        for plan in claimed {
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.execute_plan(plan).await;
            });
        }

        Ok(count)
    }

    /// Run one claimed plan through quote → order → persist → track.
    /// Every failure path releases the claim by rescheduling the plan.
    async fn execute_plan(&self, plan: DbDcaPlan) {
        let interval = ChronoDuration::hours(plan.interval_hours as i64);

        let user = match queries::get_user(&self.db, &plan.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!(plan_id = plan.id, user_id = %plan.user_id, "plan owner not found");
                self.defer(&plan, Utc::now() + interval, "owner missing").await;
                return;
            }
            Err(e) => {
                warn!(plan_id = plan.id, error = %e, "failed to load plan owner");
                self.defer(&plan, Utc::now() + self.retry_delay(), "owner lookup failed")
                    .await;
                return;
            }
        };

        let Some(settle_address) = user.settle_address.as_deref() else {
            info!(
                plan_id = plan.id,
                user_id = %plan.user_id,
                "user has no settlement address, releasing claim until next interval"
            );
            self.defer(&plan, Utc::now() + interval, "no settlement address")
                .await;
            return;
        };

        // Retryable failures (transient, expired quote) take the short retry
        // delay; user-fixable or fatal rejections release the claim until the
        // next interval so a bad address does not spin every five minutes.
        let quote = match self
            .aggregator
            .get_quote(
                &plan.from_asset,
                &plan.from_network,
                &plan.to_asset,
                &plan.to_network,
                plan.amount,
            )
            .await
        {
            Ok(quote) => quote,
            Err(e) if e.is_retryable() => {
                warn!(plan_id = plan.id, error = %e, "quote request failed, will retry");
                self.defer(&plan, Utc::now() + self.retry_delay(), "quote failed")
                    .await;
                return;
            }
            Err(e) => {
                warn!(plan_id = plan.id, error = %e, "aggregator rejected quote request");
                self.defer(&plan, Utc::now() + interval, "aggregator rejected request")
                    .await;
                return;
            }
        };

        let created = match self
            .aggregator
            .create_order(&quote.id, settle_address, user.refund_address.as_deref())
            .await
        {
            Ok(order) => order,
            Err(e) if e.is_retryable() => {
                warn!(plan_id = plan.id, error = %e, "order creation failed, will retry");
                self.defer(&plan, Utc::now() + self.retry_delay(), "order creation failed")
                    .await;
                return;
            }
            Err(e) => {
                warn!(plan_id = plan.id, error = %e, "aggregator rejected order creation");
                self.defer(&plan, Utc::now() + interval, "aggregator rejected request")
                    .await;
                return;
            }
        };

        let order = NewOrder {
            sideshift_order_id: created.id.clone(),
            user_id: plan.user_id.clone(),
            from_asset: plan.from_asset.clone(),
            from_network: plan.from_network.clone(),
            from_amount: plan.amount,
            to_asset: plan.to_asset.clone(),
            to_network: plan.to_network.clone(),
            settle_amount: created.settle_amount.or(Some(quote.settle_amount)),
            deposit_address: created.deposit_address.clone(),
            deposit_memo: created.deposit_memo.clone(),
        };

        // Order row, watch row, executed_count bump, and next schedule all
        // commit together.
        if let Err(e) = queries::complete_dca_execution(&self.db, &plan, &order).await {
            error!(
                plan_id = plan.id,
                order_id = %created.id,
                error = %e,
                "aggregator order created but persistence failed"
            );
            self.defer(&plan, Utc::now() + self.retry_delay(), "persistence failed")
                .await;
            return;
        }

        if let Err(e) = self
            .tracker
            .track(&created.id, &plan.user_id, Utc::now())
            .await
        {
            // The watch row is already durable; reconcile will pick it up.
            warn!(order_id = %created.id, error = %e, "monitor registration failed");
        }

        info!(
            plan_id = plan.id,
            order_id = %created.id,
            executed_count = plan.executed_count + 1,
            "dca plan executed"
        );

        self.event_bus.publish(SwapEvent::DcaExecuted {
            plan_id: plan.id,
            user_id: plan.user_id.clone(),
            order_id: created.id,
            executed_count: plan.executed_count + 1,
        });
    }

    /// Release the claim by moving the plan's due time, and tell the user's
    /// channels why.
    async fn defer(&self, plan: &DbDcaPlan, at: chrono::DateTime<Utc>, reason: &str) {
        if let Err(e) = queries::reschedule_plan(&self.db, plan.id, at).await {
            error!(plan_id = plan.id, error = %e, "failed to reschedule plan");
        }
        self.event_bus.publish(SwapEvent::DcaDeferred {
            plan_id: plan.id,
            user_id: plan.user_id.clone(),
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_follow_config() {
        let config: DcaConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        let scheduler_retry = ChronoDuration::seconds(config.retry_delay_secs as i64);
        let sentinel = ChronoDuration::seconds(config.max_processing_time_secs as i64);
        assert_eq!(scheduler_retry, ChronoDuration::minutes(5));
        assert_eq!(sentinel, ChronoDuration::minutes(10));
    }
}

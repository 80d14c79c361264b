//! Order monitor — polls the aggregator for every outstanding order with an
//! age-adaptive cadence, persists status transitions, and notifies listeners.
//!
//! The in-memory tracked set is rebuildable from `watched_orders` at any
//! time, so a crash never loses an order: `load_pending` reseeds on startup
//! and the hourly reconcile pass force-polls everything once.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rand::Rng;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

use super::OrderTracker;
use crate::aggregator::AggregatorApi;
use crate::config::MonitorConfig;
use crate::db::models::OrderStatus;
use crate::db::queries;
use crate::error::Result;
use crate::events::bus::{EventBus, SwapEvent};

/// Wait this long for in-flight polls when stopping; matches the aggregator
/// client's hard HTTP timeout.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(20);

/// Fallback pause when a 429 carries no Retry-After header.
const DEFAULT_PAUSE_SECS: u64 = 60;

/// Maximum random jitter applied after a rate-limit pause lifts, so multiple
/// instances do not resume in lockstep.
const RESUME_JITTER_MS: u64 = 5_000;

/// An order in the in-memory tracked set.
#[derive(Debug, Clone)]
pub struct TrackedOrder {
    pub order_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_status: OrderStatus,
    pub last_checked: Option<DateTime<Utc>>,
}

/// Polling interval for an order of the given age.
pub fn interval_for_age(age: ChronoDuration) -> ChronoDuration {
    if age < ChronoDuration::minutes(5) {
        ChronoDuration::seconds(15)
    } else if age < ChronoDuration::minutes(30) {
        ChronoDuration::seconds(60)
    } else if age < ChronoDuration::hours(2) {
        ChronoDuration::minutes(5)
    } else {
        ChronoDuration::minutes(15)
    }
}

/// Polls every tracked order until it reaches a terminal state.
#[derive(Clone)]
pub struct OrderMonitor {
    db: PgPool,
    aggregator: Arc<dyn AggregatorApi>,
    event_bus: Arc<EventBus>,
    config: MonitorConfig,
    tracked: Arc<DashMap<String, TrackedOrder>>,
    running: Arc<AtomicBool>,
    paused_until: Arc<parking_lot::Mutex<Option<DateTime<Utc>>>>,
    permits: Arc<Semaphore>,
}

impl OrderMonitor {
    pub fn new(
        db: PgPool,
        aggregator: Arc<dyn AggregatorApi>,
        event_bus: Arc<EventBus>,
        config: MonitorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            db,
            aggregator,
            event_bus,
            config,
            tracked: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            paused_until: Arc::new(parking_lot::Mutex::new(None)),
            permits,
        }
    }

    /// Register an order for monitoring. Idempotent on both the in-memory
    /// set and the durable watch row.
    pub async fn track(
        &self,
        order_id: &str,
        user_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        queries::insert_watched_order(&self.db, order_id, user_id, OrderStatus::Pending).await?;
        self.note_tracked(order_id, user_id, created_at, OrderStatus::Pending);
        debug!(order_id, user_id, "tracking order");
        Ok(())
    }

    /// Remove from the in-memory set; persisted rows stay.
    pub fn untrack(&self, order_id: &str) {
        if self.tracked.remove(order_id).is_some() {
            debug!(order_id, "untracked order");
        }
    }

    /// Memory-only registration; keeps an existing entry's poll state.
    fn note_tracked(
        &self,
        order_id: &str,
        user_id: &str,
        created_at: DateTime<Utc>,
        last_status: OrderStatus,
    ) {
        self.tracked
            .entry(order_id.to_string())
            .or_insert_with(|| TrackedOrder {
                order_id: order_id.to_string(),
                user_id: user_id.to_string(),
                created_at,
                last_status,
                last_checked: None,
            });
    }

    /// Seed the tracked set from every non-terminal order. Idempotent;
    /// called at startup and from `reconcile`.
    pub async fn load_pending(&self) -> Result<usize> {
        let open = queries::get_open_orders(&self.db).await?;
        let mut seeded = 0;
        for order in &open {
            let status = order
                .status
                .parse::<OrderStatus>()
                .unwrap_or(OrderStatus::Pending);
            if status.is_terminal() {
                continue;
            }
            if !self.tracked.contains_key(&order.sideshift_order_id) {
                seeded += 1;
            }
            self.note_tracked(&order.sideshift_order_id, &order.user_id, order.created_at, status);
        }
        info!(
            loaded = open.len(),
            newly_seeded = seeded,
            tracked = self.tracked.len(),
            "pending orders loaded"
        );
        Ok(seeded)
    }

    /// Reload from the database, then force-poll every tracked order once,
    /// ignoring per-order cadence. Per-order failures never abort the batch.
    pub async fn reconcile(&self) {
        if let Err(e) = self.load_pending().await {
            warn!(error = %e, "reconcile: load_pending failed");
        }

        let ids: Vec<String> = self.tracked.iter().map(|e| e.key().clone()).collect();
        info!(count = ids.len(), "reconcile: force-polling tracked orders");

        for order_id in ids {
            if self.is_paused(Utc::now()) {
                debug!("reconcile: paused by rate limit, stopping batch");
                break;
            }
            if let Err(e) = self.poll_one(&order_id).await {
                warn!(order_id = %order_id, error = %e, "reconcile: poll failed, continuing");
            }
        }
    }

    /// Listener registration: every observed transition is delivered to every
    /// subscriber. Delivery is at-least-once; consume idempotently.
    pub fn subscribe(&self) -> broadcast::Receiver<SwapEvent> {
        self.event_bus.subscribe()
    }

    pub fn is_tracked(&self, order_id: &str) -> bool {
        self.tracked.contains_key(order_id)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Whether polling is currently suspended by a rate-limit pause.
    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        match *self.paused_until.lock() {
            Some(until) => now < until,
            None => false,
        }
    }

    fn set_pause(&self, retry_after: Option<u64>) {
        let secs = retry_after.unwrap_or(DEFAULT_PAUSE_SECS);
        let until = Utc::now() + ChronoDuration::seconds(secs as i64);
        *self.paused_until.lock() = Some(until);
        warn!(pause_secs = secs, "rate limited — pausing all polling");
        self.event_bus
            .publish(SwapEvent::RateLimitPause { pause_secs: secs });
    }

    /// Clear an expired pause; true if a pause just lifted.
    fn lift_pause_if_expired(&self, now: DateTime<Utc>) -> bool {
        let mut guard = self.paused_until.lock();
        match *guard {
            Some(until) if now >= until => {
                *guard = None;
                true
            }
            _ => false,
        }
    }

    /// Orders due for a poll at `now`, given the age-based cadence. Marks
    /// them checked immediately so an overlapping tick cannot re-select them.
    fn claim_due(&self, now: DateTime<Utc>) -> Vec<TrackedOrder> {
        let mut due = Vec::new();
        for mut entry in self.tracked.iter_mut() {
            let order = entry.value_mut();
            let interval = interval_for_age(now - order.created_at);
            let is_due = match order.last_checked {
                None => true,
                Some(at) => now - at >= interval,
            };
            if is_due {
                order.last_checked = Some(now);
                due.push(order.clone());
            }
        }
        due
    }

    /// Start the polling loop. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("order monitor already running");
            return;
        }

        info!(
            tick_secs = self.config.tick_interval_secs,
            max_concurrent = self.config.max_concurrent,
            "order monitor starting"
        );

        let monitor = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(monitor.config.tick_interval());
            let mut reconcile = tokio::time::interval(monitor.config.reconcile_interval());
            reconcile.tick().await; // consume the immediate first tick

            while monitor.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = tick.tick() => monitor.run_tick().await,
                    _ = reconcile.tick() => monitor.reconcile().await,
                }
            }

            info!("order monitor stopped");
        });
    }

    /// Signal the loop to stop and wait for in-flight polls to drain.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let all = self.config.max_concurrent as u32;
        match tokio::time::timeout(DRAIN_TIMEOUT, self.permits.acquire_many(all)).await {
            Ok(Ok(permits)) => drop(permits),
            Ok(Err(_)) => {}
            Err(_) => warn!("order monitor stop: in-flight polls did not drain in time"),
        }
        info!("order monitor stop requested");
    }

    async fn run_tick(&self) {
        let now = Utc::now();

        if self.is_paused(now) {
            debug!("polling paused by rate limit, skipping tick");
            return;
        }
        if self.lift_pause_if_expired(now) {
            // Desynchronize instances resuming from the same 429.
            let jitter = rand::thread_rng().gen_range(0..=RESUME_JITTER_MS);
            debug!(jitter_ms = jitter, "rate-limit pause lifted, resuming after jitter");
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        let due = self.claim_due(now);
        if due.is_empty() {
            return;
        }
        debug!(due = due.len(), tracked = self.tracked.len(), "dispatching polls");

        for order in due {
            let monitor = self.clone();
            tokio::spawn(async move {
                let permit = match monitor.permits.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                if let Err(e) = monitor.poll_one(&order.order_id).await {
                    warn!(order_id = %order.order_id, error = %e, "poll failed");
                }
                drop(permit);
            });
        }
    }

    /// Poll one order and handle whatever the aggregator reports.
    async fn poll_one(&self, order_id: &str) -> Result<()> {
        let snapshot = match self.aggregator.get_order_status(order_id).await {
            Ok(s) => s,
            Err(e) if e.is_rate_limited() => {
                self.set_pause(e.retry_after);
                return Ok(());
            }
            Err(e) if e.is_transient() => {
                // Leave last_status untouched; the next tick retries.
                debug!(order_id, error = %e, "transient poll failure");
                return Ok(());
            }
            Err(e) => {
                error!(order_id, error = %e, "permanent poll failure");
                return Ok(());
            }
        };

        let new_status = match snapshot.order_status() {
            Ok(s) => s,
            Err(e) => {
                warn!(order_id, error = %e, "aggregator reported unknown status");
                return Ok(());
            }
        };

        let (user_id, old_status) = match self.tracked.get(order_id) {
            Some(entry) => (entry.user_id.clone(), entry.last_status),
            None => return Ok(()),
        };

        if new_status == old_status {
            return Ok(());
        }

        if !old_status.can_transition_to(new_status) {
            // The aggregator is authoritative; record it, but flag the jump.
            warn!(
                order_id,
                old = %old_status,
                new = %new_status,
                "transition not reachable in expected state machine"
            );
        }

        info!(order_id, old = %old_status, new = %new_status, "order status changed");

        // Publish before persisting: a failed persist re-observes the same
        // transition next tick, giving listeners at-least-once delivery.
        self.event_bus.publish(SwapEvent::OrderStatusChanged {
            user_id: user_id.clone(),
            order_id: order_id.to_string(),
            old_status,
            new_status,
            deposit_hash: snapshot.deposit_hash.clone(),
            settle_hash: snapshot.settle_hash.clone(),
        });

        if let Err(e) = queries::persist_transition(
            &self.db,
            order_id,
            old_status,
            new_status,
            Some(&snapshot.fingerprint()),
        )
        .await
        {
            warn!(order_id, error = %e, "failed to persist transition; will retry next tick");
            return Ok(());
        }

        if let Some(mut entry) = self.tracked.get_mut(order_id) {
            entry.last_status = new_status;
        }

        if new_status.is_terminal() {
            self.untrack(order_id);
            info!(order_id, status = %new_status, "order reached terminal state");
        }

        Ok(())
    }
}

#[async_trait]
impl OrderTracker for OrderMonitor {
    async fn track(&self, order_id: &str, user_id: &str, created_at: DateTime<Utc>) -> Result<()> {
        OrderMonitor::track(self, order_id, user_id, created_at).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{
        AggregatorFailure, Checkout, CreatedOrder, OrderSnapshot, PairRate, Quote,
    };
    use rust_decimal::Decimal;

    struct FakeAggregator;

    #[async_trait]
    impl AggregatorApi for FakeAggregator {
        async fn get_quote(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
            _: Decimal,
        ) -> std::result::Result<Quote, AggregatorFailure> {
            Err(AggregatorFailure::network("fake"))
        }
        async fn create_order(
            &self,
            _: &str,
            _: &str,
            _: Option<&str>,
        ) -> std::result::Result<CreatedOrder, AggregatorFailure> {
            Err(AggregatorFailure::network("fake"))
        }
        async fn get_order_status(
            &self,
            _: &str,
        ) -> std::result::Result<OrderSnapshot, AggregatorFailure> {
            Err(AggregatorFailure::network("fake"))
        }
        async fn create_checkout(
            &self,
            _: &str,
            _: &str,
            _: Decimal,
            _: &str,
        ) -> std::result::Result<Checkout, AggregatorFailure> {
            Err(AggregatorFailure::network("fake"))
        }
        async fn get_pair_rate(
            &self,
            _: &str,
            _: &str,
        ) -> std::result::Result<PairRate, AggregatorFailure> {
            Err(AggregatorFailure::network("fake"))
        }
    }

    fn monitor() -> OrderMonitor {
        let config: MonitorConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        OrderMonitor::new(
            PgPool::connect_lazy("postgres://localhost/unused").unwrap(),
            Arc::new(FakeAggregator),
            Arc::new(EventBus::new(16)),
            config,
        )
    }

    #[test]
    fn cadence_bands() {
        assert_eq!(
            interval_for_age(ChronoDuration::seconds(30)),
            ChronoDuration::seconds(15)
        );
        assert_eq!(
            interval_for_age(ChronoDuration::minutes(4)),
            ChronoDuration::seconds(15)
        );
        assert_eq!(
            interval_for_age(ChronoDuration::minutes(5)),
            ChronoDuration::seconds(60)
        );
        assert_eq!(
            interval_for_age(ChronoDuration::minutes(29)),
            ChronoDuration::seconds(60)
        );
        assert_eq!(
            interval_for_age(ChronoDuration::minutes(30)),
            ChronoDuration::minutes(5)
        );
        assert_eq!(
            interval_for_age(ChronoDuration::hours(1)),
            ChronoDuration::minutes(5)
        );
        assert_eq!(
            interval_for_age(ChronoDuration::hours(2)),
            ChronoDuration::minutes(15)
        );
        assert_eq!(
            interval_for_age(ChronoDuration::days(3)),
            ChronoDuration::minutes(15)
        );
    }

    #[tokio::test]
    async fn note_tracked_is_idempotent() {
        let m = monitor();
        let t0 = Utc::now();
        m.note_tracked("X1", "user-1", t0, OrderStatus::Pending);
        m.note_tracked("X1", "user-1", t0, OrderStatus::Pending);
        assert_eq!(m.tracked_count(), 1);

        m.untrack("X1");
        assert_eq!(m.tracked_count(), 0);

        m.note_tracked("X1", "user-1", t0, OrderStatus::Pending);
        assert_eq!(m.tracked_count(), 1);
        assert!(m.is_tracked("X1"));
    }

    #[tokio::test]
    async fn note_tracked_preserves_existing_poll_state() {
        let m = monitor();
        let t0 = Utc::now();
        m.note_tracked("X1", "user-1", t0, OrderStatus::Pending);
        m.tracked.get_mut("X1").unwrap().last_status = OrderStatus::Processing;

        // A reseed (load_pending path) must not clobber observed state.
        m.note_tracked("X1", "user-1", t0, OrderStatus::Pending);
        assert_eq!(
            m.tracked.get("X1").unwrap().last_status,
            OrderStatus::Processing
        );
    }

    #[tokio::test]
    async fn claim_due_respects_cadence_and_marks_checked() {
        let m = monitor();
        let now = Utc::now();

        // Fresh order, never checked: due immediately.
        m.note_tracked("A", "u", now - ChronoDuration::seconds(30), OrderStatus::Pending);
        // Young order checked 5s ago: 15s cadence, not due.
        m.note_tracked("B", "u", now - ChronoDuration::seconds(60), OrderStatus::Pending);
        m.tracked.get_mut("B").unwrap().last_checked = Some(now - ChronoDuration::seconds(5));
        // Old order checked 6 minutes ago: 5min cadence, due.
        m.note_tracked("C", "u", now - ChronoDuration::hours(1), OrderStatus::Processing);
        m.tracked.get_mut("C").unwrap().last_checked = Some(now - ChronoDuration::minutes(6));

        let due: Vec<String> = m.claim_due(now).into_iter().map(|o| o.order_id).collect();
        assert!(due.contains(&"A".to_string()));
        assert!(!due.contains(&"B".to_string()));
        assert!(due.contains(&"C".to_string()));

        // Immediately re-claiming yields nothing: the batch was marked.
        assert!(m.claim_due(now).is_empty());
    }

    #[tokio::test]
    async fn pause_window_arithmetic() {
        let m = monitor();
        let now = Utc::now();
        assert!(!m.is_paused(now));

        m.set_pause(Some(30));
        assert!(m.is_paused(now));
        assert!(m.is_paused(now + ChronoDuration::seconds(29)));
        assert!(!m.is_paused(now + ChronoDuration::seconds(31)));

        // Pause lifts exactly once.
        assert!(m.lift_pause_if_expired(now + ChronoDuration::seconds(31)));
        assert!(!m.lift_pause_if_expired(now + ChronoDuration::seconds(31)));
        assert!(!m.is_paused(now));
    }

    #[tokio::test]
    async fn pause_without_retry_after_uses_fallback() {
        let m = monitor();
        m.set_pause(None);
        let now = Utc::now();
        assert!(m.is_paused(now + ChronoDuration::seconds(DEFAULT_PAUSE_SECS as i64 - 2)));
        assert!(!m.is_paused(now + ChronoDuration::seconds(DEFAULT_PAUSE_SECS as i64 + 2)));
    }
}

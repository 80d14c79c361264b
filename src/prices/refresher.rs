//! Price snapshot refresher — the sole producer for `price_snapshots`.
//!
//! Keeps a fresh cached price for every `(asset, chain)` pair that some
//! armed limit order references. Consumers are read-only and apply their own
//! staleness guard, so a wedged refresher degrades to abstention, never to
//! stale executions.

use chrono::Duration as ChronoDuration;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::aggregator::AggregatorApi;
use crate::config::{LimitConfig, PricesConfig};
use crate::db::queries;

/// Prices are quoted against this settle asset.
const QUOTE_ASSET: &str = "usdc";

#[derive(Clone)]
pub struct PriceRefresher {
    db: PgPool,
    aggregator: Arc<dyn AggregatorApi>,
    config: PricesConfig,
    snapshot_ttl: ChronoDuration,
    running: Arc<AtomicBool>,
}

impl PriceRefresher {
    pub fn new(
        db: PgPool,
        aggregator: Arc<dyn AggregatorApi>,
        config: PricesConfig,
        limit_config: &LimitConfig,
    ) -> Self {
        Self {
            db,
            aggregator,
            config,
            snapshot_ttl: ChronoDuration::seconds(limit_config.max_staleness_secs as i64),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the refresh loop. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("price refresher already running");
            return;
        }

        info!(
            tick_secs = self.config.tick_interval_secs,
            "price refresher starting"
        );

        let refresher = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(
                refresher.config.tick_interval_secs,
            ));
            while refresher.running.load(Ordering::SeqCst) {
                tick.tick().await;
                if let Err(e) = refresher.refresh_once().await {
                    warn!(error = %e, "price refresh failed; retrying next tick");
                }
            }
            info!("price refresher stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("price refresher stop requested");
    }

    /// Refresh every referenced pair once. Per-pair failures are logged and
    /// skipped so one bad asset cannot starve the rest.
    pub async fn refresh_once(&self) -> crate::error::Result<usize> {
        let pairs = queries::get_active_reference_pairs(&self.db).await?;
        if pairs.is_empty() {
            debug!("no armed limit orders, nothing to refresh");
            return Ok(0);
        }

        let mut refreshed = 0;
        for (asset, chain) in pairs {
            match self.aggregator.get_pair_rate(&asset, QUOTE_ASSET).await {
                Ok(rate) => {
                    if let Err(e) = queries::upsert_price_snapshot(
                        &self.db,
                        &asset,
                        &chain,
                        rate.rate,
                        self.snapshot_ttl,
                    )
                    .await
                    {
                        warn!(asset = %asset, chain = %chain, error = %e, "snapshot upsert failed");
                        continue;
                    }
                    debug!(asset = %asset, chain = %chain, price = %rate.rate, "price refreshed");
                    refreshed += 1;
                }
                Err(e) => {
                    warn!(asset = %asset, chain = %chain, error = %e, "pair rate fetch failed");
                }
            }
        }

        Ok(refreshed)
    }
}

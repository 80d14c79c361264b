//! Swap Orchestrator — Entry Point
//!
//! Loads configuration, initializes all subsystems, and runs until shutdown.
//! Handles graceful shutdown on SIGINT/SIGTERM: tick loops stop, in-flight
//! polls drain, and persisted state carries everything across the restart.

mod aggregator;
mod config;
mod db;
mod error;
mod events;
mod intent;
mod limits;
mod logging;
mod monitor;
mod prices;
mod scheduler;
mod telegram;
mod web;

use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use crate::aggregator::{AggregatorApi, SideShiftClient};
use crate::config::Config;
use crate::db::pool;
use crate::events::bus::EventBus;
use crate::limits::worker::LimitWorker;
use crate::monitor::order_monitor::OrderMonitor;
use crate::monitor::OrderTracker;
use crate::prices::refresher::PriceRefresher;
use crate::scheduler::dca::DcaScheduler;
use crate::web::auth::AuthVerifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file (ignore if missing)
    let _ = dotenvy::dotenv();

    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    logging::structured::init_logging(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "swap-orchestrator starting"
    );

    // Initialize database
    let db_pool = pool::create_pool(&config.database).await?;
    pool::run_migrations(&db_pool).await?;
    info!("database connected and migrations applied");

    // Initialize event bus
    let event_bus = Arc::new(EventBus::new(1024));

    // The aggregator client is process-wide: one connection pool, injected
    // into every component as a capability so tests can swap a fake.
    let aggregator: Arc<dyn AggregatorApi> =
        Arc::new(SideShiftClient::new(&config.aggregator)?);

    // Order monitor: seed the tracked set from persisted watch rows before
    // the first tick so a restart never loses an order.
    let order_monitor = OrderMonitor::new(
        db_pool.clone(),
        aggregator.clone(),
        event_bus.clone(),
        config.monitor.clone(),
    );
    order_monitor.load_pending().await?;
    order_monitor.start();

    // Producers hand new orders to the monitor through this capability.
    let tracker: Arc<dyn OrderTracker> = Arc::new(order_monitor.clone());

    // DCA scheduler
    let dca_scheduler = DcaScheduler::new(
        db_pool.clone(),
        aggregator.clone(),
        tracker.clone(),
        event_bus.clone(),
        config.dca.clone(),
    );
    dca_scheduler.start();

    // Limit-order worker
    let limit_worker = LimitWorker::new(
        db_pool.clone(),
        aggregator.clone(),
        tracker.clone(),
        event_bus.clone(),
        config.limit.clone(),
    );
    limit_worker.start();

    // Price snapshot refresher feeding the limit worker
    let price_refresher = PriceRefresher::new(
        db_pool.clone(),
        aggregator.clone(),
        config.prices.clone(),
        &config.limit,
    );
    price_refresher.start();

    // Telegram notifier (if configured)
    let _telegram_handle = if config.telegram.bot_token.is_some() {
        let notifier = telegram::notifier::TelegramNotifier::new(
            config.telegram.clone(),
            event_bus.subscribe(),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = notifier.run().await {
                error!(error = %e, "telegram notifier error");
            }
        }))
    } else {
        None
    };

    // Web API (if enabled)
    let _web_handle = if config.web.enabled {
        let auth = Arc::new(AuthVerifier::new(&config.auth));
        let web_server = web::server::WebServer::new(
            config.web.clone(),
            db_pool.clone(),
            aggregator.clone(),
            order_monitor.clone(),
            auth,
        );
        Some(tokio::spawn(async move {
            if let Err(e) = web_server.start().await {
                error!(error = %e, "web server error");
            }
        }))
    } else {
        None
    };

    info!("all subsystems started, waiting for shutdown signal");

    // Wait for shutdown signal
    let shutdown = async {
        let ctrl_c = signal::ctrl_c();
        #[cfg(unix)]
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => { info!("received SIGINT"); }
            _ = sigterm.recv() => { info!("received SIGTERM"); }
        }
    };

    shutdown.await;

    // Graceful shutdown: stop producing, then drain the monitor's in-flight
    // polls. Durable state (watched_orders, dca_plans, limit_orders) makes
    // everything else recoverable on restart.
    warn!("shutting down");
    dca_scheduler.stop();
    limit_worker.stop();
    price_refresher.stop();
    order_monitor.stop().await;

    info!("shutdown complete");
    Ok(())
}

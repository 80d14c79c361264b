//! Telegram notifier — forwards user-visible swap events as chat alerts.
//!
//! Pure consumer: it subscribes to the event bus and never blocks producers.
//! A lagged receiver logs and keeps going; dropped alerts are acceptable,
//! the durable record lives in the status log.

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::TelegramConfig;
use crate::db::models::OrderStatus;
use crate::events::bus::SwapEvent;

pub struct TelegramNotifier {
    config: TelegramConfig,
    events: broadcast::Receiver<SwapEvent>,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig, events: broadcast::Receiver<SwapEvent>) -> Self {
        Self {
            config,
            events,
            client: reqwest::Client::new(),
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let token = match &self.config.bot_token {
            Some(t) => t.expose().to_string(),
            None => {
                warn!("telegram bot token not configured, skipping");
                return Ok(());
            }
        };
        let chat_id = match &self.config.chat_id {
            Some(c) => c.clone(),
            None => {
                warn!("telegram chat_id not configured, skipping");
                return Ok(());
            }
        };

        info!("telegram notifier started");

        loop {
            match self.events.recv().await {
                Ok(event) => {
                    if let Some(msg) = format_event(&event) {
                        if let Err(e) = self.send_message(&token, &chat_id, &msg).await {
                            warn!(error = %e, "failed to send telegram alert");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "telegram event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("event bus closed, telegram notifier shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn send_message(&self, token: &str, chat_id: &str, text: &str) -> anyhow::Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let body = resp.text().await?;
            warn!(body = %body, "telegram API error");
        }
        Ok(())
    }
}

fn short(id: &str) -> &str {
    &id[..id.len().min(12)]
}

/// Format a SwapEvent into a Telegram alert. None means "not user-visible".
pub fn format_event(event: &SwapEvent) -> Option<String> {
    match event {
        SwapEvent::OrderStatusChanged {
            order_id,
            new_status,
            ..
        } => match new_status {
            OrderStatus::Processing => Some(format!(
                "🔄 <b>Deposit received</b>\nOrder <code>{}</code> is processing",
                short(order_id)
            )),
            OrderStatus::Settled => Some(format!(
                "✅ <b>Swap settled</b>\nOrder <code>{}</code> completed",
                short(order_id)
            )),
            OrderStatus::Refunded => Some(format!(
                "↩️ <b>Swap refunded</b>\nOrder <code>{}</code> was refunded",
                short(order_id)
            )),
            OrderStatus::Failed => Some(format!(
                "❌ <b>Swap failed</b>\nOrder <code>{}</code>",
                short(order_id)
            )),
            OrderStatus::Expired => Some(format!(
                "⌛ <b>Swap expired</b>\nOrder <code>{}</code> — no deposit arrived in time",
                short(order_id)
            )),
            _ => None,
        },
        SwapEvent::DcaExecuted {
            plan_id,
            order_id,
            executed_count,
            ..
        } => Some(format!(
            "📆 <b>DCA executed</b>\nPlan #{} → order <code>{}</code> (run {})",
            plan_id,
            short(order_id),
            executed_count
        )),
        SwapEvent::LimitTriggered {
            limit_id, order_id, ..
        } => Some(format!(
            "🎯 <b>Limit order triggered</b>\n#{} → order <code>{}</code>",
            limit_id,
            short(order_id)
        )),
        SwapEvent::LimitOrderDead {
            limit_id,
            last_error,
            ..
        } => Some(format!(
            "💀 <b>Limit order stopped</b>\n#{} gave up after repeated failures\n{}",
            limit_id, last_error
        )),
        SwapEvent::LimitOrderFailed {
            limit_id, reason, ..
        } => Some(format!(
            "❌ <b>Limit order failed</b>\n#{}: {}",
            limit_id, reason
        )),
        // Internal events: deferred DCA retries and rate-limit pauses stay
        // out of the user's chat.
        SwapEvent::DcaDeferred { .. } | SwapEvent::RateLimitPause { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_transitions_are_user_visible() {
        let event = SwapEvent::OrderStatusChanged {
            user_id: "u1".into(),
            order_id: "abcdef1234567890".into(),
            old_status: OrderStatus::Processing,
            new_status: OrderStatus::Settled,
            deposit_hash: None,
            settle_hash: None,
        };
        let msg = format_event(&event).unwrap();
        assert!(msg.contains("settled"));
        assert!(msg.contains("abcdef123456"));
    }

    #[test]
    fn early_transitions_stay_quiet() {
        let event = SwapEvent::OrderStatusChanged {
            user_id: "u1".into(),
            order_id: "x".into(),
            old_status: OrderStatus::Pending,
            new_status: OrderStatus::Waiting,
            deposit_hash: None,
            settle_hash: None,
        };
        assert!(format_event(&event).is_none());
    }

    #[test]
    fn internal_events_are_suppressed() {
        assert!(format_event(&SwapEvent::RateLimitPause { pause_secs: 30 }).is_none());
        assert!(format_event(&SwapEvent::DcaDeferred {
            plan_id: 1,
            user_id: "u1".into(),
            reason: "quote failed".into(),
        })
        .is_none());
    }

    #[test]
    fn dead_limit_order_notifies_user() {
        let msg = format_event(&SwapEvent::LimitOrderDead {
            limit_id: 7,
            user_id: "u1".into(),
            last_error: "503 from aggregator".into(),
        })
        .unwrap();
        assert!(msg.contains("#7"));
        assert!(msg.contains("503"));
    }
}

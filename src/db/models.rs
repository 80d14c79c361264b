//! Database row types and the observed order state machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Order status as reported by the aggregator. The aggregator is
/// authoritative; we only observe and persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Waiting,
    Processing,
    Settled,
    Refunded,
    Failed,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Waiting => "waiting",
            OrderStatus::Processing => "processing",
            OrderStatus::Settled => "settled",
            OrderStatus::Refunded => "refunded",
            OrderStatus::Failed => "failed",
            OrderStatus::Expired => "expired",
        }
    }

    /// Terminal statuses are never re-polled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Settled
                | OrderStatus::Expired
                | OrderStatus::Refunded
                | OrderStatus::Failed
        )
    }

    /// Whether `next` is reachable from `self` in the aggregator's state
    /// machine. Used to sanity-check the status log, never to block a
    /// transition the aggregator reports.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if *self == next {
            return false;
        }
        match self {
            Pending => matches!(next, Waiting | Processing | Settled | Expired),
            Waiting => matches!(next, Processing | Settled | Expired),
            Processing => matches!(next, Settled | Refunded | Failed | Expired),
            Settled | Refunded | Failed | Expired => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "waiting" => Ok(OrderStatus::Waiting),
            "processing" => Ok(OrderStatus::Processing),
            "settled" => Ok(OrderStatus::Settled),
            "refunded" => Ok(OrderStatus::Refunded),
            "failed" => Ok(OrderStatus::Failed),
            "expired" => Ok(OrderStatus::Expired),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// Limit order lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitStatus {
    Armed,
    Triggered,
    Executing,
    Settled,
    Failed,
    Dead,
}

impl LimitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitStatus::Armed => "armed",
            LimitStatus::Triggered => "triggered",
            LimitStatus::Executing => "executing",
            LimitStatus::Settled => "settled",
            LimitStatus::Failed => "failed",
            LimitStatus::Dead => "dead",
        }
    }
}

/// Price condition on a limit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceCondition {
    Above,
    Below,
}

impl PriceCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceCondition::Above => "above",
            PriceCondition::Below => "below",
        }
    }

    /// True when `price` satisfies the condition against `target`.
    pub fn is_met(&self, price: Decimal, target: Decimal) -> bool {
        match self {
            PriceCondition::Above => price > target,
            PriceCondition::Below => price < target,
        }
    }
}

impl FromStr for PriceCondition {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "above" => Ok(PriceCondition::Above),
            "below" => Ok(PriceCondition::Below),
            other => Err(format!("unknown price condition: {other}")),
        }
    }
}

// ── Row types ────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbOrder {
    pub id: i64,
    pub sideshift_order_id: String,
    pub user_id: String,
    pub from_asset: String,
    pub from_network: String,
    pub from_amount: Decimal,
    pub to_asset: String,
    pub to_network: String,
    pub settle_amount: Option<Decimal>,
    pub deposit_address: String,
    pub deposit_memo: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbWatchedOrder {
    pub id: i64,
    pub sideshift_order_id: String,
    pub user_id: String,
    pub last_status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbDcaPlan {
    pub id: i64,
    pub user_id: String,
    pub from_asset: String,
    pub from_network: String,
    pub to_asset: String,
    pub to_network: String,
    pub amount: Decimal,
    pub interval_hours: i32,
    pub next_execution_at: DateTime<Utc>,
    pub is_active: bool,
    pub executed_count: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbLimitOrder {
    pub id: i64,
    pub user_id: String,
    pub from_asset: String,
    pub from_network: String,
    pub to_asset: String,
    pub to_network: String,
    pub amount: Decimal,
    pub target_price: Decimal,
    pub condition: String,
    pub reference_asset: String,
    pub reference_chain: String,
    pub status: String,
    pub retry_count: i32,
    pub retry_after: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbPriceSnapshot {
    pub asset: String,
    pub chain: String,
    pub price: Decimal,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbUser {
    pub id: String,
    pub settle_address: Option<String>,
    pub refund_address: Option<String>,
    pub is_admin: bool,
    pub coin_balance: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbUserSettings {
    pub user_id: String,
    pub slippage_tolerance: Decimal,
    pub notify_on_settle: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbStatusLog {
    pub id: i64,
    pub sideshift_order_id: String,
    pub old_status: String,
    pub new_status: String,
    pub emitted_at: DateTime<Utc>,
    pub payload_fingerprint: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbConversation {
    pub user_id: String,
    pub state: serde_json::Value,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbCoinGiftLog {
    pub id: i64,
    pub admin_id: String,
    pub target_user_id: String,
    pub action: String,
    pub amount: Decimal,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Settled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(OrderStatus::Refunded.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Waiting.is_terminal());
        assert!(!OrderStatus::Processing.is_terminal());
    }

    #[test]
    fn transition_reachability() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Settled));
        assert!(Processing.can_transition_to(Refunded));
        assert!(Processing.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Expired));
        assert!(Waiting.can_transition_to(Expired));
        // Terminal states go nowhere.
        assert!(!Settled.can_transition_to(Processing));
        assert!(!Refunded.can_transition_to(Settled));
        // Backwards is unreachable.
        assert!(!Processing.can_transition_to(Waiting));
        assert!(!Waiting.can_transition_to(Pending));
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            OrderStatus::Pending,
            OrderStatus::Waiting,
            OrderStatus::Processing,
            OrderStatus::Settled,
            OrderStatus::Refunded,
            OrderStatus::Failed,
            OrderStatus::Expired,
        ] {
            assert_eq!(s.as_str().parse::<OrderStatus>().unwrap(), s);
        }
        assert!("bogus".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn price_condition_evaluation() {
        let target = dec!(2000);
        assert!(PriceCondition::Above.is_met(dec!(2000.00000001), target));
        assert!(!PriceCondition::Above.is_met(target, target));
        assert!(PriceCondition::Below.is_met(dec!(1999), target));
        assert!(!PriceCondition::Below.is_met(target, target));
    }
}

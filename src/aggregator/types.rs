//! Wire types for the aggregator API, with post-deserialization validation.
//!
//! Deserialization is the schema; `validate()` enforces the constraints serde
//! cannot express (non-empty IDs, positive amounts). Nothing leaves this
//! module unvalidated.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::db::models::OrderStatus;

/// A short-TTL price commitment.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub id: String,
    pub rate: Decimal,
    pub settle_amount: Decimal,
    pub expires_at: DateTime<Utc>,
}

impl Quote {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("quote id is empty".into());
        }
        if self.settle_amount <= Decimal::ZERO {
            return Err(format!("non-positive settle amount: {}", self.settle_amount));
        }
        if self.rate <= Decimal::ZERO {
            return Err(format!("non-positive rate: {}", self.rate));
        }
        Ok(())
    }
}

/// A freshly created order.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedOrder {
    pub id: String,
    pub deposit_address: String,
    #[serde(default)]
    pub deposit_memo: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub settle_amount: Option<Decimal>,
}

impl CreatedOrder {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("order id is empty".into());
        }
        if self.deposit_address.is_empty() {
            return Err("deposit address is empty".into());
        }
        Ok(())
    }
}

/// Point-in-time order state. `status` is the raw wire value; `status()`
/// parses it into our observed state machine.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSnapshot {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub deposit_hash: Option<String>,
    #[serde(default)]
    pub settle_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl OrderSnapshot {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("snapshot order id is empty".into());
        }
        self.status
            .parse::<OrderStatus>()
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    pub fn order_status(&self) -> Result<OrderStatus, String> {
        self.status.parse()
    }

    /// Short content hash for the status log's payload fingerprint.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}",
            self.status,
            self.deposit_hash.as_deref().unwrap_or("-"),
            self.settle_hash.as_deref().unwrap_or("-"),
        )
    }
}

/// A hosted pay-link.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkout {
    pub id: String,
    pub url: String,
}

impl Checkout {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() || self.url.is_empty() {
            return Err("checkout id or url is empty".into());
        }
        Ok(())
    }
}

/// Live exchange rate for a pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRate {
    pub rate: Decimal,
    #[serde(default)]
    pub min: Option<Decimal>,
    #[serde(default)]
    pub max: Option<Decimal>,
}

impl PairRate {
    pub fn validate(&self) -> Result<(), String> {
        if self.rate <= Decimal::ZERO {
            return Err(format!("non-positive rate: {}", self.rate));
        }
        Ok(())
    }
}

/// Structural failure from the aggregator. Callers branch on
/// `is_rate_limited` / `is_transient` / `permanent_kind` rather than string
/// matching.
#[derive(Debug, Clone, Error)]
#[error("aggregator error (http {http_status}): {message}")]
pub struct AggregatorFailure {
    pub http_status: u16,
    pub code: Option<String>,
    pub message: String,
    /// Seconds, from a 429 Retry-After header when present.
    pub retry_after: Option<u64>,
}

/// What a permanent aggregator rejection means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    /// Worth one more attempt with a fresh quote.
    RetryableWithFreshQuote,
    /// The user must change something (address, amount).
    UserFixable,
    /// No recovery path.
    Fatal,
}

impl PermanentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermanentKind::RetryableWithFreshQuote => "retryable_with_fresh_quote",
            PermanentKind::UserFixable => "user_fixable",
            PermanentKind::Fatal => "fatal",
        }
    }
}

impl AggregatorFailure {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            http_status: 0,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self {
            http_status: 200,
            code: Some("INVALID_RESPONSE".into()),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.http_status == 429
    }

    /// Network failures, timeouts, 5xx, and 429 are retried by the owning
    /// component; everything else is permanent.
    pub fn is_transient(&self) -> bool {
        self.http_status == 0 || self.http_status == 429 || self.http_status >= 500
    }

    /// Reclassify a permanent rejection per the aggregator's error codes.
    pub fn permanent_kind(&self) -> PermanentKind {
        match self.code.as_deref() {
            Some("QUOTE_EXPIRED") | Some("RATE_CHANGED") => PermanentKind::RetryableWithFreshQuote,
            Some("INVALID_ADDRESS")
            | Some("INSUFFICIENT_FUNDS")
            | Some("AMOUNT_TOO_LOW")
            | Some("AMOUNT_TOO_HIGH") => PermanentKind::UserFixable,
            _ => PermanentKind::Fatal,
        }
    }

    /// Whether the owning component should attempt again. Transient failures
    /// retry by definition; an expired or repriced quote also qualifies,
    /// since every retry starts from a fresh quote. User-fixable and fatal
    /// rejections do not.
    pub fn is_retryable(&self) -> bool {
        self.is_transient() || self.permanent_kind() == PermanentKind::RetryableWithFreshQuote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quote_validation_rejects_bad_amounts() {
        let quote: Quote = serde_json::from_value(serde_json::json!({
            "id": "q-1",
            "rate": "0.05123",
            "settleAmount": "0.00000000",
            "expiresAt": "2026-01-01T00:00:00Z",
        }))
        .unwrap();
        assert!(quote.validate().is_err());
    }

    #[test]
    fn snapshot_rejects_unknown_status() {
        let snap: OrderSnapshot = serde_json::from_value(serde_json::json!({
            "id": "o-1",
            "status": "review",
            "updatedAt": "2026-01-01T00:00:00Z",
        }))
        .unwrap();
        assert!(snap.validate().is_err());

        let snap: OrderSnapshot = serde_json::from_value(serde_json::json!({
            "id": "o-1",
            "status": "processing",
            "updatedAt": "2026-01-01T00:00:00Z",
        }))
        .unwrap();
        assert!(snap.validate().is_ok());
        assert_eq!(
            snap.order_status().unwrap(),
            crate::db::models::OrderStatus::Processing
        );
    }

    #[test]
    fn failure_classification() {
        let rate_limited = AggregatorFailure {
            http_status: 429,
            code: None,
            message: "slow down".into(),
            retry_after: Some(30),
        };
        assert!(rate_limited.is_rate_limited());
        assert!(rate_limited.is_transient());

        let outage = AggregatorFailure {
            http_status: 503,
            code: None,
            message: "maintenance".into(),
            retry_after: None,
        };
        assert!(outage.is_transient());
        assert!(!outage.is_rate_limited());

        let timeout = AggregatorFailure::network("operation timed out");
        assert!(timeout.is_transient());

        let rejected = AggregatorFailure {
            http_status: 400,
            code: Some("INVALID_ADDRESS".into()),
            message: "bad settle address".into(),
            retry_after: None,
        };
        assert!(!rejected.is_transient());
        assert_eq!(rejected.permanent_kind(), PermanentKind::UserFixable);

        let expired = AggregatorFailure {
            http_status: 410,
            code: Some("QUOTE_EXPIRED".into()),
            message: "quote expired".into(),
            retry_after: None,
        };
        assert_eq!(
            expired.permanent_kind(),
            PermanentKind::RetryableWithFreshQuote
        );
    }

    #[test]
    fn retry_routing() {
        // Transient and fresh-quote failures get another attempt.
        assert!(AggregatorFailure::network("timed out").is_retryable());
        let expired = AggregatorFailure {
            http_status: 410,
            code: Some("QUOTE_EXPIRED".into()),
            message: "quote expired".into(),
            retry_after: None,
        };
        assert!(expired.is_retryable());

        // User-fixable and fatal rejections do not.
        let bad_address = AggregatorFailure {
            http_status: 400,
            code: Some("INVALID_ADDRESS".into()),
            message: "bad settle address".into(),
            retry_after: None,
        };
        assert!(!bad_address.is_retryable());
        let unknown = AggregatorFailure {
            http_status: 400,
            code: Some("PAIR_DISABLED".into()),
            message: "pair disabled".into(),
            retry_after: None,
        };
        assert!(!unknown.is_retryable());
        assert_eq!(unknown.permanent_kind().as_str(), "fatal");
    }

    #[test]
    fn pair_rate_parses_and_validates() {
        let rate: PairRate = serde_json::from_value(serde_json::json!({
            "rate": "1998.51230000",
            "min": "0.001",
            "max": "5.0",
        }))
        .unwrap();
        assert!(rate.validate().is_ok());
        assert_eq!(rate.rate, dec!(1998.5123));
    }
}

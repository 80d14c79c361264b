//! Structured swap intents — the parser's output, consumed at our boundary.
//!
//! One variant per intent kind, each carrying exactly its own required
//! fields; the validator switches on the tag. A single flat record with
//! dozens of optionals is exactly what this type exists to prevent.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::db::models::PriceCondition;
use crate::error::ValidationFailure;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "intent", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SwapIntent {
    /// One-off swap: quote, create, track.
    Swap {
        from_asset: String,
        from_network: String,
        to_asset: String,
        to_network: String,
        amount: Decimal,
    },
    /// Recurring plan.
    Dca {
        from_asset: String,
        from_network: String,
        to_asset: String,
        to_network: String,
        amount: Decimal,
        interval_hours: i32,
    },
    /// Read-only order history summary.
    Portfolio {
        #[serde(default)]
        limit: Option<i64>,
    },
    /// Hosted pay-link.
    Checkout {
        settle_asset: String,
        settle_network: String,
        amount: Decimal,
        settle_address: String,
    },
    /// Yield advisory lookup; informational only.
    YieldScout { asset: String, chain: String },
    /// Price-armed order.
    LimitOrder {
        from_asset: String,
        from_network: String,
        to_asset: String,
        to_network: String,
        amount: Decimal,
        target_price: Decimal,
        condition: String,
        reference_asset: String,
        reference_chain: String,
    },
}

fn require(fields: &mut Vec<String>, name: &str, value: &str) {
    if value.trim().is_empty() {
        fields.push(name.to_string());
    }
}

fn require_positive(fields: &mut Vec<String>, name: &str, value: Decimal) {
    if value <= Decimal::ZERO {
        fields.push(name.to_string());
    }
}

impl SwapIntent {
    pub fn kind(&self) -> &'static str {
        match self {
            SwapIntent::Swap { .. } => "swap",
            SwapIntent::Dca { .. } => "dca",
            SwapIntent::Portfolio { .. } => "portfolio",
            SwapIntent::Checkout { .. } => "checkout",
            SwapIntent::YieldScout { .. } => "yield_scout",
            SwapIntent::LimitOrder { .. } => "limit_order",
        }
    }

    /// Per-variant semantic validation. Reports every offending field at
    /// once; callers never see a partially valid intent.
    pub fn validate(&self) -> Result<(), ValidationFailure> {
        let mut fields = Vec::new();

        match self {
            SwapIntent::Swap {
                from_asset,
                from_network,
                to_asset,
                to_network,
                amount,
            } => {
                require(&mut fields, "fromAsset", from_asset);
                require(&mut fields, "fromNetwork", from_network);
                require(&mut fields, "toAsset", to_asset);
                require(&mut fields, "toNetwork", to_network);
                require_positive(&mut fields, "amount", *amount);
            }
            SwapIntent::Dca {
                from_asset,
                from_network,
                to_asset,
                to_network,
                amount,
                interval_hours,
            } => {
                require(&mut fields, "fromAsset", from_asset);
                require(&mut fields, "fromNetwork", from_network);
                require(&mut fields, "toAsset", to_asset);
                require(&mut fields, "toNetwork", to_network);
                require_positive(&mut fields, "amount", *amount);
                if *interval_hours <= 0 {
                    fields.push("intervalHours".to_string());
                }
            }
            SwapIntent::Portfolio { limit } => {
                if let Some(limit) = limit {
                    if *limit <= 0 {
                        fields.push("limit".to_string());
                    }
                }
            }
            SwapIntent::Checkout {
                settle_asset,
                settle_network,
                amount,
                settle_address,
            } => {
                require(&mut fields, "settleAsset", settle_asset);
                require(&mut fields, "settleNetwork", settle_network);
                require(&mut fields, "settleAddress", settle_address);
                require_positive(&mut fields, "amount", *amount);
            }
            SwapIntent::YieldScout { asset, chain } => {
                require(&mut fields, "asset", asset);
                require(&mut fields, "chain", chain);
            }
            SwapIntent::LimitOrder {
                from_asset,
                from_network,
                to_asset,
                to_network,
                amount,
                target_price,
                condition,
                reference_asset,
                reference_chain,
            } => {
                require(&mut fields, "fromAsset", from_asset);
                require(&mut fields, "fromNetwork", from_network);
                require(&mut fields, "toAsset", to_asset);
                require(&mut fields, "toNetwork", to_network);
                require_positive(&mut fields, "amount", *amount);
                require_positive(&mut fields, "targetPrice", *target_price);
                if condition.parse::<PriceCondition>().is_err() {
                    fields.push("condition".to_string());
                }
                require(&mut fields, "referenceAsset", reference_asset);
                require(&mut fields, "referenceChain", reference_chain);
            }
        }

        if fields.is_empty() {
            Ok(())
        } else {
            Err(ValidationFailure {
                message: format!("invalid {} intent", self.kind()),
                fields,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn tag_dispatch_selects_variant() {
        let intent: SwapIntent = serde_json::from_value(serde_json::json!({
            "intent": "swap",
            "fromAsset": "btc",
            "fromNetwork": "bitcoin",
            "toAsset": "eth",
            "toNetwork": "ethereum",
            "amount": "0.5",
        }))
        .unwrap();
        assert_eq!(intent.kind(), "swap");
        assert!(intent.validate().is_ok());
    }

    #[test]
    fn unknown_tag_is_rejected_at_parse_time() {
        let result: Result<SwapIntent, _> = serde_json::from_value(serde_json::json!({
            "intent": "teleport",
            "amount": "1",
        }));
        assert!(result.is_err());
    }

    #[test]
    fn missing_variant_field_is_rejected_at_parse_time() {
        // Each variant carries its own required set; serde enforces presence.
        let result: Result<SwapIntent, _> = serde_json::from_value(serde_json::json!({
            "intent": "dca",
            "fromAsset": "btc",
            "fromNetwork": "bitcoin",
            "toAsset": "eth",
            "toNetwork": "ethereum",
            "amount": "0.5",
            // intervalHours missing
        }));
        assert!(result.is_err());
    }

    #[test]
    fn validation_reports_every_bad_field() {
        let intent = SwapIntent::Dca {
            from_asset: "".into(),
            from_network: "bitcoin".into(),
            to_asset: "eth".into(),
            to_network: "ethereum".into(),
            amount: dec!(0),
            interval_hours: -2,
        };
        let err = intent.validate().unwrap_err();
        assert!(err.fields.contains(&"fromAsset".to_string()));
        assert!(err.fields.contains(&"amount".to_string()));
        assert!(err.fields.contains(&"intervalHours".to_string()));
        assert_eq!(err.fields.len(), 3);
    }

    #[test]
    fn limit_order_condition_must_parse() {
        let intent = SwapIntent::LimitOrder {
            from_asset: "usdc".into(),
            from_network: "ethereum".into(),
            to_asset: "eth".into(),
            to_network: "ethereum".into(),
            amount: dec!(1000),
            target_price: dec!(2000),
            condition: "sideways".into(),
            reference_asset: "eth".into(),
            reference_chain: "ethereum".into(),
        };
        let err = intent.validate().unwrap_err();
        assert_eq!(err.fields, vec!["condition".to_string()]);
    }
}

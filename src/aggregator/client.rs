//! SideShift REST client — the one concrete [`AggregatorApi`] implementation.
//!
//! Every call carries a hard timeout; 429 responses are surfaced structurally
//! (status + Retry-After) so the monitor can pause globally instead of
//! hammering the API.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::types::*;
use super::AggregatorApi;
use crate::config::AggregatorConfig;

#[derive(Clone)]
pub struct SideShiftClient {
    client: Client,
    base_url: String,
    api_key: String,
    affiliate_id: String,
}

impl SideShiftClient {
    pub fn new(config: &AggregatorConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.expose().to_string(),
            affiliate_id: config.affiliate_id.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Wire error body: `{"error": {"code": ..., "message": ...}}`.
    async fn failure_from(response: Response) -> AggregatorFailure {
        let http_status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        #[derive(serde::Deserialize)]
        struct ErrorBody {
            error: Option<ErrorDetail>,
        }
        #[derive(serde::Deserialize)]
        struct ErrorDetail {
            code: Option<String>,
            message: Option<String>,
        }

        let (code, message) = match response.json::<ErrorBody>().await {
            Ok(body) => {
                let detail = body.error;
                (
                    detail.as_ref().and_then(|d| d.code.clone()),
                    detail
                        .and_then(|d| d.message)
                        .unwrap_or_else(|| format!("http {http_status}")),
                )
            }
            Err(_) => (None, format!("http {http_status}")),
        };

        AggregatorFailure {
            http_status,
            code,
            message,
            retry_after,
        }
    }

    async fn handle<T>(
        response: Result<Response, reqwest::Error>,
        validate: impl Fn(&T) -> Result<(), String>,
    ) -> Result<T, AggregatorFailure>
    where
        T: DeserializeOwned,
    {
        let response = response.map_err(|e| AggregatorFailure::network(e.to_string()))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS || !response.status().is_success() {
            return Err(Self::failure_from(response).await);
        }

        let value: T = response
            .json()
            .await
            .map_err(|e| AggregatorFailure::invalid_response(e.to_string()))?;
        validate(&value).map_err(AggregatorFailure::invalid_response)?;
        Ok(value)
    }
}

#[async_trait]
impl AggregatorApi for SideShiftClient {
    async fn get_quote(
        &self,
        from_asset: &str,
        from_network: &str,
        to_asset: &str,
        to_network: &str,
        amount: Decimal,
    ) -> Result<Quote, AggregatorFailure> {
        debug!(from_asset, to_asset, %amount, "requesting quote");
        let response = self
            .client
            .post(self.url("/quotes"))
            .header("x-sideshift-secret", &self.api_key)
            .json(&json!({
                "depositCoin": from_asset,
                "depositNetwork": from_network,
                "settleCoin": to_asset,
                "settleNetwork": to_network,
                "depositAmount": amount.to_string(),
                "affiliateId": self.affiliate_id,
            }))
            .send()
            .await;
        Self::handle(response, Quote::validate).await
    }

    async fn create_order(
        &self,
        quote_id: &str,
        settle_address: &str,
        refund_address: Option<&str>,
    ) -> Result<CreatedOrder, AggregatorFailure> {
        debug!(quote_id, "creating order from quote");
        let mut body = json!({
            "quoteId": quote_id,
            "settleAddress": settle_address,
            "affiliateId": self.affiliate_id,
        });
        if let Some(refund) = refund_address {
            body["refundAddress"] = json!(refund);
        }
        let response = self
            .client
            .post(self.url("/shifts/fixed"))
            .header("x-sideshift-secret", &self.api_key)
            .json(&body)
            .send()
            .await;
        Self::handle(response, CreatedOrder::validate).await
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderSnapshot, AggregatorFailure> {
        let response = self
            .client
            .get(self.url(&format!("/shifts/{order_id}")))
            .header("x-sideshift-secret", &self.api_key)
            .send()
            .await;
        Self::handle(response, OrderSnapshot::validate).await
    }

    async fn create_checkout(
        &self,
        settle_asset: &str,
        settle_network: &str,
        settle_amount: Decimal,
        settle_address: &str,
    ) -> Result<Checkout, AggregatorFailure> {
        let response = self
            .client
            .post(self.url("/checkout"))
            .header("x-sideshift-secret", &self.api_key)
            .json(&json!({
                "settleCoin": settle_asset,
                "settleNetwork": settle_network,
                "settleAmount": settle_amount.to_string(),
                "settleAddress": settle_address,
                "affiliateId": self.affiliate_id,
            }))
            .send()
            .await;
        Self::handle(response, Checkout::validate).await
    }

    async fn get_pair_rate(
        &self,
        from_asset: &str,
        to_asset: &str,
    ) -> Result<PairRate, AggregatorFailure> {
        let response = self
            .client
            .get(self.url(&format!("/pair/{from_asset}/{to_asset}")))
            .send()
            .await;
        Self::handle(response, PairRate::validate).await
    }
}

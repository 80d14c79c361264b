//! Boundary to the external cross-chain exchange aggregator.
//!
//! Components depend on the [`AggregatorApi`] capability, never on the
//! concrete client, so tests can substitute a fake.

pub mod client;
pub mod types;

use async_trait::async_trait;
use rust_decimal::Decimal;

pub use client::SideShiftClient;
pub use types::{
    AggregatorFailure, Checkout, CreatedOrder, OrderSnapshot, PairRate, PermanentKind, Quote,
};

#[async_trait]
pub trait AggregatorApi: Send + Sync {
    /// Request a short-TTL price commitment for a fixed-amount swap.
    async fn get_quote(
        &self,
        from_asset: &str,
        from_network: &str,
        to_asset: &str,
        to_network: &str,
        amount: Decimal,
    ) -> Result<Quote, AggregatorFailure>;

    /// Turn a quote into a live order.
    async fn create_order(
        &self,
        quote_id: &str,
        settle_address: &str,
        refund_address: Option<&str>,
    ) -> Result<CreatedOrder, AggregatorFailure>;

    /// Current state of an order, as the aggregator sees it.
    async fn get_order_status(&self, order_id: &str) -> Result<OrderSnapshot, AggregatorFailure>;

    /// Pay-link flow used by the front-end.
    async fn create_checkout(
        &self,
        settle_asset: &str,
        settle_network: &str,
        settle_amount: Decimal,
        settle_address: &str,
    ) -> Result<Checkout, AggregatorFailure>;

    /// Live pair rate; the price refresher's source of truth.
    async fn get_pair_rate(
        &self,
        from_asset: &str,
        to_asset: &str,
    ) -> Result<PairRate, AggregatorFailure>;
}

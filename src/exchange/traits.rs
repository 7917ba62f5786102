//! Venue seam consumed by the loops.
//!
//! The live CLOB client and the paper-trading client both implement
//! [`MarketClient`]; loops only ever see the trait object.

use async_trait::async_trait;

use super::types::{LimitOrder, MarketInfo, MarketOrder, OrderBook, OrderOutcome};
use crate::errors::ClientError;

/// Market data and order execution for a binary-outcome CLOB.
///
/// Implementations do not apply their own timeouts; callers wrap each call in
/// `tokio::time::timeout`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketClient: Send + Sync {
    /// Active, unclosed markets whose question mentions one of `keywords`.
    async fn list_markets(&self, keywords: &[String]) -> Result<Vec<MarketInfo>, ClientError>;

    /// Snapshot of both outcome books for `market`.
    async fn get_order_book(&self, market: &MarketInfo) -> Result<OrderBook, ClientError>;

    async fn place_limit_order(&self, order: &LimitOrder) -> Result<OrderOutcome, ClientError>;

    async fn place_market_order(&self, order: &MarketOrder) -> Result<OrderOutcome, ClientError>;

    /// Cancel every resting order. Returns how many were cancelled.
    async fn cancel_all_orders(&self) -> Result<usize, ClientError>;
}

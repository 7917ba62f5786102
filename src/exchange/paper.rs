//! Paper trading client.
//!
//! Fills orders against the current book snapshot without touching the venue.
//! Market data comes either from a wrapped live client or from books supplied
//! by the caller.

use super::traits::MarketClient;
use super::types::*;
use crate::errors::ClientError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Simulated venue state.
#[derive(Debug, Default)]
struct PaperState {
    book: Option<OrderBook>,
    markets: Vec<MarketInfo>,
    fills: Vec<(Outcome, OrderSide, Fill)>,
    cancel_calls: u64,
}

/// Client that simulates fills against the latest book.
pub struct PaperClient {
    state: Arc<RwLock<PaperState>>,
    order_id_counter: AtomicU64,
    /// Live market data source; `None` means books are supplied via `set_book`
    source: Option<Arc<dyn MarketClient>>,
}

impl PaperClient {
    /// Paper client fed with caller-supplied books and markets.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(PaperState::default())),
            order_id_counter: AtomicU64::new(1),
            source: None,
        }
    }

    /// Paper client that reads market data from a live client.
    pub fn with_source(source: Arc<dyn MarketClient>) -> Self {
        Self {
            source: Some(source),
            ..Self::new()
        }
    }

    pub async fn set_book(&self, book: OrderBook) {
        self.state.write().await.book = Some(book);
    }

    pub async fn set_markets(&self, markets: Vec<MarketInfo>) {
        self.state.write().await.markets = markets;
    }

    /// Every simulated execution, oldest first.
    pub async fn fills(&self) -> Vec<(Outcome, OrderSide, Fill)> {
        self.state.read().await.fills.clone()
    }

    pub async fn cancel_calls(&self) -> u64 {
        self.state.read().await.cancel_calls
    }

    fn next_order_id(&self) -> String {
        format!("paper-{}", self.order_id_counter.fetch_add(1, Ordering::SeqCst))
    }

    async fn current_book(&self) -> Result<OrderBook, ClientError> {
        self.state
            .read()
            .await
            .book
            .clone()
            .ok_or_else(|| ClientError::Transport("no paper book available".into()))
    }

    async fn record(&self, outcome: Outcome, side: OrderSide, fill: Fill) {
        self.state.write().await.fills.push((outcome, side, fill));
    }
}

impl Default for PaperClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk `levels` for up to `size`, returning (filled, average price).
fn sweep(levels: &[BookLevel], size: Decimal) -> (Decimal, Decimal) {
    let mut remaining = size;
    let mut filled = Decimal::ZERO;
    let mut notional = Decimal::ZERO;

    for level in levels {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = remaining.min(level.size);
        filled += take;
        notional += take * level.price;
        remaining -= take;
    }

    if filled == Decimal::ZERO {
        (Decimal::ZERO, Decimal::ZERO)
    } else {
        (filled, notional / filled)
    }
}

#[async_trait]
impl MarketClient for PaperClient {
    async fn list_markets(&self, keywords: &[String]) -> Result<Vec<MarketInfo>, ClientError> {
        if let Some(source) = &self.source {
            return source.list_markets(keywords).await;
        }

        let markets = self.state.read().await.markets.clone();
        Ok(markets
            .into_iter()
            .filter(|m| {
                let question = m.question.to_uppercase();
                keywords.is_empty()
                    || keywords.iter().any(|k| question.contains(&k.to_uppercase()))
            })
            .collect())
    }

    async fn get_order_book(&self, market: &MarketInfo) -> Result<OrderBook, ClientError> {
        if let Some(source) = &self.source {
            let book = source.get_order_book(market).await?;
            self.state.write().await.book = Some(book.clone());
            return Ok(book);
        }
        self.current_book().await
    }

    async fn place_limit_order(&self, order: &LimitOrder) -> Result<OrderOutcome, ClientError> {
        let book = self.current_book().await?;
        let side_book = book.side(order.outcome);

        // Marketable portion only; paper orders never rest.
        let crossing: Vec<BookLevel> = match order.side {
            OrderSide::Buy => side_book
                .asks
                .iter()
                .copied()
                .filter(|l| l.price <= order.price)
                .collect(),
            OrderSide::Sell => side_book
                .bids
                .iter()
                .copied()
                .filter(|l| l.price >= order.price)
                .collect(),
        };

        let (filled, _) = sweep(&crossing, order.size);
        if filled == Decimal::ZERO {
            debug!(outcome = %order.outcome, price = %order.price, "Paper limit order found no liquidity");
            return Ok(OrderOutcome::Rejected {
                reason: "no liquidity at limit price".into(),
            });
        }

        let fill = Fill {
            order_id: self.next_order_id(),
            price: order.price,
            size: filled,
        };
        info!(
            order_id = %fill.order_id,
            outcome = %order.outcome,
            side = order.side.as_str(),
            price = %fill.price,
            size = %fill.size,
            "Paper limit order executed"
        );
        self.record(order.outcome, order.side, fill.clone()).await;
        Ok(OrderOutcome::Filled(fill))
    }

    async fn place_market_order(&self, order: &MarketOrder) -> Result<OrderOutcome, ClientError> {
        let book = self.current_book().await?;
        let side_book = book.side(order.outcome);
        let levels = match order.side {
            OrderSide::Buy => &side_book.asks,
            OrderSide::Sell => &side_book.bids,
        };

        let (filled, avg_price) = sweep(levels, order.size);
        if filled == Decimal::ZERO {
            return Ok(OrderOutcome::Rejected {
                reason: "empty book".into(),
            });
        }

        let fill = Fill {
            order_id: self.next_order_id(),
            price: avg_price,
            size: filled,
        };
        info!(
            order_id = %fill.order_id,
            outcome = %order.outcome,
            side = order.side.as_str(),
            price = %fill.price,
            size = %fill.size,
            "Paper market order executed"
        );
        self.record(order.outcome, order.side, fill.clone()).await;
        Ok(OrderOutcome::Filled(fill))
    }

    async fn cancel_all_orders(&self) -> Result<usize, ClientError> {
        self.state.write().await.cancel_calls += 1;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book() -> OrderBook {
        OrderBook::new(
            SideBook::from_levels(
                vec![BookLevel::new(dec!(0.45), dec!(10)), BookLevel::new(dec!(0.44), dec!(10))],
                vec![BookLevel::new(dec!(0.47), dec!(5)), BookLevel::new(dec!(0.48), dec!(50))],
            ),
            SideBook::from_levels(
                vec![BookLevel::new(dec!(0.50), dec!(20))],
                vec![BookLevel::new(dec!(0.52), dec!(30))],
            ),
        )
    }

    fn limit(price: Decimal, size: Decimal) -> LimitOrder {
        LimitOrder {
            token_id: "yes".into(),
            outcome: Outcome::Yes,
            side: OrderSide::Buy,
            price,
            size,
            post_only: true,
        }
    }

    #[tokio::test]
    async fn test_limit_buy_fills_against_crossing_asks() {
        let client = PaperClient::new();
        client.set_book(book()).await;

        let outcome = client.place_limit_order(&limit(dec!(0.47), dec!(10))).await.unwrap();
        match outcome {
            OrderOutcome::Filled(fill) => {
                assert_eq!(fill.price, dec!(0.47));
                assert_eq!(fill.size, dec!(5)); // only the 0.47 level crosses
            }
            other => panic!("expected fill, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_limit_below_ask_is_rejected() {
        let client = PaperClient::new();
        client.set_book(book()).await;

        let outcome = client.place_limit_order(&limit(dec!(0.40), dec!(10))).await.unwrap();
        assert!(matches!(outcome, OrderOutcome::Rejected { .. }));
        assert!(client.fills().await.is_empty());
    }

    #[tokio::test]
    async fn test_market_sell_sweeps_bids() {
        let client = PaperClient::new();
        client.set_book(book()).await;

        let outcome = client
            .place_market_order(&MarketOrder {
                token_id: "yes".into(),
                outcome: Outcome::Yes,
                side: OrderSide::Sell,
                size: dec!(15),
            })
            .await
            .unwrap();

        let OrderOutcome::Filled(fill) = outcome else {
            panic!("expected fill");
        };
        assert_eq!(fill.size, dec!(15));
        // 10 @ 0.45 + 5 @ 0.44 = 6.70 / 15
        assert_eq!(fill.price, dec!(6.70) / dec!(15));
        assert_eq!(client.fills().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_book_is_transport_error() {
        let client = PaperClient::new();
        let err = client.place_limit_order(&limit(dec!(0.47), dec!(1))).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_cancel_all_counts_calls() {
        let client = PaperClient::new();
        assert_eq!(client.cancel_all_orders().await.unwrap(), 0);
        assert_eq!(client.cancel_calls().await, 1);
    }
}

//! CLOB domain types shared by the REST client, the stream and the loops.

use crate::errors::ClientError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two complementary outcome tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn opposite(self) -> Self {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Yes => "YES",
            Outcome::No => "NO",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// A single price level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
}

impl BookLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Bids (descending) and asks (ascending) for one outcome token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl SideBook {
    /// Build from unsorted levels, dropping empty and non-positive entries.
    pub fn from_levels(bids: Vec<BookLevel>, asks: Vec<BookLevel>) -> Self {
        let keep = |l: &BookLevel| l.price > Decimal::ZERO && l.size > Decimal::ZERO;
        let mut bids: Vec<BookLevel> = bids.into_iter().filter(keep).collect();
        let mut asks: Vec<BookLevel> = asks.into_iter().filter(keep).collect();
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));
        Self { bids, asks }
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Total size across the top `levels` bids.
    pub fn bid_depth(&self, levels: usize) -> Decimal {
        self.bids.iter().take(levels).map(|l| l.size).sum()
    }

    /// Total size across the top `levels` asks.
    pub fn ask_depth(&self, levels: usize) -> Decimal {
        self.asks.iter().take(levels).map(|l| l.size).sum()
    }

    /// Replace (or remove, when `size` is zero) the level at `price`.
    pub fn apply_change(&mut self, side: OrderSide, price: Decimal, size: Decimal) {
        let levels = match side {
            OrderSide::Buy => &mut self.bids,
            OrderSide::Sell => &mut self.asks,
        };
        levels.retain(|l| l.price != price);
        if size > Decimal::ZERO {
            levels.push(BookLevel::new(price, size));
        }
        match side {
            OrderSide::Buy => levels.sort_by(|a, b| b.price.cmp(&a.price)),
            OrderSide::Sell => levels.sort_by(|a, b| a.price.cmp(&b.price)),
        }
    }
}

/// Transient snapshot of both outcome books.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub yes: SideBook,
    pub no: SideBook,
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    pub fn new(yes: SideBook, no: SideBook) -> Self {
        Self {
            yes,
            no,
            timestamp: Utc::now(),
        }
    }

    pub fn side(&self, outcome: Outcome) -> &SideBook {
        match outcome {
            Outcome::Yes => &self.yes,
            Outcome::No => &self.no,
        }
    }

    pub fn side_mut(&mut self, outcome: Outcome) -> &mut SideBook {
        match outcome {
            Outcome::Yes => &mut self.yes,
            Outcome::No => &mut self.no,
        }
    }

    pub fn best_ask(&self, outcome: Outcome) -> Option<Decimal> {
        self.side(outcome).best_ask()
    }

    pub fn best_bid(&self, outcome: Outcome) -> Option<Decimal> {
        self.side(outcome).best_bid()
    }

    pub fn ask_depth(&self, outcome: Outcome, levels: usize) -> Decimal {
        self.side(outcome).ask_depth(levels)
    }

    pub fn bid_depth(&self, outcome: Outcome, levels: usize) -> Decimal {
        self.side(outcome).bid_depth(levels)
    }
}

/// The binary market traded for a session. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketInfo {
    pub market_id: String,
    pub condition_id: String,
    pub question: String,
    pub expiration: DateTime<Utc>,
    pub yes_token_id: String,
    pub no_token_id: String,
    #[serde(default)]
    pub strike_price: Option<Decimal>,
    pub tick_size: Decimal,
    pub min_size: Decimal,
    pub active: bool,
    pub closed: bool,
}

impl MarketInfo {
    /// Seconds until settlement (negative once expired).
    pub fn seconds_to_expiration(&self, now: DateTime<Utc>) -> i64 {
        (self.expiration - now).num_seconds()
    }

    pub fn token_id(&self, outcome: Outcome) -> &str {
        match outcome {
            Outcome::Yes => &self.yes_token_id,
            Outcome::No => &self.no_token_id,
        }
    }

    /// Structural checks applied wherever a market enters the system.
    pub fn validate(&self) -> Result<(), ClientError> {
        let invalid = |reason: &str| ClientError::InvalidMarket {
            market_id: self.market_id.clone(),
            reason: reason.to_string(),
        };

        if self.market_id.trim().is_empty() {
            return Err(invalid("empty market id"));
        }
        if self.yes_token_id.trim().is_empty() || self.no_token_id.trim().is_empty() {
            return Err(invalid("missing outcome token id"));
        }
        if self.yes_token_id == self.no_token_id {
            return Err(invalid("YES and NO token ids are identical"));
        }
        if self.tick_size <= Decimal::ZERO {
            return Err(invalid("tick size must be positive"));
        }
        if self.min_size < Decimal::ZERO {
            return Err(invalid("minimum size must not be negative"));
        }
        Ok(())
    }
}

/// Resting limit order. `post_only` orders never take liquidity.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitOrder {
    pub token_id: String,
    pub outcome: Outcome,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub post_only: bool,
}

/// Immediate order that sweeps the book.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrder {
    pub token_id: String,
    pub outcome: Outcome,
    pub side: OrderSide,
    pub size: Decimal,
}

/// A confirmed execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub order_id: String,
    pub price: Decimal,
    pub size: Decimal,
}

/// Result of an order placement the venue answered.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Filled(Fill),
    Rejected { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn market() -> MarketInfo {
        MarketInfo {
            market_id: "m-1".into(),
            condition_id: "c-1".into(),
            question: "BTC above 100k at 12:15?".into(),
            expiration: Utc::now() + chrono::Duration::minutes(12),
            yes_token_id: "tok-yes".into(),
            no_token_id: "tok-no".into(),
            strike_price: Some(dec!(100000)),
            tick_size: dec!(0.01),
            min_size: dec!(1),
            active: true,
            closed: false,
        }
    }

    #[test]
    fn test_side_book_sorting_and_depth() {
        let book = SideBook::from_levels(
            vec![BookLevel::new(dec!(0.40), dec!(5)), BookLevel::new(dec!(0.45), dec!(7))],
            vec![
                BookLevel::new(dec!(0.52), dec!(3)),
                BookLevel::new(dec!(0.50), dec!(4)),
                BookLevel::new(dec!(0.55), dec!(0)),
            ],
        );
        assert_eq!(book.best_bid(), Some(dec!(0.45)));
        assert_eq!(book.best_ask(), Some(dec!(0.50)));
        assert_eq!(book.asks.len(), 2);
        assert_eq!(book.ask_depth(1), dec!(4));
        assert_eq!(book.ask_depth(10), dec!(7));
        assert_eq!(book.bid_depth(5), dec!(12));
    }

    #[test]
    fn test_apply_change_replaces_and_removes() {
        let mut book = SideBook::from_levels(vec![], vec![BookLevel::new(dec!(0.50), dec!(4))]);
        book.apply_change(OrderSide::Sell, dec!(0.49), dec!(2));
        assert_eq!(book.best_ask(), Some(dec!(0.49)));
        book.apply_change(OrderSide::Sell, dec!(0.49), dec!(0));
        assert_eq!(book.best_ask(), Some(dec!(0.50)));
    }

    #[test]
    fn test_market_validation() {
        assert!(market().validate().is_ok());

        let mut m = market();
        m.no_token_id = m.yes_token_id.clone();
        assert!(m.validate().is_err());

        let mut m = market();
        m.tick_size = Decimal::ZERO;
        assert!(m.validate().is_err());

        let mut m = market();
        m.market_id = " ".into();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_outcome_helpers() {
        assert_eq!(Outcome::Yes.opposite(), Outcome::No);
        assert_eq!(Outcome::No.to_string(), "NO");
        assert_eq!(market().token_id(Outcome::No), "tok-no");
    }
}

//! Fixtures shared by the unit tests.

use crate::exchange::{BookLevel, MarketInfo, OrderBook, SideBook};
use crate::persistence::SqliteBackend;
use crate::state::PositionStore;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

pub fn market_expiring_in(seconds: i64) -> MarketInfo {
    MarketInfo {
        market_id: "btc-updown-1215".into(),
        condition_id: "0xcond".into(),
        question: "BTC Up or Down 12:00-12:15?".into(),
        expiration: Utc::now() + Duration::seconds(seconds),
        yes_token_id: "tok-yes".into(),
        no_token_id: "tok-no".into(),
        strike_price: Some(dec!(100000)),
        tick_size: dec!(0.01),
        min_size: dec!(1),
        active: true,
        closed: false,
    }
}

pub fn levels(raw: &[(Decimal, Decimal)]) -> Vec<BookLevel> {
    raw.iter().map(|&(price, size)| BookLevel::new(price, size)).collect()
}

/// Book with a single bid and ask level per side.
pub fn simple_book(
    yes_bid: Decimal,
    yes_ask: Decimal,
    no_bid: Decimal,
    no_ask: Decimal,
    size: Decimal,
) -> OrderBook {
    OrderBook::new(
        SideBook::from_levels(levels(&[(yes_bid, size)]), levels(&[(yes_ask, size)])),
        SideBook::from_levels(levels(&[(no_bid, size)]), levels(&[(no_ask, size)])),
    )
}

pub fn memory_store() -> PositionStore {
    let backend = SqliteBackend::new(":memory:", 1000).expect("in-memory sqlite");
    PositionStore::new(Arc::new(backend), 5)
}

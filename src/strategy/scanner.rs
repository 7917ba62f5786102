//! Opportunity scanner for paired accumulation.
//!
//! Each tick compares the best ask on one side with the average entry price
//! on the other. A buy is proposed when the resulting pair would cost less
//! than `1 - profit_margin`, then filtered through the position, liquidity
//! and settlement constraints before being executed as a post-only order.

use super::executor::{Execution, OrderExecutor};
use crate::config::{RiskConfig, TradingConfig};
use crate::errors::{ClientError, EngineError};
use crate::exchange::{MarketClient, MarketInfo, OrderBook, Outcome};
use crate::state::{Position, SessionControl, TradeSource};
use crate::supervisor::PeriodicTask;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Why a side was not bought this tick. Skips are normal, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotRunning,
    Halted,
    SettlementBuffer,
    /// Missing ask on the side or on the opposite side during cold start
    NoQuote,
    NotProfitable,
    DeltaLimit,
    PositionLimit,
    ThinLiquidity,
}

/// A profitable buy before constraint checks.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub outcome: Outcome,
    /// Best ask on `outcome`
    pub price: Decimal,
    /// `price` plus the opposite side's (possibly assumed) average
    pub expected_pair_cost: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Gated(SkipReason),
    Scanned {
        fills: usize,
        skipped: Vec<(Outcome, SkipReason)>,
    },
}

/// Scanner limits, taken from the trading and risk sections.
#[derive(Debug, Clone)]
pub struct ScannerParams {
    pub interval: Duration,
    pub target_cost: Decimal,
    pub trade_size: Decimal,
    pub max_position_size: Decimal,
    pub depth_levels: usize,
    pub max_unhedged_delta: Decimal,
    pub liquidity_multiplier: Decimal,
    pub settlement_buffer_seconds: i64,
}

impl ScannerParams {
    pub fn from_config(trading: &TradingConfig, risk: &RiskConfig) -> Self {
        Self {
            interval: trading.scan_interval(),
            target_cost: trading.target_cost(),
            trade_size: trading.trade_size,
            max_position_size: trading.max_position_size,
            depth_levels: trading.depth_levels,
            max_unhedged_delta: risk.max_unhedged_delta,
            liquidity_multiplier: risk.liquidity_multiplier,
            settlement_buffer_seconds: risk.settlement_buffer_seconds,
        }
    }
}

pub struct OpportunityScanner {
    params: ScannerParams,
    client: Arc<dyn MarketClient>,
    executor: OrderExecutor,
    session: SessionControl,
    data_timeout: Duration,
}

impl OpportunityScanner {
    pub fn new(
        params: ScannerParams,
        client: Arc<dyn MarketClient>,
        executor: OrderExecutor,
        session: SessionControl,
        data_timeout: Duration,
    ) -> Self {
        Self {
            params,
            client,
            executor,
            session,
            data_timeout,
        }
    }

    /// Price check for buying `outcome`.
    ///
    /// An empty opposite side assumes its own best ask as the average, for
    /// this evaluation only.
    pub fn evaluate_side(
        &self,
        outcome: Outcome,
        position: &Position,
        book: &OrderBook,
    ) -> Result<Candidate, SkipReason> {
        let price = book.best_ask(outcome).ok_or(SkipReason::NoQuote)?;
        let opposite = outcome.opposite();
        let opposite_avg = position
            .avg(opposite)
            .or_else(|| book.best_ask(opposite))
            .ok_or(SkipReason::NoQuote)?;

        let expected_pair_cost = price + opposite_avg;
        if expected_pair_cost >= self.params.target_cost {
            return Err(SkipReason::NotProfitable);
        }

        Ok(Candidate {
            outcome,
            price,
            expected_pair_cost,
        })
    }

    /// Profitable candidates, cheapest expected pair first.
    pub fn candidates(&self, position: &Position, book: &OrderBook) -> Vec<Candidate> {
        let mut found: Vec<Candidate> = [Outcome::Yes, Outcome::No]
            .into_iter()
            .filter_map(|outcome| self.evaluate_side(outcome, position, book).ok())
            .collect();
        found.sort_by(|a, b| a.expected_pair_cost.cmp(&b.expected_pair_cost));
        found
    }

    /// Risk constraints a candidate must pass before an order is sent.
    pub fn check_constraints(
        &self,
        candidate: &Candidate,
        position: &Position,
        book: &OrderBook,
        seconds_to_expiry: i64,
        halted: bool,
    ) -> Result<(), SkipReason> {
        let p = &self.params;

        if halted {
            return Err(SkipReason::Halted);
        }
        if seconds_to_expiry <= p.settlement_buffer_seconds {
            return Err(SkipReason::SettlementBuffer);
        }

        let after = position.with_buy(candidate.outcome, p.trade_size, candidate.price);
        if after.delta().abs() > p.max_unhedged_delta {
            return Err(SkipReason::DeltaLimit);
        }
        if after.qty(candidate.outcome) > p.max_position_size {
            return Err(SkipReason::PositionLimit);
        }

        let hedge_depth = book.ask_depth(candidate.outcome.opposite(), p.depth_levels);
        if hedge_depth < p.liquidity_multiplier * p.trade_size {
            return Err(SkipReason::ThinLiquidity);
        }

        Ok(())
    }

    async fn fetch_book(&self, market: &MarketInfo) -> Result<OrderBook, EngineError> {
        let book = tokio::time::timeout(self.data_timeout, self.client.get_order_book(market))
            .await
            .map_err(|_| ClientError::Timeout(self.data_timeout))??;
        Ok(book)
    }

    pub async fn tick(&self) -> Result<ScanOutcome, EngineError> {
        if !self.session.is_running() {
            return Ok(ScanOutcome::Gated(SkipReason::NotRunning));
        }

        let store = self.executor.store();
        if store.is_halted().await? {
            return Ok(ScanOutcome::Gated(SkipReason::Halted));
        }

        let market = store.market().await?.ok_or(EngineError::NoMarket)?;
        let seconds_to_expiry = market.seconds_to_expiration(Utc::now());
        if seconds_to_expiry <= self.params.settlement_buffer_seconds {
            return Ok(ScanOutcome::Gated(SkipReason::SettlementBuffer));
        }

        let book = self.fetch_book(&market).await?;
        let mut position = store.read().await?;

        let mut fills = 0;
        let mut skipped = Vec::new();

        for (i, first_pass) in self.candidates(&position, &book).into_iter().enumerate() {
            let candidate = if i == 0 {
                first_pass
            } else {
                // The earlier fill moved the averages; re-price from a fresh read.
                position = store.read().await?;
                match self.evaluate_side(first_pass.outcome, &position, &book) {
                    Ok(candidate) => candidate,
                    Err(reason) => {
                        skipped.push((first_pass.outcome, reason));
                        continue;
                    }
                }
            };

            let halted = store.is_halted().await?;
            let seconds_to_expiry = market.seconds_to_expiration(Utc::now());
            if let Err(reason) =
                self.check_constraints(&candidate, &position, &book, seconds_to_expiry, halted)
            {
                trace!(outcome = %candidate.outcome, ?reason, "Candidate skipped");
                skipped.push((candidate.outcome, reason));
                continue;
            }

            debug!(
                outcome = %candidate.outcome,
                price = %candidate.price,
                expected_pair_cost = %candidate.expected_pair_cost,
                "🔍 Opportunity found"
            );

            let execution = self
                .executor
                .buy(
                    TradeSource::Scanner,
                    &market,
                    candidate.outcome,
                    candidate.price,
                    self.params.trade_size,
                    true,
                )
                .await?;

            match execution {
                Execution::Filled { position: after, .. } => {
                    fills += 1;
                    info!(
                        outcome = %candidate.outcome,
                        pair_cost = ?after.pair_cost(),
                        locked_pairs = %after.locked_pairs(),
                        "Accumulated"
                    );
                }
                Execution::Rejected { .. } => break,
            }
        }

        Ok(ScanOutcome::Scanned { fills, skipped })
    }
}

#[async_trait]
impl PeriodicTask for OpportunityScanner {
    fn name(&self) -> &'static str {
        "scanner"
    }

    fn interval(&self) -> Duration {
        self.params.interval
    }

    async fn run_once(&self) -> Result<(), EngineError> {
        self.tick().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockMarketClient, PaperClient, SideBook};
    use crate::state::PositionStore;
    use crate::test_support::{levels, market_expiring_in, memory_store, simple_book};
    use rust_decimal_macros::dec;

    fn params() -> ScannerParams {
        ScannerParams {
            interval: Duration::from_millis(100),
            target_cost: dec!(0.98),
            trade_size: dec!(10),
            max_position_size: dec!(1000),
            depth_levels: 1,
            max_unhedged_delta: dec!(50),
            liquidity_multiplier: dec!(3),
            settlement_buffer_seconds: 120,
        }
    }

    fn scanner_with(
        params: ScannerParams,
        client: Arc<dyn MarketClient>,
        store: PositionStore,
    ) -> (OpportunityScanner, SessionControl) {
        let session = SessionControl::new();
        let executor = OrderExecutor::new(client.clone(), store, Duration::from_secs(5));
        let scanner = OpportunityScanner::new(
            params,
            client,
            executor,
            session.clone(),
            Duration::from_secs(2),
        );
        (scanner, session)
    }

    fn scanner() -> OpportunityScanner {
        scanner_with(params(), Arc::new(PaperClient::new()), memory_store()).0
    }

    fn holding(yes_qty: Decimal, yes_cost: Decimal, no_qty: Decimal, no_cost: Decimal) -> Position {
        Position {
            yes_qty,
            yes_cost,
            no_qty,
            no_cost,
            ..Position::default()
        }
    }

    #[test]
    fn test_strict_boundary_at_target_cost() {
        let scanner = scanner();
        let position = holding(dec!(10), dec!(4.8), dec!(10), dec!(5.0));

        // ask_yes + avg_no == 0.98: not strictly below target
        let at_target = simple_book(dec!(0.46), dec!(0.48), dec!(0.49), dec!(0.51), dec!(100));
        assert_eq!(
            scanner.evaluate_side(Outcome::Yes, &position, &at_target),
            Err(SkipReason::NotProfitable)
        );

        let just_below = simple_book(dec!(0.46), dec!(0.4799), dec!(0.49), dec!(0.51), dec!(100));
        let candidate = scanner
            .evaluate_side(Outcome::Yes, &position, &just_below)
            .unwrap();
        assert_eq!(candidate.expected_pair_cost, dec!(0.9799));
    }

    #[test]
    fn test_cold_start_uses_opposite_ask() {
        let scanner = scanner();
        let book = simple_book(dec!(0.45), dec!(0.47), dec!(0.48), dec!(0.50), dec!(100));

        let candidates = scanner.candidates(&Position::default(), &book);
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.expected_pair_cost == dec!(0.97)));
    }

    #[test]
    fn test_candidates_ordered_by_expected_pair_cost() {
        let scanner = scanner();
        let position = holding(dec!(10), dec!(4.6), dec!(10), dec!(4.9));
        // YES: 0.47 + 0.49 = 0.96, NO: 0.48 + 0.46 = 0.94
        let book = simple_book(dec!(0.45), dec!(0.47), dec!(0.47), dec!(0.48), dec!(100));
        let candidates = scanner.candidates(&position, &book);
        assert_eq!(candidates[0].outcome, Outcome::No);
        assert_eq!(candidates[0].expected_pair_cost, dec!(0.94));
        assert_eq!(candidates[1].outcome, Outcome::Yes);
    }

    #[test]
    fn test_thin_hedge_liquidity_is_skipped() {
        let scanner = scanner();
        // NO asks hold 20 shares: 2x trade size, multiplier is 3
        let book = OrderBook::new(
            SideBook::from_levels(
                levels(&[(dec!(0.45), dec!(100))]),
                levels(&[(dec!(0.47), dec!(100))]),
            ),
            SideBook::from_levels(
                levels(&[(dec!(0.48), dec!(100))]),
                levels(&[(dec!(0.50), dec!(20))]),
            ),
        );
        let candidate = scanner
            .evaluate_side(Outcome::Yes, &Position::default(), &book)
            .unwrap();

        assert_eq!(
            scanner.check_constraints(&candidate, &Position::default(), &book, 600, false),
            Err(SkipReason::ThinLiquidity)
        );
    }

    #[test]
    fn test_only_top_of_book_counts_as_hedge_depth() {
        let scanner = scanner();
        // 40 NO shares across two levels, but only 20 at the best ask
        let book = OrderBook::new(
            SideBook::from_levels(
                levels(&[(dec!(0.45), dec!(100))]),
                levels(&[(dec!(0.47), dec!(100))]),
            ),
            SideBook::from_levels(
                levels(&[(dec!(0.48), dec!(100))]),
                levels(&[(dec!(0.50), dec!(20)), (dec!(0.51), dec!(20))]),
            ),
        );
        let candidate = scanner
            .evaluate_side(Outcome::Yes, &Position::default(), &book)
            .unwrap();

        assert_eq!(
            scanner.check_constraints(&candidate, &Position::default(), &book, 600, false),
            Err(SkipReason::ThinLiquidity)
        );
    }

    #[test]
    fn test_delta_and_position_limits() {
        let scanner = scanner();
        let book = simple_book(dec!(0.45), dec!(0.47), dec!(0.48), dec!(0.50), dec!(100));
        let candidate = Candidate {
            outcome: Outcome::Yes,
            price: dec!(0.47),
            expected_pair_cost: dec!(0.95),
        };

        let heavy = holding(dec!(45), dec!(20), Decimal::ZERO, Decimal::ZERO);
        assert_eq!(
            scanner.check_constraints(&candidate, &heavy, &book, 600, false),
            Err(SkipReason::DeltaLimit)
        );

        let full = holding(dec!(995), dec!(450), dec!(990), dec!(480));
        assert_eq!(
            scanner.check_constraints(&candidate, &full, &book, 600, false),
            Err(SkipReason::PositionLimit)
        );

        let fine = holding(dec!(10), dec!(4.7), dec!(10), dec!(4.8));
        assert_eq!(scanner.check_constraints(&candidate, &fine, &book, 600, false), Ok(()));
        assert_eq!(
            scanner.check_constraints(&candidate, &fine, &book, 600, true),
            Err(SkipReason::Halted)
        );
        assert_eq!(
            scanner.check_constraints(&candidate, &fine, &book, 120, false),
            Err(SkipReason::SettlementBuffer)
        );
    }

    #[tokio::test]
    async fn test_tick_accumulates_both_sides() {
        let paper = Arc::new(PaperClient::new());
        paper
            .set_book(simple_book(dec!(0.45), dec!(0.47), dec!(0.48), dec!(0.50), dec!(100)))
            .await;
        let store = memory_store();
        store.set_market(&market_expiring_in(600)).await.unwrap();
        let (scanner, session) = scanner_with(params(), paper.clone(), store.clone());
        session.start().unwrap();

        let outcome = scanner.tick().await.unwrap();

        assert_eq!(
            outcome,
            ScanOutcome::Scanned {
                fills: 2,
                skipped: vec![]
            }
        );
        let position = store.read().await.unwrap();
        assert_eq!(position.yes_qty, dec!(10));
        assert_eq!(position.no_qty, dec!(10));
        assert_eq!(position.pair_cost(), Some(dec!(0.97)));
        assert_eq!(position.version, 2);
        assert_eq!(paper.fills().await.len(), 2);
    }

    #[tokio::test]
    async fn test_no_trades_inside_settlement_buffer() {
        let mut client = MockMarketClient::new();
        client.expect_get_order_book().never();
        client.expect_place_limit_order().never();

        let store = memory_store();
        store.set_market(&market_expiring_in(90)).await.unwrap();
        let (scanner, session) = scanner_with(params(), Arc::new(client), store.clone());
        session.start().unwrap();

        let outcome = scanner.tick().await.unwrap();
        assert_eq!(outcome, ScanOutcome::Gated(SkipReason::SettlementBuffer));
        assert_eq!(store.trade_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_gated_when_not_running_or_halted() {
        let store = memory_store();
        store.set_market(&market_expiring_in(600)).await.unwrap();
        let (scanner, session) = scanner_with(params(), Arc::new(PaperClient::new()), store.clone());

        assert_eq!(
            scanner.tick().await.unwrap(),
            ScanOutcome::Gated(SkipReason::NotRunning)
        );

        session.start().unwrap();
        store.set_halt(true).await.unwrap();
        assert_eq!(scanner.tick().await.unwrap(), ScanOutcome::Gated(SkipReason::Halted));
    }

    #[tokio::test]
    async fn test_book_error_skips_tick_as_transient() {
        let mut client = MockMarketClient::new();
        client
            .expect_get_order_book()
            .returning(|_| Err(ClientError::Http { status: 503, body: "busy".into() }));
        let store = memory_store();
        store.set_market(&market_expiring_in(600)).await.unwrap();
        let (scanner, session) = scanner_with(params(), Arc::new(client), store);
        session.start().unwrap();

        let err = scanner.tick().await.unwrap_err();
        assert!(err.is_transient());
    }
}

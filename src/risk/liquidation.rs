//! Emergency exit: cancel everything, sell both sides, halt.

use super::alert::{RiskAlert, RiskAlertType};
use crate::exchange::{MarketInfo, Outcome};
use crate::state::{Position, RiskLevel, SessionControl, Trade, TradeAction, TradeSource};
use crate::strategy::{Execution, OrderExecutor};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// What each liquidation step achieved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiquidationReport {
    pub cancelled: Option<usize>,
    pub yes_sold: Decimal,
    pub no_sold: Decimal,
    pub halted: bool,
    pub failures: Vec<String>,
}

impl LiquidationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs the fixed liquidation sequence. Steps are attempted in order and
/// never retried; a failed step raises a CRITICAL alert and the sequence
/// moves on.
pub struct Liquidator {
    executor: OrderExecutor,
    session: SessionControl,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag when the run ends, panics included.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Liquidator {
    pub fn new(executor: OrderExecutor, session: SessionControl) -> Self {
        Self {
            executor,
            session,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run [`Liquidator::liquidate`] on its own task so dropping the caller
    /// cannot interrupt it. Returns `None` if a run is already in flight.
    pub fn spawn(self: Arc<Self>, reason: String) -> Option<JoinHandle<LiquidationReport>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(%reason, "[LIQUIDATION] Already in progress");
            return None;
        }
        Some(tokio::spawn(async move {
            let _guard = InFlight(&self.in_flight);
            self.liquidate(&reason).await
        }))
    }

    pub async fn liquidate(&self, reason: &str) -> LiquidationReport {
        error!(%reason, "🚨 [LIQUIDATION] Starting emergency liquidation");
        let mut report = LiquidationReport::default();
        let store = self.executor.store();

        // 1. Cancel resting orders
        match self.executor.cancel_all().await {
            Ok(n) => {
                report.cancelled = Some(n);
                self.audit(TradeAction::CancelAll, None, true, format!("cancelled {} orders", n))
                    .await;
            }
            Err(e) => {
                self.step_failed(&mut report, "cancel_all", e.to_string());
                self.audit(TradeAction::CancelAll, None, false, e.to_string()).await;
            }
        }

        // 2-3. Sell YES, then NO
        let market = match store.market().await {
            Ok(Some(market)) => Some(market),
            Ok(None) => {
                self.step_failed(&mut report, "load_market", "no market loaded".into());
                None
            }
            Err(e) => {
                self.step_failed(&mut report, "load_market", e.to_string());
                None
            }
        };
        for outcome in [Outcome::Yes, Outcome::No] {
            let sold = self.sell_side(&mut report, market.as_ref(), outcome).await;
            match outcome {
                Outcome::Yes => report.yes_sold = sold,
                Outcome::No => report.no_sold = sold,
            }
        }

        // 4. Halt
        match store.set_halt(true).await {
            Ok(()) => {
                report.halted = true;
                self.audit(TradeAction::Halt, None, true, reason.to_string()).await;
            }
            Err(e) => {
                self.step_failed(&mut report, "set_halt", e.to_string());
                self.audit(TradeAction::Halt, None, false, e.to_string()).await;
            }
        }

        match store.read().await {
            Ok(position) if position.is_flat() => {
                if self.session.mark_liquidated() {
                    info!("🏁 [LIQUIDATION] Position flat, session liquidated");
                }
            }
            Ok(position) => warn!(
                yes_qty = %position.yes_qty,
                no_qty = %position.no_qty,
                "[LIQUIDATION] Position not flat after liquidation, panic again to retry"
            ),
            Err(e) => error!(error = %e, "[LIQUIDATION] Could not read final position"),
        }

        info!(
            cancelled = ?report.cancelled,
            yes_sold = %report.yes_sold,
            no_sold = %report.no_sold,
            halted = report.halted,
            failures = report.failures.len(),
            "[LIQUIDATION] Sequence finished"
        );
        report
    }

    async fn sell_side(
        &self,
        report: &mut LiquidationReport,
        market: Option<&MarketInfo>,
        outcome: Outcome,
    ) -> Decimal {
        let step = format!("sell_{}", outcome.as_str().to_lowercase());

        let held = match self.executor.store().read().await {
            Ok(position) => position.qty(outcome),
            Err(e) => {
                self.step_failed(report, &step, e.to_string());
                self.audit(TradeAction::Sell, Some(outcome), false, e.to_string()).await;
                return Decimal::ZERO;
            }
        };
        if held.is_zero() {
            self.audit(TradeAction::Sell, Some(outcome), true, "nothing held".into())
                .await;
            return Decimal::ZERO;
        }

        let Some(market) = market else {
            self.audit(TradeAction::Sell, Some(outcome), false, "no market loaded".into())
                .await;
            return Decimal::ZERO;
        };

        match self
            .executor
            .market_sell(TradeSource::Liquidation, market, outcome, held)
            .await
        {
            // The executor already logged the fill as a trade
            Ok(Execution::Filled { fill, .. }) => fill.size,
            Ok(Execution::Rejected { reason }) => {
                self.step_failed(report, &step, reason.clone());
                self.audit(TradeAction::Sell, Some(outcome), false, reason).await;
                Decimal::ZERO
            }
            Err(e) => {
                self.step_failed(report, &step, e.to_string());
                self.audit(TradeAction::Sell, Some(outcome), false, e.to_string()).await;
                Decimal::ZERO
            }
        }
    }

    fn step_failed(&self, report: &mut LiquidationReport, step: &str, reason: String) {
        error!(step, error = %reason, "[LIQUIDATION] Step failed");
        RiskAlert::new(
            RiskAlertType::LiquidationStepFailed {
                step: step.to_string(),
                error: reason.clone(),
            },
            RiskLevel::Critical,
            format!("liquidation step {} failed: {}", step, reason),
        )
        .emit();
        report.failures.push(format!("{}: {}", step, reason));
    }

    async fn audit(&self, action: TradeAction, side: Option<Outcome>, succeeded: bool, note: String) {
        let store = self.executor.store();
        let current = store.read().await.unwrap_or_else(|_| Position::default());
        let trade = Trade::audit(TradeSource::Liquidation, action, side, succeeded, Some(note), &current);
        if let Err(e) = store.append_trade(&trade).await {
            error!(%action, error = %e, "[LIQUIDATION] Audit record not written");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ClientError;
    use crate::exchange::{MockMarketClient, OrderOutcome, PaperClient};
    use crate::state::SessionState;
    use crate::test_support::{market_expiring_in, memory_store, simple_book};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    async fn seeded(client: Arc<dyn crate::exchange::MarketClient>) -> (Liquidator, SessionControl) {
        let store = memory_store();
        store.set_market(&market_expiring_in(600)).await.unwrap();
        store
            .conditional_update(|p| {
                p.with_buy(Outcome::Yes, dec!(20), dec!(0.45))
                    .with_buy(Outcome::No, dec!(8), dec!(0.50))
            })
            .await
            .unwrap();
        let session = SessionControl::new();
        session.start().unwrap();
        assert!(session.begin_liquidation());
        let executor = OrderExecutor::new(client, store, Duration::from_secs(5));
        (Liquidator::new(executor, session.clone()), session)
    }

    #[tokio::test]
    async fn test_full_sequence_flattens_and_halts() {
        let paper = Arc::new(PaperClient::new());
        paper
            .set_book(simple_book(dec!(0.44), dec!(0.46), dec!(0.49), dec!(0.51), dec!(100)))
            .await;
        let (liquidator, session) = seeded(paper.clone()).await;

        let report = liquidator.liquidate("test").await;

        assert!(report.is_clean());
        assert_eq!(report.yes_sold, dec!(20));
        assert_eq!(report.no_sold, dec!(8));
        assert!(report.halted);
        assert_eq!(paper.cancel_calls().await, 1);
        assert_eq!(session.state(), SessionState::Liquidated);

        let store = liquidator.executor.store();
        assert!(store.read().await.unwrap().is_flat());
        assert!(store.is_halted().await.unwrap());

        let actions: Vec<TradeAction> = store
            .recent_trades(10)
            .await
            .unwrap()
            .into_iter()
            .rev()
            .map(|t| t.action)
            .collect();
        assert_eq!(
            actions,
            vec![TradeAction::CancelAll, TradeAction::Sell, TradeAction::Sell, TradeAction::Halt]
        );
    }

    #[tokio::test]
    async fn test_one_run_in_flight_at_a_time() {
        let paper = Arc::new(PaperClient::new());
        paper
            .set_book(simple_book(dec!(0.44), dec!(0.46), dec!(0.49), dec!(0.51), dec!(100)))
            .await;
        let (liquidator, _session) = seeded(paper.clone()).await;
        let liquidator = Arc::new(liquidator);

        let first = liquidator.clone().spawn("first".into()).unwrap();
        assert!(liquidator.is_running());
        assert!(liquidator.clone().spawn("second".into()).is_none());

        assert!(first.await.unwrap().is_clean());
        assert!(!liquidator.is_running());
        assert_eq!(paper.cancel_calls().await, 1);
    }

    #[tokio::test]
    async fn test_failed_steps_do_not_stop_the_sequence() {
        let mut client = MockMarketClient::new();
        client
            .expect_cancel_all_orders()
            .times(1)
            .returning(|| Err(ClientError::Transport("down".into())));
        client
            .expect_place_market_order()
            .times(2)
            .returning(|_| Ok(OrderOutcome::Rejected { reason: "empty book".into() }));
        let (liquidator, session) = seeded(Arc::new(client)).await;

        let report = liquidator.liquidate("test").await;

        assert_eq!(report.failures.len(), 3);
        assert!(report.halted);
        assert_eq!(session.state(), SessionState::Liquidating);

        let store = liquidator.executor.store();
        assert!(store.is_halted().await.unwrap());
        let trades = store.recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 4);
        assert_eq!(trades.iter().filter(|t| !t.succeeded).count(), 3);
    }
}

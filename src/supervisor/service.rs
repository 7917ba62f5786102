//! Trading service: session lifecycle and the control surface.

use super::selection::select_market;
use super::tasks::{supervise, ComponentHealth, HealthBoard, PeriodicTask, RestartPolicy};
use crate::config::Config;
use crate::errors::{ClientError, ControlError};
use crate::exchange::{BookStream, MarketClient, MarketInfo, OrderBook};
use crate::risk::{LiquidationReport, Liquidator, RiskMonitor};
use crate::state::{Position, PositionStore, SessionControl, SessionState, Trade};
use crate::strategy::{DeltaRebalancer, OpportunityScanner, OrderExecutor, ScannerParams};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const STATUS_TRADES: usize = 20;

/// Position with its derived values, as shown to the operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionSummary {
    pub yes_qty: Decimal,
    pub no_qty: Decimal,
    pub yes_cost: Decimal,
    pub no_cost: Decimal,
    pub avg_yes: Option<Decimal>,
    pub avg_no: Option<Decimal>,
    pub delta: Decimal,
    pub pair_cost: Option<Decimal>,
    pub locked_pairs: Decimal,
    pub locked_profit: Decimal,
    pub cost_basis: Decimal,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<&Position> for PositionSummary {
    fn from(p: &Position) -> Self {
        Self {
            yes_qty: p.yes_qty,
            no_qty: p.no_qty,
            yes_cost: p.yes_cost,
            no_cost: p.no_cost,
            avg_yes: p.avg_yes(),
            avg_no: p.avg_no(),
            delta: p.delta(),
            pair_cost: p.pair_cost(),
            locked_pairs: p.locked_pairs(),
            locked_profit: p.locked_profit(),
            cost_basis: p.cost_basis(),
            version: p.version,
            updated_at: p.updated_at,
        }
    }
}

/// Read-only snapshot for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub state: SessionState,
    pub halted: bool,
    pub position: PositionSummary,
    pub market: Option<MarketInfo>,
    pub trade_count: u64,
    pub recent_trades: Vec<Trade>,
    pub risk_metrics: HashMap<String, serde_json::Value>,
    pub components: BTreeMap<String, ComponentHealth>,
    pub latest_book: Option<OrderBook>,
}

/// Tasks of the current session.
struct RunningSession {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl RunningSession {
    async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Task did not shut down cleanly");
            }
        }
    }
}

/// Owns the session: market selection, the supervised loops and the
/// operator controls.
pub struct TradingService {
    config: Config,
    client: Arc<dyn MarketClient>,
    store: PositionStore,
    session: SessionControl,
    executor: OrderExecutor,
    liquidator: Arc<Liquidator>,
    health: HealthBoard,
    books: Arc<watch::Sender<Option<OrderBook>>>,
    running: Mutex<Option<RunningSession>>,
}

impl TradingService {
    pub fn new(config: Config, client: Arc<dyn MarketClient>, store: PositionStore) -> Self {
        let session = SessionControl::new();
        let executor = OrderExecutor::new(
            client.clone(),
            store.clone(),
            config.execution.order_timeout(),
        );
        let liquidator = Arc::new(Liquidator::new(executor.clone(), session.clone()));
        let (books, _) = watch::channel(None);

        Self {
            config,
            client,
            store,
            session,
            executor,
            liquidator,
            health: HealthBoard::default(),
            books: Arc::new(books),
            running: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &SessionControl {
        &self.session
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    /// Select and persist a market, then start the loops.
    pub async fn start(&self) -> Result<MarketInfo, ControlError> {
        self.config
            .validate()
            .map_err(|e| ControlError::Config(e.to_string()))?;

        let mut running = self.running.lock().await;

        let state = self.session.state();
        if !matches!(state, SessionState::Stopped | SessionState::Liquidated) {
            return Err(ControlError::InvalidTransition {
                action: "start",
                state: state.to_string(),
            });
        }
        // Loops of a liquidated session are still up but idle
        if let Some(previous) = running.take() {
            previous.shutdown().await;
        }

        let market = self.select().await?;
        market
            .validate()
            .map_err(|e| ControlError::InvalidMarket(e.to_string()))?;
        self.store.set_market(&market).await?;
        self.store.set_halt(false).await?;
        self.session.start()?;

        let (shutdown, rx) = watch::channel(false);
        let mut handles = Vec::new();
        for task in self.build_tasks() {
            handles.push(tokio::spawn(supervise(
                task,
                self.restart_policy(),
                self.store.clone(),
                self.health.clone(),
                rx.clone(),
            )));
        }
        if self.config.supervisor.stream_enabled {
            handles.push(tokio::spawn(run_stream(
                self.config.clob.ws_url.clone(),
                market.clone(),
                self.books.clone(),
                self.health.clone(),
                Duration::from_secs(self.config.supervisor.stream_backoff_max_secs.max(1)),
                rx,
            )));
        }

        *running = Some(RunningSession { shutdown, handles });
        info!(
            market_id = %market.market_id,
            question = %market.question,
            expiration = %market.expiration,
            "🚀 Trading session started"
        );
        Ok(market)
    }

    /// Stop the loops and wait for them to exit.
    pub async fn stop(&self) -> Result<(), ControlError> {
        self.session.stop()?;
        if let Some(running) = self.running.lock().await.take() {
            running.shutdown().await;
        }
        info!("⏹️ Trading session stopped");
        Ok(())
    }

    /// Stop new accumulation; monitoring keeps running.
    pub async fn halt(&self) -> Result<(), ControlError> {
        self.session.halt()?;
        self.store.set_halt(true).await?;
        warn!("⏸️ Trading halted by operator");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), ControlError> {
        self.session.resume()?;
        self.store.set_halt(false).await?;
        info!("▶️ Trading resumed by operator");
        Ok(())
    }

    /// Operator-initiated liquidation.
    ///
    /// Returns `None` if a liquidation is in flight or already finished. A
    /// session left in LIQUIDATING by a run that could not flatten the
    /// position gets the sequence again. The sequence runs on its own task
    /// and completes even if this call is dropped.
    pub async fn panic(&self) -> Result<Option<LiquidationReport>, ControlError> {
        let reason = if self.session.begin_liquidation() {
            error!("🚨 PANIC CLOSE TRIGGERED");
            "operator panic"
        } else if self.session.state() == SessionState::Liquidating && !self.liquidator.is_running() {
            error!("🚨 PANIC CLOSE RETRIED, position still open");
            "operator panic retry"
        } else {
            warn!(state = %self.session.state(), "Panic ignored, liquidation already handled");
            return Ok(None);
        };

        let Some(handle) = self.liquidator.clone().spawn(reason.to_string()) else {
            return Ok(None);
        };
        match handle.await {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                error!(error = %e, "Liquidation task failed");
                Ok(None)
            }
        }
    }

    pub async fn status(&self) -> Result<ServiceStatus, ControlError> {
        let position = self.store.read().await?;
        Ok(ServiceStatus {
            state: self.session.state(),
            halted: self.store.is_halted().await?,
            position: PositionSummary::from(&position),
            market: self.store.market().await?,
            trade_count: self.store.trade_count().await?,
            recent_trades: self.store.recent_trades(STATUS_TRADES).await?,
            risk_metrics: self.store.metrics().await?,
            components: self.health.snapshot().await,
            latest_book: self.books.borrow().clone(),
        })
    }

    async fn select(&self) -> Result<MarketInfo, ControlError> {
        let timeout = self.config.execution.data_timeout();
        let markets = tokio::time::timeout(
            timeout,
            self.client.list_markets(&self.config.market.keywords),
        )
        .await
        .map_err(|_| ClientError::Timeout(timeout))??;

        info!(candidates = markets.len(), "Selecting market");
        select_market(&markets, &self.config.market, Utc::now()).ok_or(ControlError::NoMarket)
    }

    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.config.supervisor.max_task_restarts,
            backoff: self.config.supervisor.restart_backoff(),
            stable_after: self.config.supervisor.restart_stable(),
        }
    }

    fn build_tasks(&self) -> Vec<Arc<dyn PeriodicTask>> {
        let data_timeout = self.config.execution.data_timeout();

        let scanner = OpportunityScanner::new(
            ScannerParams::from_config(&self.config.trading, &self.config.risk),
            self.client.clone(),
            self.executor.clone(),
            self.session.clone(),
            data_timeout,
        );
        let rebalancer = DeltaRebalancer::new(
            self.config.rebalance.clone(),
            self.client.clone(),
            self.executor.clone(),
            self.session.clone(),
            data_timeout,
        );
        let monitor = RiskMonitor::new(
            self.config.risk.clone(),
            self.client.clone(),
            self.store.clone(),
            self.session.clone(),
            self.liquidator.clone(),
            data_timeout,
        );

        vec![Arc::new(scanner), Arc::new(rebalancer), Arc::new(monitor)]
    }
}

/// Keep the book stream connected, reconnecting with exponential backoff.
async fn run_stream(
    ws_url: String,
    market: MarketInfo,
    books: Arc<watch::Sender<Option<OrderBook>>>,
    health: HealthBoard,
    max_backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    const NAME: &str = "stream";
    let stream = BookStream::new(ws_url, market);
    let mut failures = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }
        health.set(NAME, ComponentHealth::Running).await;

        match stream.run(&books, shutdown.clone()).await {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                warn!(error = %e, failures, "📡 [STREAM] Disconnected");
            }
        }
        if *shutdown.borrow() {
            break;
        }

        let delay = Duration::from_secs(1u64 << failures.min(6)).min(max_backoff);
        health
            .set(NAME, ComponentHealth::Restarting { restarts: failures })
            .await;
        info!(delay_secs = delay.as_secs(), "📡 [STREAM] Reconnecting");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    health.set(NAME, ComponentHealth::Stopped).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Fill, MarketOrder, MockMarketClient, OrderOutcome, Outcome, PaperClient};
    use std::sync::atomic::{AtomicBool, Ordering};
    use crate::test_support::{market_expiring_in, memory_store, simple_book};
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.trading.scan_interval_ms = 10;
        config.rebalance.interval_ms = 10;
        config.risk.interval_secs = 1;
        config
    }

    async fn paper_service(markets: Vec<MarketInfo>) -> (TradingService, Arc<PaperClient>) {
        let paper = Arc::new(PaperClient::new());
        paper.set_markets(markets).await;
        // Bids level with asks keep the stop-loss quiet.
        paper
            .set_book(simple_book(dec!(0.47), dec!(0.47), dec!(0.50), dec!(0.50), dec!(1000)))
            .await;
        let service = TradingService::new(fast_config(), paper.clone(), memory_store());
        (service, paper)
    }

    #[tokio::test]
    async fn test_start_persists_market_and_runs_loops() {
        let (service, _paper) = paper_service(vec![market_expiring_in(12 * 60)]).await;

        let market = service.start().await.unwrap();

        assert_eq!(service.session().state(), SessionState::Running);
        assert_eq!(service.store().market().await.unwrap(), Some(market));

        tokio::time::timeout(Duration::from_secs(5), async {
            while service.store().read().await.unwrap().locked_pairs() == Decimal::ZERO {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let status = service.status().await.unwrap();
        assert_eq!(status.state, SessionState::Running);
        assert!(status.trade_count >= 2);
        assert_eq!(status.components.len(), 3);
        assert!(status
            .components
            .values()
            .all(|h| *h == ComponentHealth::Running));

        service.stop().await.unwrap();
        assert_eq!(service.session().state(), SessionState::Stopped);
        let status = service.status().await.unwrap();
        assert!(status
            .components
            .values()
            .all(|h| *h == ComponentHealth::Stopped));
    }

    #[tokio::test]
    async fn test_invalid_config_aborts_start() {
        let paper = Arc::new(PaperClient::new());
        paper.set_markets(vec![market_expiring_in(12 * 60)]).await;
        let mut config = fast_config();
        config.risk.interval_secs = 0;
        let service = TradingService::new(config, paper, memory_store());

        let err = service.start().await.unwrap_err();

        assert!(matches!(err, ControlError::Config(_)));
        assert_eq!(service.session().state(), SessionState::Stopped);
        assert_eq!(service.store().market().await.unwrap(), None);
        assert!(service.status().await.unwrap().components.is_empty());
    }

    #[tokio::test]
    async fn test_start_without_eligible_market_fails() {
        let (service, _paper) = paper_service(vec![market_expiring_in(60 * 60)]).await;

        let err = service.start().await.unwrap_err();

        assert!(matches!(err, ControlError::NoMarket));
        assert_eq!(service.session().state(), SessionState::Stopped);
        assert_eq!(service.store().market().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_market_aborts_start() {
        let mut broken = market_expiring_in(12 * 60);
        broken.no_token_id = broken.yes_token_id.clone();
        let (service, _paper) = paper_service(vec![broken]).await;

        let err = service.start().await.unwrap_err();

        assert!(matches!(err, ControlError::InvalidMarket(_)));
        assert_eq!(service.session().state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_halt_and_resume() {
        let (service, _paper) = paper_service(vec![market_expiring_in(12 * 60)]).await;
        service.start().await.unwrap();

        assert_err!(service.resume().await);
        assert_ok!(service.halt().await);
        assert_ok!(service.halt().await);
        assert!(service.store().is_halted().await.unwrap());
        assert_eq!(service.session().state(), SessionState::Halted);

        assert_ok!(service.resume().await);
        assert!(!service.store().is_halted().await.unwrap());
        assert_eq!(service.session().state(), SessionState::Running);

        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_panic_liquidates_once() {
        let (service, paper) = paper_service(vec![market_expiring_in(12 * 60)]).await;
        service
            .store()
            .set_market(&market_expiring_in(12 * 60))
            .await
            .unwrap();
        service
            .store()
            .conditional_update(|p| {
                p.with_buy(Outcome::Yes, dec!(30), dec!(0.47))
                    .with_buy(Outcome::No, dec!(10), dec!(0.50))
            })
            .await
            .unwrap();

        let report = service.panic().await.unwrap().unwrap();

        assert!(report.is_clean());
        assert_eq!(paper.cancel_calls().await, 1);
        let status = service.status().await.unwrap();
        assert_eq!(status.state, SessionState::Liquidated);
        assert!(status.halted);
        assert_eq!(status.position.locked_pairs, Decimal::ZERO);
        assert!(status.position.yes_qty.is_zero() && status.position.no_qty.is_zero());

        assert!(service.panic().await.unwrap().is_none());
        assert_eq!(paper.cancel_calls().await, 1);
    }

    #[tokio::test]
    async fn test_restart_after_liquidation_clears_halt() {
        let (service, _paper) = paper_service(vec![market_expiring_in(12 * 60)]).await;
        service.start().await.unwrap();
        service.halt().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.panic().await.unwrap().unwrap();
        assert_eq!(service.session().state(), SessionState::Liquidated);
        assert!(service.store().is_halted().await.unwrap());

        assert_ok!(service.start().await);

        assert_eq!(service.session().state(), SessionState::Running);
        assert!(!service.store().is_halted().await.unwrap());
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unfinished_liquidation_can_be_retried() {
        let sells_work = Arc::new(AtomicBool::new(false));
        let mut client = MockMarketClient::new();
        client.expect_cancel_all_orders().returning(|| Ok(0));
        let gate = sells_work.clone();
        client
            .expect_place_market_order()
            .returning(move |order: &MarketOrder| {
                if gate.load(Ordering::SeqCst) {
                    Ok(OrderOutcome::Filled(Fill {
                        order_id: "sell-1".into(),
                        price: dec!(0.44),
                        size: order.size,
                    }))
                } else {
                    Ok(OrderOutcome::Rejected {
                        reason: "empty book".into(),
                    })
                }
            });
        let service = TradingService::new(fast_config(), Arc::new(client), memory_store());
        service
            .store()
            .set_market(&market_expiring_in(12 * 60))
            .await
            .unwrap();
        service
            .store()
            .conditional_update(|p| p.with_buy(Outcome::Yes, dec!(20), dec!(0.45)))
            .await
            .unwrap();

        let report = service.panic().await.unwrap().unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(service.session().state(), SessionState::Liquidating);
        assert_err!(service.stop().await);

        sells_work.store(true, Ordering::SeqCst);
        let report = service.panic().await.unwrap().unwrap();

        assert!(report.is_clean());
        assert_eq!(report.yes_sold, dec!(20));
        assert_eq!(service.session().state(), SessionState::Liquidated);
        assert!(service.store().read().await.unwrap().is_flat());
        assert!(service.panic().await.unwrap().is_none());
        assert_ok!(service.stop().await);
    }

    #[tokio::test]
    async fn test_status_reports_derived_values() {
        let (service, _paper) = paper_service(vec![]).await;
        service
            .store()
            .conditional_update(|p| {
                p.with_buy(Outcome::Yes, dec!(100), dec!(0.45))
                    .with_buy(Outcome::No, dec!(40), dec!(0.52))
            })
            .await
            .unwrap();

        let status = service.status().await.unwrap();

        assert_eq!(status.state, SessionState::Stopped);
        assert_eq!(status.position.pair_cost, Some(dec!(0.97)));
        assert_eq!(status.position.locked_profit, dec!(1.20));
        assert_eq!(status.position.delta, dec!(60));
        assert!(status.latest_book.is_none());
    }
}

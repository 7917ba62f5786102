//! Delta rebalancing: buy the lagging side back toward a matched position.
//!
//! The rebalancer never sells and never buys the heavier side. It only pays
//! up to `cost_ceiling - avg_leading` for the lagging side, so a completed
//! pair still settles at or above cost.

use super::executor::{Execution, OrderExecutor};
use crate::config::RebalanceConfig;
use crate::errors::{ClientError, EngineError};
use crate::exchange::{MarketClient, MarketInfo, OrderBook, Outcome};
use crate::state::{Position, SessionControl, TradeSource};
use crate::supervisor::PeriodicTask;
use crate::utils::floor_to_tick;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why an imbalance was left alone this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    /// No asks on the lagging side
    NoAsk,
    /// Best ask above the affordable price
    AboveCeiling { ask: Decimal, max_price: Decimal },
    /// Not enough size at the best ask for the chunk
    ThinBook { depth: Decimal },
}

/// Action to take for rebalancing.
#[derive(Debug, Clone, PartialEq)]
pub enum RebalanceAction {
    /// Balanced within tolerance
    None,
    /// Buy the lagging side at the best ask
    BuyLagging {
        outcome: Outcome,
        quantity: Decimal,
        price: Decimal,
        max_price: Decimal,
    },
    /// Imbalanced, but buying now would break the cost ceiling or the book is thin
    Hold { outcome: Outcome, reason: HoldReason },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RebalanceOutcome {
    Inactive,
    Balanced,
    Held(HoldReason),
    Filled { outcome: Outcome, qty: Decimal },
    Rejected { reason: String },
}

pub struct DeltaRebalancer {
    config: RebalanceConfig,
    client: Arc<dyn MarketClient>,
    executor: OrderExecutor,
    session: SessionControl,
    data_timeout: Duration,
}

impl DeltaRebalancer {
    pub fn new(
        config: RebalanceConfig,
        client: Arc<dyn MarketClient>,
        executor: OrderExecutor,
        session: SessionControl,
        data_timeout: Duration,
    ) -> Self {
        Self {
            config,
            client,
            executor,
            session,
            data_timeout,
        }
    }

    /// Decide what to buy, if anything, to shrink the imbalance.
    pub fn analyze_position(
        &self,
        position: &Position,
        book: &OrderBook,
        tick_size: Decimal,
    ) -> RebalanceAction {
        let delta = position.delta();
        if delta.abs() < self.config.min_rebalance_qty {
            return RebalanceAction::None;
        }

        let Some(leading) = position.leading_side() else {
            return RebalanceAction::None;
        };
        let lagging = leading.opposite();
        let Some(avg_leading) = position.avg(leading) else {
            return RebalanceAction::None;
        };

        let max_price = floor_to_tick(self.config.cost_ceiling - avg_leading, tick_size);
        let quantity = delta.abs().min(self.config.chunk_size);

        debug!(
            %delta,
            %lagging,
            %avg_leading,
            %max_price,
            "Analyzing imbalance"
        );

        let Some(ask) = book.best_ask(lagging) else {
            return RebalanceAction::Hold {
                outcome: lagging,
                reason: HoldReason::NoAsk,
            };
        };
        if ask > max_price {
            return RebalanceAction::Hold {
                outcome: lagging,
                reason: HoldReason::AboveCeiling { ask, max_price },
            };
        }

        let depth = book.ask_depth(lagging, 1);
        if depth < quantity {
            return RebalanceAction::Hold {
                outcome: lagging,
                reason: HoldReason::ThinBook { depth },
            };
        }

        RebalanceAction::BuyLagging {
            outcome: lagging,
            quantity,
            price: ask,
            max_price,
        }
    }

    pub async fn tick(&self) -> Result<RebalanceOutcome, EngineError> {
        if !self.session.is_running() {
            return Ok(RebalanceOutcome::Inactive);
        }

        let store = self.executor.store();
        let position = store.read().await?;
        if position.delta().abs() < self.config.min_rebalance_qty {
            return Ok(RebalanceOutcome::Balanced);
        }

        let market: MarketInfo = store.market().await?.ok_or(EngineError::NoMarket)?;
        let book = tokio::time::timeout(self.data_timeout, self.client.get_order_book(&market))
            .await
            .map_err(|_| ClientError::Timeout(self.data_timeout))??;

        match self.analyze_position(&position, &book, market.tick_size) {
            RebalanceAction::None => Ok(RebalanceOutcome::Balanced),
            RebalanceAction::Hold { outcome, reason } => {
                debug!(%outcome, ?reason, delta = %position.delta(), "Rebalance deferred");
                Ok(RebalanceOutcome::Held(reason))
            }
            RebalanceAction::BuyLagging {
                outcome,
                quantity,
                price,
                max_price,
            } => {
                info!(
                    %outcome,
                    %quantity,
                    %price,
                    %max_price,
                    delta = %position.delta(),
                    "⚖️ Rebalancing lagging side"
                );
                let execution = self
                    .executor
                    .buy(TradeSource::Rebalancer, &market, outcome, price, quantity, false)
                    .await?;
                match execution {
                    Execution::Filled { fill, position, .. } => {
                        info!(%outcome, qty = %fill.size, delta = %position.delta(), "Rebalance filled");
                        Ok(RebalanceOutcome::Filled {
                            outcome,
                            qty: fill.size,
                        })
                    }
                    Execution::Rejected { reason } => {
                        warn!(%outcome, %reason, "Rebalance order rejected");
                        Ok(RebalanceOutcome::Rejected { reason })
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PeriodicTask for DeltaRebalancer {
    fn name(&self) -> &'static str {
        "rebalancer"
    }

    fn interval(&self) -> Duration {
        self.config.interval()
    }

    async fn run_once(&self) -> Result<(), EngineError> {
        self.tick().await.map(|_| ())
    }
}

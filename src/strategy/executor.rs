//! Order execution and fill accounting.
//!
//! Every order in the system goes through [`OrderExecutor`]: place with a
//! bounded timeout, then apply the confirmed fill through the store's
//! conditional update and append the trade record.

use crate::errors::{ClientError, EngineError};
use crate::exchange::{
    Fill, LimitOrder, MarketClient, MarketInfo, MarketOrder, OrderOutcome, OrderSide, Outcome,
};
use crate::risk::{RiskAlert, RiskAlertType};
use crate::state::{Position, PositionStore, RiskLevel, Trade, TradeAction, TradeSource};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// Result of an order the venue answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Filled {
        position: Position,
        fill: Fill,
        seq: i64,
    },
    Rejected {
        reason: String,
    },
}

impl Execution {
    pub fn is_filled(&self) -> bool {
        matches!(self, Execution::Filled { .. })
    }
}

/// Shared execution path for the scanner, the rebalancer and liquidation.
#[derive(Clone)]
pub struct OrderExecutor {
    client: Arc<dyn MarketClient>,
    store: PositionStore,
    order_timeout: Duration,
}

impl OrderExecutor {
    pub fn new(client: Arc<dyn MarketClient>, store: PositionStore, order_timeout: Duration) -> Self {
        Self {
            client,
            store,
            order_timeout,
        }
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        tokio::time::timeout(self.order_timeout, call)
            .await
            .map_err(|_| ClientError::Timeout(self.order_timeout))?
    }

    /// Buy `size` shares of `outcome` with a limit order at `price`.
    pub async fn buy(
        &self,
        source: TradeSource,
        market: &MarketInfo,
        outcome: Outcome,
        price: Decimal,
        size: Decimal,
        post_only: bool,
    ) -> Result<Execution, EngineError> {
        let order = LimitOrder {
            token_id: market.token_id(outcome).to_string(),
            outcome,
            side: OrderSide::Buy,
            price,
            size,
            post_only,
        };

        let fill = match self.bounded(self.client.place_limit_order(&order)).await? {
            OrderOutcome::Filled(fill) => fill,
            OrderOutcome::Rejected { reason } => {
                info!(%source, %outcome, %price, %size, %reason, "Buy order not filled");
                return Ok(Execution::Rejected { reason });
            }
        };

        let position = match self
            .store
            .conditional_update(|p| p.with_buy(outcome, fill.size, fill.price))
            .await
        {
            Ok(position) => position,
            Err(e) => {
                self.fill_not_recorded(outcome, &fill, &e.to_string());
                return Err(e.into());
            }
        };

        let trade = Trade::fill(
            source,
            TradeAction::Buy,
            outcome,
            fill.price,
            fill.size,
            fill.order_id.clone(),
            &position,
        );
        let seq = self.store.append_trade(&trade).await?;

        info!(
            %source,
            %outcome,
            order_id = %fill.order_id,
            price = %fill.price,
            qty = %fill.size,
            delta = %position.delta(),
            version = position.version,
            "✅ Buy filled"
        );

        Ok(Execution::Filled {
            position,
            fill,
            seq,
        })
    }

    /// Sell up to `size` shares of `outcome` at market.
    pub async fn market_sell(
        &self,
        source: TradeSource,
        market: &MarketInfo,
        outcome: Outcome,
        size: Decimal,
    ) -> Result<Execution, EngineError> {
        let order = MarketOrder {
            token_id: market.token_id(outcome).to_string(),
            outcome,
            side: OrderSide::Sell,
            size,
        };

        let fill = match self.bounded(self.client.place_market_order(&order)).await? {
            OrderOutcome::Filled(fill) => fill,
            OrderOutcome::Rejected { reason } => {
                warn!(%source, %outcome, %size, %reason, "Sell order not filled");
                return Ok(Execution::Rejected { reason });
            }
        };

        // Fn closure may run more than once; keep the last attempt's P&L.
        let realized = Mutex::new(Decimal::ZERO);
        let position = match self
            .store
            .conditional_update(|p| {
                let (next, pnl) = p.with_sale(outcome, fill.size, fill.price);
                if let Ok(mut slot) = realized.lock() {
                    *slot = pnl;
                }
                next
            })
            .await
        {
            Ok(position) => position,
            Err(e) => {
                self.fill_not_recorded(outcome, &fill, &e.to_string());
                return Err(e.into());
            }
        };
        let realized = realized.lock().map(|v| *v).unwrap_or(Decimal::ZERO);

        let trade = Trade::fill(
            source,
            TradeAction::Sell,
            outcome,
            fill.price,
            fill.size,
            fill.order_id.clone(),
            &position,
        )
        .with_realized_pnl(realized);
        let seq = self.store.append_trade(&trade).await?;

        info!(
            %source,
            %outcome,
            order_id = %fill.order_id,
            price = %fill.price,
            qty = %fill.size,
            realized_pnl = %realized,
            "💸 Sell filled"
        );

        Ok(Execution::Filled {
            position,
            fill,
            seq,
        })
    }

    /// Cancel every resting order; returns the number cancelled.
    pub async fn cancel_all(&self) -> Result<usize, ClientError> {
        self.bounded(self.client.cancel_all_orders()).await
    }

    fn fill_not_recorded(&self, outcome: Outcome, fill: &Fill, reason: &str) {
        error!(
            %outcome,
            order_id = %fill.order_id,
            qty = %fill.size,
            price = %fill.price,
            error = %reason,
            "Fill executed but position update failed"
        );
        RiskAlert::new(
            RiskAlertType::FillNotRecorded {
                order_id: fill.order_id.clone(),
                side: outcome,
                qty: fill.size,
                price: fill.price,
                error: reason.to_string(),
            },
            RiskLevel::Critical,
            format!(
                "{} {} filled at {} but the position was not updated",
                fill.size, outcome, fill.price
            ),
        )
        .with_metric("qty", fill.size)
        .with_metric("price", fill.price)
        .emit();
    }
}

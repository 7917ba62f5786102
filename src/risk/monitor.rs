//! Periodic composite risk evaluation.
//!
//! Four checks run every tick: unhedged delta, exit liquidity on the heavier
//! side, mark-to-market stop-loss and the settlement buffer. The composite
//! level is the worst finding. A CRITICAL level moves the session into
//! LIQUIDATING and starts the [`Liquidator`] on its own task.

use super::alert::{RiskAlert, RiskAlertType};
use super::liquidation::Liquidator;
use crate::config::RiskConfig;
use crate::errors::{ClientError, EngineError, StoreError};
use crate::exchange::{MarketClient, MarketInfo, OrderBook, Outcome};
use crate::state::{Position, PositionStore, RiskLevel, RiskMetrics, SessionControl, SessionState};
use crate::supervisor::PeriodicTask;
use crate::utils::safe_div;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A single failed check.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskFinding {
    DeltaBreach {
        delta: Decimal,
        limit: Decimal,
    },
    LiquidityShortfall {
        side: Outcome,
        depth: Decimal,
        required: Decimal,
    },
    StopLoss {
        loss_pct: Decimal,
        limit: Decimal,
    },
    SettlementBuffer {
        seconds_left: i64,
        buffer: i64,
    },
}

impl RiskFinding {
    pub fn level(&self) -> RiskLevel {
        match self {
            RiskFinding::DeltaBreach { .. } | RiskFinding::StopLoss { .. } => RiskLevel::Critical,
            RiskFinding::LiquidityShortfall { .. } => RiskLevel::High,
            RiskFinding::SettlementBuffer { .. } => RiskLevel::Medium,
        }
    }

    pub fn to_alert(&self) -> RiskAlert {
        let level = self.level();
        match *self {
            RiskFinding::DeltaBreach { delta, limit } => RiskAlert::new(
                RiskAlertType::DeltaBreach { delta, limit },
                level,
                format!("unhedged delta {} exceeds limit {}", delta, limit),
            )
            .with_metric("delta", delta),
            RiskFinding::LiquidityShortfall {
                side,
                depth,
                required,
            } => RiskAlert::new(
                RiskAlertType::LiquidityShortfall {
                    side,
                    depth,
                    required,
                },
                level,
                format!("{} bid depth {} below required {}", side, depth, required),
            )
            .with_metric("depth", depth),
            RiskFinding::StopLoss { loss_pct, limit } => RiskAlert::new(
                RiskAlertType::StopLoss { loss_pct, limit },
                level,
                format!("mark-to-market loss {} exceeds {}", loss_pct, limit),
            )
            .with_metric("loss_pct", loss_pct),
            RiskFinding::SettlementBuffer {
                seconds_left,
                buffer,
            } => RiskAlert::new(
                RiskAlertType::SettlementBuffer {
                    seconds_left,
                    buffer,
                },
                level,
                format!("{}s to settlement, accumulation halted", seconds_left),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskReport {
    pub metrics: RiskMetrics,
    pub findings: Vec<RiskFinding>,
}

impl RiskReport {
    pub fn level(&self) -> RiskLevel {
        self.metrics.level
    }

    fn has(&self, pred: impl Fn(&RiskFinding) -> bool) -> bool {
        self.findings.iter().any(pred)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorOutcome {
    Inactive,
    Evaluated(RiskReport),
    LiquidationStarted(RiskReport),
    /// Still LIQUIDATING with shares held
    AwaitingFlat,
    Liquidated,
}

/// Evaluate every check against one snapshot. Pure.
pub fn evaluate(
    config: &RiskConfig,
    position: &Position,
    book: &OrderBook,
    market: &MarketInfo,
    now: DateTime<Utc>,
) -> RiskReport {
    let mut findings = Vec::new();

    // Delta
    let delta = position.delta();
    if delta.abs() > config.max_unhedged_delta {
        findings.push(RiskFinding::DeltaBreach {
            delta,
            limit: config.max_unhedged_delta,
        });
    }

    // Exit liquidity on the heavier side
    let yes_bid_depth = book.bid_depth(Outcome::Yes, config.depth_levels);
    let no_bid_depth = book.bid_depth(Outcome::No, config.depth_levels);
    let heavier = position.leading_side().unwrap_or(Outcome::Yes);
    let heavier_qty = position.qty(heavier);
    if heavier_qty > Decimal::ZERO {
        let depth = match heavier {
            Outcome::Yes => yes_bid_depth,
            Outcome::No => no_bid_depth,
        };
        let required = config.liquidity_multiplier * heavier_qty;
        if depth < required {
            findings.push(RiskFinding::LiquidityShortfall {
                side: heavier,
                depth,
                required,
            });
        }
    }

    // Stop-loss at best bids; unpriceable while a held side has no bid
    let cost_basis = position.cost_basis();
    let bid_for = |outcome: Outcome| -> Option<Decimal> {
        if position.qty(outcome).is_zero() {
            Some(Decimal::ZERO)
        } else {
            book.best_bid(outcome)
        }
    };
    let mark_to_market = match (bid_for(Outcome::Yes), bid_for(Outcome::No)) {
        (Some(yes_bid), Some(no_bid)) if !position.is_flat() => {
            Some(position.mark_to_market(yes_bid, no_bid))
        }
        _ => None,
    };
    let unrealized_pnl = mark_to_market.map(|mtm| mtm - cost_basis);
    let loss_pct = match mark_to_market {
        Some(mtm) if cost_basis > Decimal::ZERO => Some(safe_div(cost_basis - mtm, cost_basis)),
        _ => None,
    };
    if let Some(loss_pct) = loss_pct {
        if loss_pct > config.bailout_stop_loss_pct {
            findings.push(RiskFinding::StopLoss {
                loss_pct,
                limit: config.bailout_stop_loss_pct,
            });
        }
    }

    // Settlement buffer
    let seconds_to_settlement = market.seconds_to_expiration(now);
    if seconds_to_settlement < config.settlement_buffer_seconds {
        findings.push(RiskFinding::SettlementBuffer {
            seconds_left: seconds_to_settlement,
            buffer: config.settlement_buffer_seconds,
        });
    }

    let level = findings
        .iter()
        .map(RiskFinding::level)
        .max()
        .unwrap_or(RiskLevel::Low);

    RiskReport {
        metrics: RiskMetrics {
            delta,
            delta_headroom: config.max_unhedged_delta - delta.abs(),
            pair_cost: position.pair_cost(),
            locked_profit: position.locked_profit(),
            cost_basis,
            mark_to_market,
            unrealized_pnl,
            loss_pct,
            yes_bid_depth,
            no_bid_depth,
            seconds_to_settlement,
            level,
            evaluated_at: now,
        },
        findings,
    }
}

fn metrics_map(metrics: &RiskMetrics) -> Result<HashMap<String, serde_json::Value>, StoreError> {
    match serde_json::to_value(metrics)? {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(StoreError::Malformed(format!("metrics serialized as {}", other))),
    }
}

pub struct RiskMonitor {
    config: RiskConfig,
    client: Arc<dyn MarketClient>,
    store: PositionStore,
    session: SessionControl,
    liquidator: Arc<Liquidator>,
    data_timeout: Duration,
}

impl RiskMonitor {
    pub fn new(
        config: RiskConfig,
        client: Arc<dyn MarketClient>,
        store: PositionStore,
        session: SessionControl,
        liquidator: Arc<Liquidator>,
        data_timeout: Duration,
    ) -> Self {
        Self {
            config,
            client,
            store,
            session,
            liquidator,
            data_timeout,
        }
    }

    pub async fn tick(&self) -> Result<MonitorOutcome, EngineError> {
        match self.session.state() {
            SessionState::Stopped | SessionState::Liquidated => return Ok(MonitorOutcome::Inactive),
            SessionState::Liquidating => {
                let position = self.store.read().await?;
                if position.is_flat() && self.session.mark_liquidated() {
                    info!("🏁 Position flat, session liquidated");
                    return Ok(MonitorOutcome::Liquidated);
                }
                return Ok(MonitorOutcome::AwaitingFlat);
            }
            SessionState::Running | SessionState::Halted => {}
        }

        let market = self.store.market().await?.ok_or(EngineError::NoMarket)?;
        let book = tokio::time::timeout(self.data_timeout, self.client.get_order_book(&market))
            .await
            .map_err(|_| ClientError::Timeout(self.data_timeout))??;
        let position = self.store.read().await?;

        let report = evaluate(&self.config, &position, &book, &market, Utc::now());
        self.store.merge_metrics(metrics_map(&report.metrics)?).await?;

        debug!(
            level = %report.level(),
            delta = %report.metrics.delta,
            loss_pct = ?report.metrics.loss_pct,
            seconds_to_settlement = report.metrics.seconds_to_settlement,
            "🛡️ Risk evaluated"
        );

        for finding in &report.findings {
            finding.to_alert().emit();
        }

        if report.has(|f| matches!(f, RiskFinding::SettlementBuffer { .. }))
            && !self.store.is_halted().await?
        {
            warn!(
                seconds_left = report.metrics.seconds_to_settlement,
                "Settlement buffer reached, halting accumulation"
            );
            self.store.set_halt(true).await?;
        }

        if report.level() == RiskLevel::Critical {
            let reason = report
                .findings
                .iter()
                .filter(|f| f.level() == RiskLevel::Critical)
                .map(|f| format!("{:?}", f))
                .collect::<Vec<_>>()
                .join("; ");
            if self.trigger_liquidation(reason) {
                return Ok(MonitorOutcome::LiquidationStarted(report));
            }
        }

        Ok(MonitorOutcome::Evaluated(report))
    }

    /// Enter LIQUIDATING and start the liquidator. Returns false if a
    /// liquidation was already underway or finished.
    pub fn trigger_liquidation(&self, reason: String) -> bool {
        if !self.session.begin_liquidation() {
            return false;
        }
        // Detached: the liquidation outlives this tick.
        drop(self.liquidator.clone().spawn(reason));
        true
    }
}

#[async_trait]
impl PeriodicTask for RiskMonitor {
    fn name(&self) -> &'static str {
        "risk"
    }

    fn interval(&self) -> Duration {
        self.config.interval()
    }

    async fn run_once(&self) -> Result<(), EngineError> {
        self.tick().await.map(|_| ())
    }
}

//! Trade log records and risk metrics.

use super::position::Position;
use crate::exchange::Outcome;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Component that produced a trade record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSource {
    Scanner,
    Rebalancer,
    Liquidation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Buy,
    Sell,
    CancelAll,
    Halt,
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($ty), other)),
                }
            }
        }
    };
}

str_enum!(TradeSource {
    Scanner => "scanner",
    Rebalancer => "rebalancer",
    Liquidation => "liquidation",
});

str_enum!(TradeAction {
    Buy => "buy",
    Sell => "sell",
    CancelAll => "cancel_all",
    Halt => "halt",
});

/// Append-only trade log entry.
///
/// `seq` is assigned by the store; records built in memory carry 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    pub source: TradeSource,
    pub action: TradeAction,
    pub side: Option<Outcome>,
    pub price: Decimal,
    pub qty: Decimal,
    pub cost: Decimal,
    pub order_id: Option<String>,
    pub succeeded: bool,
    pub note: Option<String>,
    pub realized_pnl: Option<Decimal>,
    // Position snapshot after application
    pub yes_qty: Decimal,
    pub no_qty: Decimal,
    pub delta: Decimal,
    pub pair_cost: Option<Decimal>,
    pub position_version: u64,
}

impl Trade {
    /// Record for a confirmed fill, snapshotting the resulting position.
    pub fn fill(
        source: TradeSource,
        action: TradeAction,
        side: Outcome,
        price: Decimal,
        qty: Decimal,
        order_id: String,
        after: &Position,
    ) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            source,
            action,
            side: Some(side),
            price,
            qty,
            cost: price * qty,
            order_id: Some(order_id),
            succeeded: true,
            note: None,
            realized_pnl: None,
            yes_qty: after.yes_qty,
            no_qty: after.no_qty,
            delta: after.delta(),
            pair_cost: after.pair_cost(),
            position_version: after.version,
        }
    }

    /// Audit record for a non-fill step (cancel, halt, failed order).
    pub fn audit(
        source: TradeSource,
        action: TradeAction,
        side: Option<Outcome>,
        succeeded: bool,
        note: Option<String>,
        current: &Position,
    ) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            source,
            action,
            side,
            price: Decimal::ZERO,
            qty: Decimal::ZERO,
            cost: Decimal::ZERO,
            order_id: None,
            succeeded,
            note,
            realized_pnl: None,
            yes_qty: current.yes_qty,
            no_qty: current.no_qty,
            delta: current.delta(),
            pair_cost: current.pair_cost(),
            position_version: current.version,
        }
    }

    pub fn with_realized_pnl(mut self, pnl: Decimal) -> Self {
        self.realized_pnl = Some(pnl);
        self
    }
}

/// Composite risk severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
            RiskLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Snapshot produced by each risk evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub delta: Decimal,
    /// `max_unhedged_delta - |delta|`; negative once breached
    pub delta_headroom: Decimal,
    pub pair_cost: Option<Decimal>,
    pub locked_profit: Decimal,
    pub cost_basis: Decimal,
    pub mark_to_market: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    /// Fractional mark-to-market loss (0.02 = 2%)
    pub loss_pct: Option<Decimal>,
    pub yes_bid_depth: Decimal,
    pub no_bid_depth: Decimal,
    pub seconds_to_settlement: i64,
    pub level: RiskLevel,
    pub evaluated_at: DateTime<Utc>,
}

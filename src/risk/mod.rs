//! Risk management for the paired position.
//!
//! - Composite risk evaluation (delta, exit liquidity, stop-loss, settlement)
//! - Emergency liquidation sequence
//! - Structured operator alerts

mod alert;
mod liquidation;
mod monitor;

pub use alert::{RiskAlert, RiskAlertType};
pub use liquidation::{LiquidationReport, Liquidator};
pub use monitor::{evaluate, MonitorOutcome, RiskFinding, RiskMonitor, RiskReport};

//! Session supervision.
//!
//! - Market selection for a new session
//! - Periodic loops with restart budgets and a health board
//! - The trading service behind the operator controls
//! - A connectivity check against the venue

mod check;
mod selection;
mod service;
mod tasks;

pub use check::{check_connection, ConnectionReport};
pub use selection::select_market;
pub use service::{PositionSummary, ServiceStatus, TradingService};
pub use tasks::{run_periodic, supervise, ComponentHealth, HealthBoard, PeriodicTask, RestartPolicy};

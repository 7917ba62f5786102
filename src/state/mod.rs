//! Shared trading state.
//!
//! - `Position` with its derived quantities
//! - `PositionStore`, the only way to mutate it
//! - trade log records and risk metrics
//! - the session state machine

mod position;
mod session;
mod store;
mod types;

pub use position::Position;
pub use session::{SessionControl, SessionState};
pub use store::{PositionStore, StateBackend};
pub use types::{RiskLevel, RiskMetrics, Trade, TradeAction, TradeSource};

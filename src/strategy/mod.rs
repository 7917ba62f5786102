//! Trading strategy implementation.
//!
//! Contains the core logic for:
//! - Opportunity scanning and paired accumulation
//! - Delta rebalancing of the lagging side
//! - Order execution and fill accounting

mod executor;
mod rebalancer;
mod scanner;

pub use executor::{Execution, OrderExecutor};
pub use rebalancer::{DeltaRebalancer, HoldReason, RebalanceAction, RebalanceOutcome};
pub use scanner::{Candidate, OpportunityScanner, ScanOutcome, ScannerParams, SkipReason};

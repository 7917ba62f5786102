//! # Paired Arb
//!
//! Paired YES/NO accumulation on short-dated binary markets: buy each side
//! while the combined average cost stays under a payout target, keep the
//! two legs balanced, and exit on risk breaches.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `errors`: Error types shared across components
//! - `exchange`: CLOB client (REST + WebSocket) and the paper client
//! - `persistence`: SQLite backend for the position store
//! - `state`: Position, trade log and session state machine
//! - `strategy`: Opportunity scanning, delta rebalancing and execution
//! - `risk`: Risk monitoring, alerts and liquidation
//! - `supervisor`: Market selection, task supervision and operator controls
//! - `utils`: Shared decimal helpers

pub mod config;
pub mod errors;
pub mod exchange;
pub mod persistence;
pub mod risk;
pub mod state;
pub mod strategy;
pub mod supervisor;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;

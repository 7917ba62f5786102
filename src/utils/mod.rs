//! Shared utilities.

pub mod decimal;

pub use decimal::{floor_to_tick, safe_div};

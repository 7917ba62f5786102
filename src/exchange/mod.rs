//! Binary-outcome CLOB integration.
//!
//! - REST client for markets, books and orders (HMAC-signed)
//! - WebSocket book stream with a local book
//! - Paper client that simulates fills for dry runs and tests

mod client;
mod paper;
mod traits;
mod types;
mod websocket;

pub use client::ClobClient;
pub use paper::PaperClient;
#[cfg(test)]
pub use traits::MockMarketClient;
pub use traits::MarketClient;
pub use types::*;
pub use websocket::{BookStream, LocalBook, StreamMessage};

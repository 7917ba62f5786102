//! Transactional position store.
//!
//! All position mutations go through [`PositionStore::conditional_update`],
//! a bounded optimistic-concurrency loop over a version-checked write.

use super::position::Position;
use super::types::Trade;
use crate::errors::StoreError;
use crate::exchange::MarketInfo;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage primitives the store is built on.
///
/// `compare_and_swap` must write `next` (with the version bumped by one) only
/// if the stored version still equals `expected_version`, atomically.
#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn read_position(&self) -> Result<Position, StoreError>;

    /// `Ok(None)` on a version mismatch; nothing is written in that case.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: &Position,
    ) -> Result<Option<Position>, StoreError>;

    /// Append and return the assigned sequence key.
    async fn append_trade(&self, trade: &Trade) -> Result<i64, StoreError>;

    /// Newest first.
    async fn recent_trades(&self, limit: usize) -> Result<Vec<Trade>, StoreError>;

    async fn trade_count(&self) -> Result<u64, StoreError>;

    async fn set_halt(&self, halted: bool) -> Result<(), StoreError>;

    async fn is_halted(&self) -> Result<bool, StoreError>;

    async fn market(&self) -> Result<Option<MarketInfo>, StoreError>;

    async fn set_market(&self, market: &MarketInfo) -> Result<(), StoreError>;

    async fn metrics(&self) -> Result<HashMap<String, serde_json::Value>, StoreError>;

    /// Upsert the given keys, leaving others untouched.
    async fn merge_metrics(
        &self,
        partial: HashMap<String, serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Wipe session data and zero the position without reusing its version.
    async fn reset(&self) -> Result<(), StoreError>;
}

/// Shared handle to the session's state.
#[derive(Clone)]
pub struct PositionStore {
    backend: Arc<dyn StateBackend>,
    max_attempts: u32,
}

impl PositionStore {
    pub fn new(backend: Arc<dyn StateBackend>, max_attempts: u32) -> Self {
        Self {
            backend,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Current position, including its version.
    pub async fn read(&self) -> Result<Position, StoreError> {
        self.backend.read_position().await
    }

    /// Apply `mutate` to the current position and write the result only if no
    /// other writer got in first.
    ///
    /// On a version mismatch the position is re-read and `mutate` re-run, up
    /// to the configured attempt limit; after that the update is abandoned
    /// with `StoreError::Conflict` and nothing is written. A mutation that
    /// yields a negative quantity or cost is refused with
    /// `StoreError::InvalidState`.
    pub async fn conditional_update<F>(&self, mutate: F) -> Result<Position, StoreError>
    where
        F: Fn(&Position) -> Position + Send + Sync,
    {
        for attempt in 1..=self.max_attempts {
            let current = self.backend.read_position().await?;

            let mut next = mutate(&current);
            next.validate().map_err(StoreError::InvalidState)?;
            next.version = current.version;
            next.updated_at = Utc::now();

            if let Some(stored) = self.backend.compare_and_swap(current.version, &next).await? {
                return Ok(stored);
            }

            debug!(attempt, version = current.version, "Position version conflict, retrying");
            tokio::task::yield_now().await;
        }

        warn!(attempts = self.max_attempts, "Conditional update abandoned");
        Err(StoreError::Conflict {
            attempts: self.max_attempts,
        })
    }

    pub async fn append_trade(&self, trade: &Trade) -> Result<i64, StoreError> {
        self.backend.append_trade(trade).await
    }

    pub async fn recent_trades(&self, limit: usize) -> Result<Vec<Trade>, StoreError> {
        self.backend.recent_trades(limit).await
    }

    pub async fn trade_count(&self) -> Result<u64, StoreError> {
        self.backend.trade_count().await
    }

    pub async fn set_halt(&self, halted: bool) -> Result<(), StoreError> {
        self.backend.set_halt(halted).await
    }

    pub async fn is_halted(&self) -> Result<bool, StoreError> {
        self.backend.is_halted().await
    }

    /// Stored market, re-validated on the way out.
    pub async fn market(&self) -> Result<Option<MarketInfo>, StoreError> {
        match self.backend.market().await? {
            Some(market) => {
                market
                    .validate()
                    .map_err(|e| StoreError::Malformed(e.to_string()))?;
                Ok(Some(market))
            }
            None => Ok(None),
        }
    }

    pub async fn set_market(&self, market: &MarketInfo) -> Result<(), StoreError> {
        market
            .validate()
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        self.backend.set_market(market).await
    }

    pub async fn metrics(&self) -> Result<HashMap<String, serde_json::Value>, StoreError> {
        self.backend.metrics().await
    }

    pub async fn merge_metrics(
        &self,
        partial: HashMap<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        self.backend.merge_metrics(partial).await
    }

    /// Operator-only wipe.
    pub async fn reset(&self) -> Result<(), StoreError> {
        warn!("Resetting position store");
        self.backend.reset().await
    }
}

//! SQLite persistence for the position store.
//!
//! Persists session state to survive restarts:
//! - The versioned position (singleton row)
//! - The trade log, pruned to a retention limit
//! - The session's market
//! - The halt flag
//! - The metrics map

use crate::errors::StoreError;
use crate::exchange::{MarketInfo, Outcome};
use crate::state::{Position, StateBackend, Trade, TradeAction, TradeSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const HALT_FLAG: &str = "halt";

/// SQLite-backed implementation of [`StateBackend`].
///
/// One connection behind a mutex; every operation is a short synchronous
/// statement, and the mutex is what makes the version check and the write a
/// single atomic step.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    trade_retention: usize,
}

fn parse_decimal(column: &str, raw: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(raw).map_err(|e| StoreError::Malformed(format!("{}={:?}: {}", column, raw, e)))
}

fn parse_optional_decimal(column: &str, raw: Option<String>) -> Result<Option<Decimal>, StoreError> {
    raw.map(|s| parse_decimal(column, &s)).transpose()
}

fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Malformed(format!("{}={:?}: {}", column, raw, e)))
}

/// Raw position row as stored.
struct PositionRow {
    yes_qty: String,
    no_qty: String,
    yes_cost: String,
    no_cost: String,
    version: i64,
    updated_at: String,
}

impl PositionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            yes_qty: row.get(0)?,
            no_qty: row.get(1)?,
            yes_cost: row.get(2)?,
            no_cost: row.get(3)?,
            version: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_position(self) -> Result<Position, StoreError> {
        let version = u64::try_from(self.version)
            .map_err(|_| StoreError::Malformed(format!("version={}", self.version)))?;
        let position = Position {
            yes_qty: parse_decimal("yes_qty", &self.yes_qty)?,
            no_qty: parse_decimal("no_qty", &self.no_qty)?,
            yes_cost: parse_decimal("yes_cost", &self.yes_cost)?,
            no_cost: parse_decimal("no_cost", &self.no_cost)?,
            version,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
        };
        position.validate().map_err(StoreError::Malformed)?;
        Ok(position)
    }
}

/// Raw trade row as stored.
struct TradeRow {
    seq: i64,
    timestamp: String,
    source: String,
    action: String,
    side: Option<String>,
    price: String,
    qty: String,
    cost: String,
    order_id: Option<String>,
    succeeded: bool,
    note: Option<String>,
    realized_pnl: Option<String>,
    yes_qty: String,
    no_qty: String,
    delta: String,
    pair_cost: Option<String>,
    position_version: i64,
}

impl TradeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            timestamp: row.get(1)?,
            source: row.get(2)?,
            action: row.get(3)?,
            side: row.get(4)?,
            price: row.get(5)?,
            qty: row.get(6)?,
            cost: row.get(7)?,
            order_id: row.get(8)?,
            succeeded: row.get(9)?,
            note: row.get(10)?,
            realized_pnl: row.get(11)?,
            yes_qty: row.get(12)?,
            no_qty: row.get(13)?,
            delta: row.get(14)?,
            pair_cost: row.get(15)?,
            position_version: row.get(16)?,
        })
    }

    fn into_trade(self) -> Result<Trade, StoreError> {
        let side = match self.side.as_deref() {
            None => None,
            Some("YES") => Some(Outcome::Yes),
            Some("NO") => Some(Outcome::No),
            Some(other) => return Err(StoreError::Malformed(format!("side={:?}", other))),
        };

        Ok(Trade {
            seq: self.seq,
            timestamp: parse_timestamp("timestamp", &self.timestamp)?,
            source: TradeSource::from_str(&self.source).map_err(StoreError::Malformed)?,
            action: TradeAction::from_str(&self.action).map_err(StoreError::Malformed)?,
            side,
            price: parse_decimal("price", &self.price)?,
            qty: parse_decimal("qty", &self.qty)?,
            cost: parse_decimal("cost", &self.cost)?,
            order_id: self.order_id,
            succeeded: self.succeeded,
            note: self.note,
            realized_pnl: parse_optional_decimal("realized_pnl", self.realized_pnl)?,
            yes_qty: parse_decimal("yes_qty", &self.yes_qty)?,
            no_qty: parse_decimal("no_qty", &self.no_qty)?,
            delta: parse_decimal("delta", &self.delta)?,
            pair_cost: parse_optional_decimal("pair_cost", self.pair_cost)?,
            position_version: u64::try_from(self.position_version).unwrap_or_default(),
        })
    }
}

impl SqliteBackend {
    /// Open (or create) the database and initialize the schema.
    pub fn new<P: AsRef<Path>>(db_path: P, trade_retention: usize) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path.as_ref()).map_err(|e| {
            StoreError::Unavailable(format!("failed to open {:?}: {}", db_path.as_ref(), e))
        })?;

        let backend = Self {
            conn: Mutex::new(conn),
            trade_retention: trade_retention.max(1),
        };
        backend.init_schema()?;

        info!("Position store initialized at {:?}", db_path.as_ref());
        Ok(backend)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection mutex poisoned".into()))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            -- Position (singleton row)
            CREATE TABLE IF NOT EXISTS position (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                yes_qty TEXT NOT NULL,
                no_qty TEXT NOT NULL,
                yes_cost TEXT NOT NULL,
                no_cost TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Trade log
            CREATE TABLE IF NOT EXISTS trades (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                source TEXT NOT NULL,
                action TEXT NOT NULL,
                side TEXT,
                price TEXT NOT NULL,
                qty TEXT NOT NULL,
                cost TEXT NOT NULL,
                order_id TEXT,
                succeeded INTEGER NOT NULL,
                note TEXT,
                realized_pnl TEXT,
                yes_qty TEXT NOT NULL,
                no_qty TEXT NOT NULL,
                delta TEXT NOT NULL,
                pair_cost TEXT,
                position_version INTEGER NOT NULL
            );

            -- Session market (singleton row, JSON payload)
            CREATE TABLE IF NOT EXISTS market (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS flags (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS metrics (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;

        conn.execute(
            r#"
            INSERT OR IGNORE INTO position (id, yes_qty, no_qty, yes_cost, no_cost, version, updated_at)
            VALUES (1, '0', '0', '0', '0', 0, ?1)
            "#,
            params![Utc::now().to_rfc3339()],
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    fn read_position_locked(conn: &Connection) -> Result<Position, StoreError> {
        let row = conn
            .query_row(
                "SELECT yes_qty, no_qty, yes_cost, no_cost, version, updated_at FROM position WHERE id = 1",
                [],
                PositionRow::from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::Malformed("position row missing".into()))?;
        row.into_position()
    }
}

#[async_trait]
impl StateBackend for SqliteBackend {
    async fn read_position(&self) -> Result<Position, StoreError> {
        let conn = self.lock()?;
        Self::read_position_locked(&conn)
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: &Position,
    ) -> Result<Option<Position>, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE position
            SET yes_qty = ?1, no_qty = ?2, yes_cost = ?3, no_cost = ?4,
                version = version + 1, updated_at = ?5
            WHERE id = 1 AND version = ?6
            "#,
            params![
                next.yes_qty.to_string(),
                next.no_qty.to_string(),
                next.yes_cost.to_string(),
                next.no_cost.to_string(),
                next.updated_at.to_rfc3339(),
                expected_version as i64,
            ],
        )?;

        if changed == 0 {
            return Ok(None);
        }
        Self::read_position_locked(&conn).map(Some)
    }

    async fn append_trade(&self, trade: &Trade) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO trades (timestamp, source, action, side, price, qty, cost, order_id,
                                succeeded, note, realized_pnl, yes_qty, no_qty, delta, pair_cost,
                                position_version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
            params![
                trade.timestamp.to_rfc3339(),
                trade.source.as_str(),
                trade.action.as_str(),
                trade.side.map(|s| s.as_str()),
                trade.price.to_string(),
                trade.qty.to_string(),
                trade.cost.to_string(),
                trade.order_id,
                trade.succeeded,
                trade.note,
                trade.realized_pnl.map(|d| d.to_string()),
                trade.yes_qty.to_string(),
                trade.no_qty.to_string(),
                trade.delta.to_string(),
                trade.pair_cost.map(|d| d.to_string()),
                trade.position_version as i64,
            ],
        )?;
        let seq = tx.last_insert_rowid();

        tx.execute(
            "DELETE FROM trades WHERE seq NOT IN (SELECT seq FROM trades ORDER BY seq DESC LIMIT ?1)",
            params![self.trade_retention as i64],
        )?;
        tx.commit()?;

        Ok(seq)
    }

    async fn recent_trades(&self, limit: usize) -> Result<Vec<Trade>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT seq, timestamp, source, action, side, price, qty, cost, order_id, succeeded,
                   note, realized_pnl, yes_qty, no_qty, delta, pair_cost, position_version
            FROM trades
            ORDER BY seq DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt
            .query_map(params![limit as i64], TradeRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(TradeRow::into_trade).collect()
    }

    async fn trade_count(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    async fn set_halt(&self, halted: bool) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO flags (name, value) VALUES (?1, ?2) ON CONFLICT(name) DO UPDATE SET value = ?2",
            params![HALT_FLAG, halted],
        )?;
        Ok(())
    }

    async fn is_halted(&self) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let value: Option<bool> = conn
            .query_row(
                "SELECT value FROM flags WHERE name = ?1",
                params![HALT_FLAG],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(false))
    }

    async fn market(&self) -> Result<Option<MarketInfo>, StoreError> {
        let conn = self.lock()?;
        let payload: Option<String> = conn
            .query_row("SELECT payload FROM market WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(StoreError::from))
            .transpose()
    }

    async fn set_market(&self, market: &MarketInfo) -> Result<(), StoreError> {
        let payload = serde_json::to_string(market)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO market (id, payload) VALUES (1, ?1) ON CONFLICT(id) DO UPDATE SET payload = ?1",
            params![payload],
        )?;
        Ok(())
    }

    async fn metrics(&self) -> Result<HashMap<String, serde_json::Value>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key, value FROM metrics")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(key, raw)| Ok::<_, StoreError>((key, serde_json::from_str(&raw)?)))
            .collect()
    }

    async fn merge_metrics(
        &self,
        partial: HashMap<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        for (key, value) in &partial {
            tx.execute(
                "INSERT INTO metrics (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![key, value.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn reset(&self) -> Result<(), StoreError> {
        warn!("Clearing all persisted session data");
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(
            r#"
            DELETE FROM trades;
            DELETE FROM market;
            DELETE FROM flags;
            DELETE FROM metrics;
            "#,
        )?;
        tx.execute(
            r#"
            UPDATE position
            SET yes_qty = '0', no_qty = '0', yes_cost = '0', no_cost = '0',
                version = version + 1, updated_at = ?1
            WHERE id = 1
            "#,
            params![Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }
}

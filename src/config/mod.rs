//! Configuration management for the paired arbitrage engine.
//!
//! Loads settings from a `.env` file, an optional `config.toml` and
//! `PAIRARB__SECTION__KEY` environment variables.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// CLOB endpoints and credentials
    #[serde(default)]
    pub clob: ClobConfig,
    /// Accumulation (scanner) parameters
    #[serde(default)]
    pub trading: TradingConfig,
    /// Delta rebalancer parameters
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    /// Risk limits
    #[serde(default)]
    pub risk: RiskConfig,
    /// Position store settings
    #[serde(default)]
    pub store: StoreConfig,
    /// Task supervision
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Market selection criteria
    #[serde(default)]
    pub market: MarketSelectionConfig,
    /// Execution parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClobConfig {
    /// REST base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// WebSocket URL for the book stream
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// API key for authenticated endpoints
    #[serde(default)]
    pub api_key: String,
    /// Secret used for HMAC request signatures
    #[serde(default)]
    pub api_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Scanner tick interval
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Minimum edge below 1.00 required on the pair cost (0.02 = target 0.98)
    #[serde(default = "default_profit_margin")]
    pub profit_margin: Decimal,
    /// Shares per accumulation order
    #[serde(default = "default_trade_size")]
    pub trade_size: Decimal,
    /// Maximum shares held on either side
    #[serde(default = "default_max_position_size")]
    pub max_position_size: Decimal,
    /// Book levels counted in the hedge depth check (1 = top of book)
    #[serde(default = "default_depth_levels")]
    pub depth_levels: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Rebalancer tick interval
    #[serde(default = "default_rebalance_interval_ms")]
    pub interval_ms: u64,
    /// Maximum shares bought per rebalance tick
    #[serde(default = "default_chunk_size")]
    pub chunk_size: Decimal,
    /// Highest acceptable pair cost when catching up the lagging side
    #[serde(default = "default_cost_ceiling")]
    pub cost_ceiling: Decimal,
    /// Imbalances below this are ignored
    #[serde(default = "default_min_rebalance_qty")]
    pub min_rebalance_qty: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Risk monitor tick interval
    #[serde(default = "default_risk_interval_secs")]
    pub interval_secs: u64,
    /// Largest tolerated |yes_qty - no_qty|
    #[serde(default = "default_max_unhedged_delta")]
    pub max_unhedged_delta: Decimal,
    /// Required book depth as a multiple of the quantity at stake
    #[serde(default = "default_liquidity_multiplier")]
    pub liquidity_multiplier: Decimal,
    /// Mark-to-market loss fraction that triggers liquidation (0.02 = 2%)
    #[serde(default = "default_bailout_stop_loss_pct")]
    pub bailout_stop_loss_pct: Decimal,
    /// No new accumulation this close to settlement
    #[serde(default = "default_settlement_buffer_seconds")]
    pub settlement_buffer_seconds: i64,
    /// Book levels counted in the exit liquidity check (1 = top of book)
    #[serde(default = "default_depth_levels")]
    pub depth_levels: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path (":memory:" for an ephemeral store)
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Conditional update attempts before giving up with a conflict
    #[serde(default = "default_max_update_attempts")]
    pub max_update_attempts: u32,
    /// Newest trades kept in the log
    #[serde(default = "default_trade_log_retention")]
    pub trade_log_retention: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Restarts allowed per loop before it is marked degraded
    #[serde(default = "default_max_task_restarts")]
    pub max_task_restarts: u32,
    /// Delay before restarting a failed loop
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
    /// Healthy run length after which a loop's restart count starts over
    #[serde(default = "default_restart_stable_secs")]
    pub restart_stable_secs: u64,
    /// Run the WebSocket book stream alongside the loops
    #[serde(default)]
    pub stream_enabled: bool,
    /// Cap on the stream reconnect backoff
    #[serde(default = "default_stream_backoff_max_secs")]
    pub stream_backoff_max_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSelectionConfig {
    /// Question must mention one of these
    #[serde(default = "default_market_keywords")]
    pub keywords: Vec<String>,
    /// Earliest acceptable expiry, in minutes from now
    #[serde(default = "default_min_minutes_to_expiry")]
    pub min_minutes_to_expiry: i64,
    /// Latest acceptable expiry, in minutes from now
    #[serde(default = "default_max_minutes_to_expiry")]
    pub max_minutes_to_expiry: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Bound on every order placement / cancel call
    #[serde(default = "default_order_timeout")]
    pub order_timeout_secs: u64,
    /// Bound on every market data call
    #[serde(default = "default_data_timeout_ms")]
    pub data_timeout_ms: u64,
}

// Default value functions
fn default_api_url() -> String {
    "https://clob.polymarket.com".to_string()
}

fn default_ws_url() -> String {
    "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string()
}

fn default_scan_interval_ms() -> u64 {
    100
}

fn default_profit_margin() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_trade_size() -> Decimal {
    Decimal::new(10, 0)
}

fn default_max_position_size() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_depth_levels() -> usize {
    1
}

fn default_rebalance_interval_ms() -> u64 {
    1000
}

fn default_chunk_size() -> Decimal {
    Decimal::new(10, 0)
}

fn default_cost_ceiling() -> Decimal {
    Decimal::ONE // break-even; anything above locks in a loss
}

fn default_min_rebalance_qty() -> Decimal {
    Decimal::ONE
}

fn default_risk_interval_secs() -> u64 {
    5
}

fn default_max_unhedged_delta() -> Decimal {
    Decimal::new(50, 0)
}

fn default_liquidity_multiplier() -> Decimal {
    Decimal::new(3, 0) // 3.0x
}

fn default_bailout_stop_loss_pct() -> Decimal {
    Decimal::new(2, 2) // 0.02 (2%)
}

fn default_settlement_buffer_seconds() -> i64 {
    120
}

fn default_db_path() -> String {
    "data/paired_arb.db".to_string()
}

fn default_max_update_attempts() -> u32 {
    5
}

fn default_trade_log_retention() -> usize {
    1000
}

fn default_max_task_restarts() -> u32 {
    3
}

fn default_restart_stable_secs() -> u64 {
    300
}

fn default_restart_backoff_ms() -> u64 {
    1000
}

fn default_stream_backoff_max_secs() -> u64 {
    30
}

fn default_market_keywords() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string()]
}

fn default_min_minutes_to_expiry() -> i64 {
    10
}

fn default_max_minutes_to_expiry() -> i64 {
    15
}

fn default_order_timeout() -> u64 {
    5
}

fn default_data_timeout_ms() -> u64 {
    2000
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("PAIRARB"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.trading.profit_margin >= Decimal::ZERO && self.trading.profit_margin < Decimal::ONE,
            "profit_margin must be in [0, 1)"
        );

        anyhow::ensure!(
            self.trading.trade_size > Decimal::ZERO,
            "trade_size must be positive"
        );

        anyhow::ensure!(
            self.trading.max_position_size >= self.trading.trade_size,
            "max_position_size must be at least trade_size"
        );

        anyhow::ensure!(
            self.rebalance.chunk_size > Decimal::ZERO,
            "chunk_size must be positive"
        );

        anyhow::ensure!(
            self.rebalance.cost_ceiling > Decimal::ZERO,
            "cost_ceiling must be positive"
        );

        anyhow::ensure!(
            self.risk.max_unhedged_delta >= Decimal::ZERO,
            "max_unhedged_delta must not be negative"
        );

        anyhow::ensure!(
            self.risk.bailout_stop_loss_pct > Decimal::ZERO
                && self.risk.bailout_stop_loss_pct <= Decimal::ONE,
            "bailout_stop_loss_pct must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.settlement_buffer_seconds >= 0,
            "settlement_buffer_seconds must not be negative"
        );

        anyhow::ensure!(
            self.trading.depth_levels >= 1 && self.risk.depth_levels >= 1,
            "depth_levels must be at least 1"
        );

        anyhow::ensure!(
            self.store.max_update_attempts >= 1,
            "max_update_attempts must be at least 1"
        );

        anyhow::ensure!(
            self.market.min_minutes_to_expiry <= self.market.max_minutes_to_expiry,
            "market expiry window is inverted"
        );

        anyhow::ensure!(
            self.trading.scan_interval_ms > 0
                && self.rebalance.interval_ms > 0
                && self.risk.interval_secs > 0,
            "loop intervals must be positive"
        );

        Ok(())
    }
}

impl TradingConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Highest pair cost that still earns `profit_margin`.
    pub fn target_cost(&self) -> Decimal {
        Decimal::ONE - self.profit_margin
    }
}

impl RebalanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl RiskConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl SupervisorConfig {
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn restart_stable(&self) -> Duration {
        Duration::from_secs(self.restart_stable_secs)
    }
}

impl ExecutionConfig {
    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_millis(self.data_timeout_ms)
    }
}

impl Default for ClobConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            ws_url: default_ws_url(),
            api_key: String::new(),
            api_secret: String::new(),
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            profit_margin: default_profit_margin(),
            trade_size: default_trade_size(),
            max_position_size: default_max_position_size(),
            depth_levels: default_depth_levels(),
        }
    }
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_rebalance_interval_ms(),
            chunk_size: default_chunk_size(),
            cost_ceiling: default_cost_ceiling(),
            min_rebalance_qty: default_min_rebalance_qty(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_risk_interval_secs(),
            max_unhedged_delta: default_max_unhedged_delta(),
            liquidity_multiplier: default_liquidity_multiplier(),
            bailout_stop_loss_pct: default_bailout_stop_loss_pct(),
            settlement_buffer_seconds: default_settlement_buffer_seconds(),
            depth_levels: default_depth_levels(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_update_attempts: default_max_update_attempts(),
            trade_log_retention: default_trade_log_retention(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_task_restarts: default_max_task_restarts(),
            restart_backoff_ms: default_restart_backoff_ms(),
            restart_stable_secs: default_restart_stable_secs(),
            stream_enabled: false,
            stream_backoff_max_secs: default_stream_backoff_max_secs(),
        }
    }
}

impl Default for MarketSelectionConfig {
    fn default() -> Self {
        Self {
            keywords: default_market_keywords(),
            min_minutes_to_expiry: default_min_minutes_to_expiry(),
            max_minutes_to_expiry: default_max_minutes_to_expiry(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_timeout_secs: default_order_timeout(),
            data_timeout_ms: default_data_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_target_cost() {
        let config = Config::default();
        assert_eq!(config.trading.target_cost(), dec!(0.98));
        assert_eq!(config.risk.max_unhedged_delta, dec!(50));
        assert_eq!(config.risk.settlement_buffer_seconds, 120);
        assert_eq!(config.trading.depth_levels, 1);
        assert_eq!(config.risk.depth_levels, 1);
    }

    #[test]
    fn test_invalid_stop_loss_rejected() {
        let mut config = Config::default();
        config.risk.bailout_stop_loss_pct = dec!(2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_expiry_window_rejected() {
        let mut config = Config::default();
        config.market.min_minutes_to_expiry = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_depth_levels_rejected() {
        let mut config = Config::default();
        config.risk.depth_levels = 0;
        assert!(config.validate().is_err());
    }
}

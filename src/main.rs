//! Paired Arb - Main Entry Point
//!
//! Paper trading by default; set `LIVE_TRADING=true` to send real orders.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use paired_arb::config::Config;
use paired_arb::exchange::{ClobClient, MarketClient, Outcome, PaperClient};
use paired_arb::persistence::SqliteBackend;
use paired_arb::state::PositionStore;
use paired_arb::supervisor::{check_connection, ServiceStatus, TradingService};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Paired Arb CLI
#[derive(Parser)]
#[command(name = "paired-arb")]
#[command(version, about = "Paired YES/NO arbitrage on binary markets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show session status from persisted state
    Status {
        /// Path to SQLite database (default: from config)
        #[arg(short, long)]
        db: Option<String>,

        /// Show the recent trade log
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the persisted position as JSON
    Position {
        /// Path to SQLite database (default: from config)
        #[arg(short, long)]
        db: Option<String>,
    },

    /// Check connectivity: list markets and fetch a book
    Check,

    /// Wipe position, trade log, market and halt flag
    Reset {
        /// Path to SQLite database (default: from config)
        #[arg(short, long)]
        db: Option<String>,

        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },
}

/// Trading mode: Live (real money) or Paper (simulated fills).
#[derive(Debug, Clone, Copy, PartialEq)]
enum TradingMode {
    Live,
    Paper,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Some(Commands::Status { db, verbose }) => {
            let store = open_store(&config, db.as_deref())?;
            return show_status(&store, verbose).await;
        }
        Some(Commands::Position { db }) => {
            let store = open_store(&config, db.as_deref())?;
            let position = store.read().await?;
            println!("{}", serde_json::to_string_pretty(&position)?);
            return Ok(());
        }
        Some(Commands::Check) => {
            return run_check(&config).await;
        }
        Some(Commands::Reset { db, yes }) => {
            if !yes {
                println!("Refusing to reset without --yes");
                return Ok(());
            }
            let store = open_store(&config, db.as_deref())?;
            store.reset().await?;
            println!("✅ Store reset");
            return Ok(());
        }
        None => {
            // Default: run trading mode
        }
    }

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║          Paired Arb v{} - Binary Market Arbitrage        ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let trading_mode = if std::env::var("LIVE_TRADING").unwrap_or_default() == "true" {
        warn!("⚠️  LIVE TRADING MODE - Real money at risk!");
        TradingMode::Live
    } else {
        info!("📝 PAPER TRADING MODE - Simulated fills");
        TradingMode::Paper
    };

    log_config(&config);

    let clob = Arc::new(ClobClient::new(&config.clob).context("Failed to create CLOB client")?);
    if config.clob.api_key.is_empty() {
        info!("⚠️  No API keys provided. Market data only.");
        if trading_mode == TradingMode::Live {
            anyhow::bail!("LIVE_TRADING requires clob.api_key and clob.api_secret");
        }
    }
    let client: Arc<dyn MarketClient> = match trading_mode {
        TradingMode::Live => clob,
        TradingMode::Paper => Arc::new(PaperClient::with_source(clob)),
    };

    let store = open_store(&config, None)?;
    let resumed = store.read().await?;
    if resumed.is_flat() {
        info!("📂 [PERSISTENCE] No open position, starting fresh");
    } else {
        info!(
            yes_qty = %resumed.yes_qty,
            no_qty = %resumed.no_qty,
            version = resumed.version,
            "📂 [PERSISTENCE] Resuming persisted position"
        );
    }

    let service = TradingService::new(config.clone(), client, store);

    // Shutdown signal
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let market = service.start().await.context("Failed to start trading session")?;
    info!(
        "🎯 Trading {} ({} min to expiry)",
        market.question,
        market.seconds_to_expiration(chrono::Utc::now()) / 60
    );
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut last_status_log = tokio::time::Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        ticker.tick().await;
        if last_status_log.elapsed() < STATUS_LOG_INTERVAL {
            continue;
        }
        last_status_log = tokio::time::Instant::now();
        match service.status().await {
            Ok(status) => log_status(&status),
            Err(e) => warn!(error = %e, "Status unavailable"),
        }
    }

    info!("🛑 Shutting down...");
    if let Err(e) = service.stop().await {
        error!(error = %e, "Stop refused");
    }
    if let Ok(status) = service.status().await {
        log_status(&status);
    }
    info!("👋 Goodbye");

    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "paired-arb.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("paired_arb=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Open the store, creating the database directory if needed.
fn open_store(config: &Config, db: Option<&str>) -> Result<PositionStore> {
    let path = db.unwrap_or(&config.store.db_path);
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
    }
    let backend = SqliteBackend::new(path, config.store.trade_log_retention)
        .with_context(|| format!("Failed to open position store at {}", path))?;
    Ok(PositionStore::new(
        Arc::new(backend),
        config.store.max_update_attempts,
    ))
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Markets: {:?}", config.market.keywords);
    info!(
        "   Expiry Window: {}-{} min",
        config.market.min_minutes_to_expiry, config.market.max_minutes_to_expiry
    );
    info!(
        "   Target Pair Cost: {} (margin {:.1}%)",
        config.trading.target_cost(),
        config.trading.profit_margin * dec!(100)
    );
    info!("   Trade Size: {}", config.trading.trade_size);
    info!("   Max Position: {}", config.trading.max_position_size);
    info!("   Max Unhedged Delta: {}", config.risk.max_unhedged_delta);
    info!(
        "   Stop Loss: {:.1}%",
        config.risk.bailout_stop_loss_pct * dec!(100)
    );
    info!(
        "   Settlement Buffer: {}s",
        config.risk.settlement_buffer_seconds
    );
    info!(
        "   Rebalance: chunk {} / ceiling {}",
        config.rebalance.chunk_size, config.rebalance.cost_ceiling
    );
}

/// Periodic status tree.
fn log_status(status: &ServiceStatus) {
    let p = &status.position;
    info!("📊 Status: {} {}", status.state, if status.halted { "(halted)" } else { "" });
    info!("   ├─ YES: {} (avg {})", p.yes_qty, fmt_opt(p.avg_yes));
    info!("   ├─ NO:  {} (avg {})", p.no_qty, fmt_opt(p.avg_no));
    info!("   ├─ Delta: {}", p.delta);
    info!("   ├─ Pair Cost: {}", fmt_opt(p.pair_cost));
    info!(
        "   ├─ Locked: {} pairs, profit ${:.4}",
        p.locked_pairs, p.locked_profit
    );
    info!("   ├─ Trades: {}", status.trade_count);
    for (component, health) in &status.components {
        info!("   ├─ {}: {:?}", component, health);
    }
    info!("   └─ Cost Basis: ${:.2}", p.cost_basis);
}

fn fmt_opt(value: Option<Decimal>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.4}", v))
}

/// Show session status from persisted state.
async fn show_status(store: &PositionStore, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              PAIRED ARB STATUS                             ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let position = store.read().await?;
    let halted = store.is_halted().await?;

    match store.market().await? {
        Some(market) => {
            println!("\n🎯 Market");
            println!("   ├─ {}", market.question);
            println!("   ├─ Id:        {}", market.market_id);
            println!(
                "   └─ Expires:   {}",
                market.expiration.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        None => println!("\n❌ No market selected yet."),
    }

    println!("\n📊 Position (v{})", position.version);
    println!("   ├─ YES:        {} @ {}", position.yes_qty, fmt_opt(position.avg_yes()));
    println!("   ├─ NO:         {} @ {}", position.no_qty, fmt_opt(position.avg_no()));
    println!("   ├─ Delta:      {}", position.delta());
    println!("   ├─ Pair Cost:  {}", fmt_opt(position.pair_cost()));
    println!("   ├─ Locked:     {} pairs", position.locked_pairs());
    println!("   ├─ Profit:     ${:.4}", position.locked_profit());
    println!("   ├─ Cost Basis: ${:.2}", position.cost_basis());
    println!("   └─ Halted:     {}", if halted { "yes" } else { "no" });

    let metrics = store.metrics().await?;
    if !metrics.is_empty() {
        println!("\n🛡️ Risk Metrics");
        let mut keys: Vec<_> = metrics.keys().collect();
        keys.sort();
        for key in keys {
            println!("   ├─ {}: {}", key, metrics[key]);
        }
    }

    println!("\n📈 Activity");
    println!("   └─ Trades Logged: {}", store.trade_count().await?);

    if verbose {
        let trades = store.recent_trades(20).await?;
        if !trades.is_empty() {
            println!("\n📜 Recent Trades");
            for trade in &trades {
                println!(
                    "   ├─ {} {:?} {:?} {} {} @ {} {}",
                    trade.timestamp.format("%H:%M:%S"),
                    trade.source,
                    trade.action,
                    trade.side.map(|s| s.as_str()).unwrap_or("-"),
                    trade.qty,
                    trade.price,
                    if trade.succeeded { "✅" } else { "❌" }
                );
            }
        }
    }

    println!();
    Ok(())
}

/// List markets and fetch one book through the configured client.
async fn run_check(config: &Config) -> Result<()> {
    println!("🔌 Checking {}", config.clob.api_url);
    let client = ClobClient::new(&config.clob).context("Failed to create CLOB client")?;
    let report = check_connection(&client, config)
        .await
        .context("Connectivity check failed")?;
    println!("   ├─ Markets matching {:?}: {}", config.market.keywords, report.markets_listed);

    let (Some(market), Some(book)) = (&report.market, &report.book) else {
        println!("   └─ ❌ No market to fetch a book for");
        return Ok(());
    };
    println!(
        "   ├─ Market: {} ({}){}",
        market.question,
        market.market_id,
        if report.tradable { "" } else { " outside expiry window" }
    );
    for outcome in [Outcome::Yes, Outcome::No] {
        println!(
            "   ├─ {}: bid {} / ask {}",
            outcome,
            fmt_opt(book.best_bid(outcome)),
            fmt_opt(book.best_ask(outcome))
        );
    }
    println!(
        "   └─ ✅ Connected{}",
        if config.clob.api_key.is_empty() { " (no API key, market data only)" } else { "" }
    );
    Ok(())
}

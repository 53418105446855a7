//! Tick Rebalancer - Main Entry Point
//!
//! Runs the grid/Shannon controller against the built-in paper gateway, plus
//! one-shot commands for manual trades and inspecting saved state.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tick_rebalancer::config::{Config, StrategyKind};
use tick_rebalancer::engine::TradeEngine;
use tick_rebalancer::exchange::{MarketCalendar, OrderSide, PaperGateway, TradingGateway};
use tick_rebalancer::frame::{Orchestrator, Shutdown, Supervisor};
use tick_rebalancer::orders::{AccountBook, OrderLedger};
use tick_rebalancer::persistence::SnapshotStore;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Tick Rebalancer CLI
#[derive(Parser)]
#[command(name = "tick-rebalancer")]
#[command(version, about = "Grid and Shannon rebalancing controller")]
struct Cli {
    /// Configuration file (TOML), extension optional
    #[arg(short, long, global = true, default_value = "config")]
    config: String,

    /// Write log lines as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading controller until interrupted (default)
    Run {
        /// Override the configured market name
        #[arg(short, long)]
        market: Option<String>,

        /// Override the configured strategy (grid | shannon)
        #[arg(short, long)]
        strategy: Option<StrategyKind>,
    },

    /// Buy with segmented market orders
    Buy { code: String, volume: Decimal },

    /// Sell with segmented market orders
    Sell { code: String, volume: Decimal },

    /// Show account balance and holdings
    Positions,

    /// Show working orders at the broker
    Orders,

    /// Cancel every working order
    CancelAll,

    /// Show the last saved snapshot
    Status {
        /// Show per-instrument detail
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs)?;

    let mut config = Config::load_from(&cli.config)?;

    match cli.command {
        Some(Commands::Status { verbose }) => show_status(&config, verbose),
        Some(Commands::Buy { code, volume }) => manual_order(&config, &code, OrderSide::Buy, volume).await,
        Some(Commands::Sell { code, volume }) => manual_order(&config, &code, OrderSide::Sell, volume).await,
        Some(Commands::Positions) => show_positions(&config).await,
        Some(Commands::Orders) => show_orders(&config).await,
        Some(Commands::CancelAll) => cancel_all(&config).await,
        Some(Commands::Run { market, strategy }) => {
            if let Some(market) = market {
                config.frame.market = market;
            }
            if let Some(strategy) = strategy {
                config.frame.strategy = strategy;
            }
            run(config).await
        }
        None => run(config).await,
    }
}

/// Paper gateway, ledger and engine wired together and connected.
async fn connect(config: &Config) -> Result<(TradeEngine, Arc<PaperGateway>)> {
    let ledger = Arc::new(OrderLedger::new(Arc::new(AccountBook::new())));
    let gateway = Arc::new(PaperGateway::new(
        config.paper.clone(),
        Arc::clone(&ledger),
        MarketCalendar::new(config.pool()),
    ));
    gateway.open_api().await.context("Failed to connect to the paper gateway")?;
    let engine = TradeEngine::new(gateway.clone(), ledger, config);
    engine.refresh_account().await?;
    engine.refresh_quotes().await?;
    Ok((engine, gateway))
}

async fn run(config: Config) -> Result<()> {
    config.validate()?;

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║           Tick Rebalancer v{} - Paper Trading            ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    log_config(&config);

    let ledger = Arc::new(OrderLedger::new(Arc::new(AccountBook::new())));
    let gateway = Arc::new(PaperGateway::new(
        config.paper.clone(),
        Arc::clone(&ledger),
        MarketCalendar::new(config.pool()),
    ));
    let ticker = gateway.spawn_ticker();

    let store = SnapshotStore::open(config.frame.snapshot_path())?;
    let engine = TradeEngine::new(gateway, ledger, &config);
    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let orchestrator = Orchestrator::new(config, engine, store, shutdown.clone());
    let mut supervisor = Supervisor::new(orchestrator, shutdown);

    info!("🚀 Starting supervisor...");
    supervisor.run_forever().await;
    ticker.abort();
    Ok(())
}

/// Ctrl-C (and SIGTERM on unix) request a graceful shutdown.
fn spawn_signal_handler(shutdown: Shutdown) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
                    tokio::signal::ctrl_c().await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await.ok();

        info!("🛑 Shutdown signal received");
        shutdown.trigger();
    });
}

async fn manual_order(config: &Config, code: &str, side: OrderSide, volume: Decimal) -> Result<()> {
    let (engine, gateway) = connect(config).await?;
    anyhow::ensure!(
        gateway.is_continuous_bidding(code),
        "{code} is not in continuous bidding now"
    );
    let (balance_delta, holdings_delta) = engine.smart_market_order(code, side, volume).await?;
    println!("{side} {code}: holdings {holdings_delta:+}, balance {balance_delta:+.2}");
    gateway.close_api().await?;
    Ok(())
}

async fn show_positions(config: &Config) -> Result<()> {
    let (engine, gateway) = connect(config).await?;
    let account = engine.account().snapshot().await?;
    let quotes = engine.quotes().await?;

    println!("\n📊 Account");
    println!("   ├─ Balance:       {:.2}", account.balance);
    println!("   ├─ Buying Power:  {:.2}", account.buying_power);
    println!("   └─ Total Assets:  {:.2}", account.total_assets);

    let mut codes: Vec<&String> = account.holdings.keys().collect();
    codes.sort();
    if !codes.is_empty() {
        println!("\n🔓 Holdings");
        for code in codes {
            let holding = &account.holdings[code];
            let last = quotes.get(code).map(|q| q.last).unwrap_or(Decimal::ZERO);
            println!("   ┌─ {}", code);
            println!("   ├─ Qty:   {} @ {:.2} cost", holding.qty, holding.cost_price);
            println!("   └─ Value: {:.2} @ {}", holding.qty * last, last);
        }
    }
    println!();
    gateway.close_api().await?;
    Ok(())
}

async fn show_orders(config: &Config) -> Result<()> {
    let (_engine, gateway) = connect(config).await?;
    let orders = gateway.open_orders().await?;
    if orders.is_empty() {
        println!("No working orders.");
    }
    for order in orders {
        println!(
            "{} {} {:?} {} @ {}",
            order.order_id,
            order.instrument.as_deref().unwrap_or("?"),
            order.side,
            order.qty.unwrap_or(Decimal::ZERO),
            order.price.unwrap_or(Decimal::ZERO),
        );
    }
    gateway.close_api().await?;
    Ok(())
}

async fn cancel_all(config: &Config) -> Result<()> {
    let (engine, gateway) = connect(config).await?;
    engine.cancel_all().await?;
    println!("All working orders cancelled.");
    gateway.close_api().await?;
    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file under `logs/`.
fn init_logging(json: bool) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "tick-rebalancer.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("tick_rebalancer=debug".parse()?)
        .add_directive(Level::INFO.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    if json {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }
    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Run Key: {}", config.run_key());
    info!("   Invest Total: {}", config.engine.invest_total);
    info!("   Balance Extra: {}", config.engine.balance_extra);
    info!("   Loop Interval: {}s", config.frame.loop_interval_secs);
    info!(
        "   Modes: lurker={} maker={}",
        config.execution.be_lurker, config.execution.be_maker
    );
    if let Some(default) = &config.engine.default_instrument {
        info!(
            "   Default Instrument: {} (autorun={}, band {}..{})",
            default,
            config.engine.default_instrument_autorun,
            config.engine.balance_reserved_min,
            config.engine.balance_reserved_max
        );
    }
    for instrument in &config.instruments {
        info!(
            "   {}: invest={} ratio={}",
            instrument.code,
            instrument.resolve_invest(config.engine.invest_total),
            instrument.invest_ratio.unwrap_or(Decimal::ZERO)
        );
    }
}

fn show_status(config: &Config, verbose: bool) -> Result<()> {
    let db_path = config.frame.snapshot_path();

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              TICK REBALANCER STATUS                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !db_path.exists() {
        println!("\n❌ Database not found: {}", db_path.display());
        println!("   The controller has not been started yet, or data_dir is incorrect.");
        return Ok(());
    }

    let store = SnapshotStore::open(&db_path)?;
    let run_key = config.run_key();
    let Some(snapshot) = store.load_snapshot(&run_key)? else {
        println!("\n❌ No snapshot saved for {}.", run_key);
        return Ok(());
    };

    if let Some(total) = &snapshot.total {
        println!("\n📊 Portfolio ({})", run_key);
        println!("   ├─ Invest Total:      {:.2}", total.invest_total);
        println!("   ├─ Strategy Value:    {:.2}", total.invest_total_now_value);
        println!("   ├─ Strategy Profit:   {:+.2}%", (total.strategy_profit - Decimal::ONE) * dec!(100));
        println!("   ├─ Assets (no extra): {:.2}", total.assets_minus_extra);
        println!("   ├─ Profit Total:      {:+.2}%", (total.profit_total - Decimal::ONE) * dec!(100));
        println!("   ├─ Other Profit:      {:.2}", total.others_profit);
        println!("   ├─ Buying Power:      {:.2}", total.buying_power);
        println!("   └─ Last Saved:        {}", snapshot.saved_at.format("%Y-%m-%d %H:%M:%S UTC"));
        if let Some(default) = &total.default_instrument {
            println!("\n🏦 Default Instrument");
            println!("   ├─ {}: {} @ {}", default, total.default_qty, total.default_last_price);
            println!("   └─ Value: {:.2}", total.default_now_value);
        }
    }

    println!("\n📈 Instruments");
    for (code, record) in &snapshot.instruments {
        println!("   ┌─ {}", code);
        println!("   ├─ Balance:   {:.2}", record.balance);
        println!("   ├─ Holdings:  {} @ {}", record.holdings, record.last_price);
        println!("   ├─ Value:     {:.2} of {:.2} invested", record.invest_now_value, record.invest);
        println!(
            "   └─ Profit:    {:+.2}% (benchmark {:+.2}%)",
            (record.profit - Decimal::ONE) * dec!(100),
            (record.profit_benchmark - Decimal::ONE) * dec!(100)
        );
        if verbose {
            println!(
                "       start {} cost {} ratio {} holdings value {:.2}",
                record.start_price, record.cost_price, record.invest_ratio, record.holdings_value
            );
        }
    }

    println!();
    Ok(())
}

//! Signal Reconciler
//!
//! Receives long/short alerts over a webhook and keeps a single futures
//! position on Bybit or Binance aligned with the latest signal.

mod api;
mod models;
mod server;
mod trading;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::models::{Direction, Signal};
use crate::server::AccessConfig;
use crate::trading::{ExchangeManager, ReconcileOutcome};

/// Webhook-driven position reconciler.
#[derive(Parser)]
#[command(name = "signal-reconciler")]
#[command(
    about = "Keep one futures position aligned with incoming long/short signals",
    long_about = None
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the webhook server
    Serve {
        /// Address to listen on
        #[arg(short, long, env = "WEBHOOK_BIND", default_value = "0.0.0.0:80")]
        bind: SocketAddr,

        /// Accept webhooks from any address
        #[arg(long)]
        dev_mode: bool,
    },

    /// Process a single signal and exit
    Signal {
        /// Exchange symbol (defaults to the configured symbol)
        #[arg(short, long)]
        symbol: Option<String>,

        /// long or short
        #[arg(short, long)]
        direction: Direction,

        /// Timeframe label, for logging only
        #[arg(short, long)]
        timeframe: Option<String>,
    },

    /// Show instrument rules, balance, price and the open position
    Status,

    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let manager = ExchangeManager::from_env().context("Invalid exchange configuration")?;
    info!(
        exchange = %manager.active_exchange(),
        symbol = %manager.default_symbol(),
        "Configuration loaded"
    );
    if let Some(warning) = manager.symbol_warning() {
        warn!("{}", warning);
    }

    match cli.command {
        Commands::Serve { bind, dev_mode } => {
            let mut access = AccessConfig::from_lookup(&|key: &str| std::env::var(key).ok())
                .context("Invalid webhook access configuration")?;
            access.dev_mode |= dev_mode;

            server::serve(bind, access, manager).await?;
        }

        Commands::Signal {
            symbol,
            direction,
            timeframe,
        } => {
            let strategy = manager
                .build_strategy(symbol.as_deref())
                .await
                .context("Failed to connect exchange engine")?;

            let mut signal = Signal::new(strategy.engine().symbol(), direction);
            if let Some(tf) = timeframe {
                signal = signal.with_timeframe(tf);
            }

            let outcome = strategy.reconcile(&signal).await;
            println!("{}: {}", signal, describe(&outcome));
            if !outcome.is_success() {
                anyhow::bail!("Signal was not reconciled");
            }
        }

        Commands::Status => {
            let engine = manager
                .connect_engine(None)
                .await
                .context("Failed to connect exchange engine")?;
            let rules = engine.rules();

            println!("\n=== {} {} ===", engine.kind(), engine.symbol());
            println!("Quantity Step:  {}", rules.quantity_step);
            println!("Min Quantity:   {}", rules.min_quantity);
            match rules.max_quantity {
                Some(max) => println!("Max Quantity:   {}", max),
                None => println!("Max Quantity:   -"),
            }
            println!("Price Tick:     {}", rules.price_tick);

            println!("\n--- Account ---");
            println!("Balance:        {} USDT", engine.get_account_balance().await);
            let price = engine.get_current_price(engine.symbol()).await;
            println!("Last Price:     {}", engine.round_price(price));

            println!("\n--- Position ---");
            match engine.fetch_position(engine.symbol()).await {
                Ok(Some(p)) => {
                    println!("Side:           {}", p.side);
                    println!("Size:           {}", p.size);
                    println!("Entry Price:    {}", p.entry_price);
                    println!("Notional:       {}", p.notional());
                    println!("Unrealized PnL: {}", p.unrealized_pnl);
                }
                Ok(None) => println!("Flat"),
                Err(e) => println!("Unavailable: {}", e),
            }
        }

        Commands::Config => {
            let exchange = manager.exchange_config();
            let strategy = manager.strategy_config();

            println!("\n=== Exchange ===");
            println!("Active:         {}", manager.active_exchange());
            println!("Symbol:         {}", manager.default_symbol());
            if let Some(warning) = manager.symbol_warning() {
                println!("Warning:        {}", warning);
            }
            println!("Testnet:        {}", exchange.testnet);
            if let Some(url) = &exchange.base_url {
                println!("Base URL:       {}", url);
            }
            println!("API Key:        {}", exchange.masked_key());
            println!("Position Size:  {} USDT", exchange.position_size);
            println!("Leverage:       {}x", exchange.leverage);

            println!("\n=== Strategy ===");
            println!("Settle Delay:   {:?}", strategy.settle_delay);
            println!("Settle Timeout: {:?}", strategy.settle_timeout);
            println!("Strict Check:   {}", strategy.strict_position_check);
        }
    }

    Ok(())
}

fn describe(outcome: &ReconcileOutcome) -> String {
    match outcome {
        ReconcileOutcome::Filtered => "filtered (same direction as last signal)".to_string(),
        ReconcileOutcome::AlreadyAligned(d) => format!("already {}", d),
        ReconcileOutcome::Opened(d) => format!("opened {}", d),
        ReconcileOutcome::Reversed { from, to } => format!("reversed {} -> {}", from, to),
        ReconcileOutcome::Failed(reason) => format!("failed: {}", reason),
    }
}

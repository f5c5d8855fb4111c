//! Command Line Interface for the keel trading core.
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use futures::StreamExt;
use keel_api::{ApiServer, AppState};
use keel_data::{LedgerConfig, LedgerReader, PositionRepository};
use keel_domain::{MarketData, RecordKind, StreamEvent};
use keel_execution::runtime::KeelCore;
use keel_execution::stream::EventStream;
use keel_protocols::paper::{PaperExchange, PaperTransport};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod settings;

use settings::{ServeArgs, Settings};

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Crash-safety core for an automated trading agent", long_about = None)]
struct Cli {
    /// Directory holding the ledger and the position store
    #[arg(long, env = "KEEL_DATA_DIR", default_value = "data", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the core against the paper exchange and serve the operator API
    Serve(ServeArgs),
    /// Print ledger records
    Replay {
        /// First sequence number to print
        #[arg(long, default_value_t = 0)]
        from: u64,

        /// Only print records of this kind (e.g. ORDER_INTENT)
        #[arg(long)]
        kind: Option<String>,

        /// Stop after this many records
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the stored positions
    Positions,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(Settings::new(cli.data_dir, args)).await,
        Commands::Replay { from, kind, limit } => replay(cli.data_dir, from, kind, limit),
        Commands::Positions => positions(cli.data_dir),
    }
}

async fn serve(settings: Settings) -> Result<()> {
    let exchange = PaperExchange::new();
    for position in &settings.paper_positions {
        exchange.open_position(position.clone()).await;
    }
    let transport = PaperTransport::new(settings.tick_interval);

    let core = Arc::new(
        KeelCore::start(settings.core_config(), Arc::new(exchange), Arc::new(transport))
            .await
            .context("core failed to start, refusing to trade")?,
    );

    let events = core.streams().subscribe(settings.symbols.clone()).await;
    let recorder = tokio::spawn(record_market_data(core.clone(), events));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
        }
        info!("Shutdown requested");
        signal.cancel();
    });

    let served = ApiServer::new(settings.server_config(), AppState::new(core.clone()))
        .run(shutdown)
        .await
        .context("API server failed");

    stop(&core, recorder).await?;
    served
}

/// Stops the feed, lets the recorder write what it already received, then
/// closes the core and its ledger.
async fn stop(core: &KeelCore, recorder: JoinHandle<()>) -> Result<()> {
    core.streams().shutdown().await;
    if let Err(e) = recorder.await {
        warn!(error = %e, "Market data recorder failed");
    }
    core.shutdown().await.context("core shutdown failed")
}

/// Writes every market update to the buffered ledger tier until the stream ends.
async fn record_market_data(core: Arc<KeelCore>, mut events: EventStream) {
    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Market(event) => {
                let mut data = MarketData::new(event.symbol, event.price);
                data.volume = event.volume;
                if let Err(e) = core.gateway().record_market_data(data).await {
                    warn!(error = %e, "Market data not recorded");
                }
            }
            StreamEvent::GapDetected(gap) => {
                info!(session_id = gap.session_id, reason = ?gap.reason, "Market data gap");
            }
        }
    }
}

fn replay(data_dir: PathBuf, from: u64, kind: Option<String>, limit: Option<usize>) -> Result<()> {
    let kind = kind
        .map(|k| RecordKind::parse(&k.to_uppercase()).with_context(|| format!("unknown record kind {k}")))
        .transpose()?;

    let config = LedgerConfig::new(data_dir.join("ledger"));
    let reader = LedgerReader::open(&config.dir, config.stem.clone());
    let mut replay = reader.replay_from(from).context("failed to open ledger")?;

    println!("{:<8} | {:<26} | {:<19} | {:<12}", "Seq", "Time", "Kind", "Symbol");
    println!("{}", "-".repeat(74));

    let mut printed = 0;
    for record in replay.by_ref() {
        let record = record.context("failed to read ledger")?;
        if kind.is_some_and(|k| k != record.kind()) {
            continue;
        }
        println!(
            "{:<8} | {:<26} | {:<19} | {:<12}",
            record.seq,
            record.ts.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.kind(),
            record.symbol()
        );
        printed += 1;
        if limit.is_some_and(|l| printed >= l) {
            break;
        }
    }

    let stats = replay.stats();
    println!(
        "✅ {} records printed ({} malformed, {} truncated)",
        printed, stats.malformed, stats.truncated
    );
    Ok(())
}

fn positions(data_dir: PathBuf) -> Result<()> {
    let repository = PositionRepository::new(data_dir.join("positions.json"));
    let snapshot = repository
        .load()
        .with_context(|| format!("failed to load {}", repository.path().display()))?;

    println!(
        "{:<12} | {:<5} | {:<14} | {:<14} | {:<8} | {:<20}",
        "Symbol", "Side", "Quantity", "Entry", "Adopted", "Last verified"
    );
    println!("{}", "-".repeat(86));
    for record in snapshot.positions.values() {
        println!(
            "{:<12} | {:<5} | {:<14} | {:<14} | {:<8} | {:<20}",
            record.symbol,
            record.side,
            record.quantity,
            record.entry_price,
            record.adopted,
            record.last_verified.format("%Y-%m-%d %H:%M:%S")
        );
    }
    match snapshot.checkpoint_seq {
        Some(seq) => println!("📌 Ledger checkpoint: {seq}"),
        None => println!("📌 No ledger checkpoint yet"),
    }
    Ok(())
}

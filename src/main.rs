use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing::{error, info};

use smartgrid::advisory::AdvisoryClient;
use smartgrid::api::{router, AppState};
use smartgrid::execution::{ExecutionEngine, PaperBroker};
use smartgrid::persistence::{JournalWriter, SqliteJournal};
use smartgrid::streams::{discover_feeds, load_bars_csv};
use smartgrid::trading_core::SymbolBook;
use smartgrid::{ConfigStore, DecisionLoop, EngineConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML config file; built-in defaults when omitted
    #[arg(short, long, env = "SMARTGRID_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay <SYMBOL>.csv bar files through the decision loop on the paper broker
    Run {
        /// Directory holding one CSV per symbol
        #[arg(short, long, default_value = "data")]
        data_dir: PathBuf,

        /// Pause between bars, in milliseconds
        #[arg(long, default_value = "0")]
        pace_ms: u64,

        /// How often to check the config file for changes, in seconds
        #[arg(long, default_value = "5")]
        reload_secs: u64,
    },
    /// Serve ad-hoc signal queries over HTTP
    Serve {
        /// Port; falls back to the config file
        #[arg(short, long, env = "SMARTGRID_PORT")]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("smartgrid=info".parse()?))
        .init();

    let args = Args::parse();

    let store = match &args.config {
        Some(path) => ConfigStore::open(path).with_context(|| format!("Failed to load config {:?}", path))?,
        None => {
            info!("No config file given, using defaults");
            ConfigStore::new(EngineConfig::default())
        }
    };

    match args.command {
        Command::Run {
            data_dir,
            pace_ms,
            reload_secs,
        } => run(store, data_dir, pace_ms, reload_secs).await,
        Command::Serve { port } => serve(store, port).await,
    }
}

async fn run(store: ConfigStore, data_dir: PathBuf, pace_ms: u64, reload_secs: u64) -> Result<()> {
    let config = store.snapshot().await;
    let _watcher = store.spawn_watcher(Duration::from_secs(reload_secs.max(1)));

    let broker = Arc::new(PaperBroker::new(config.account.starting_balance));
    let engine = Arc::new(ExecutionEngine::new(broker));
    let mut runner = DecisionLoop::new(store.clone(), Arc::new(SymbolBook::new()), engine);

    if let Some(advisory) = &config.advisory {
        let client = AdvisoryClient::new(advisory).context("Failed to build advisory client")?;
        info!("Advisory voter '{}' at {}", client.name(), advisory.url);
        runner = runner.with_advisory(Arc::new(client));
    }

    let mut journal_task = None;
    if let Some(path) = &config.journal.path {
        let journal = SqliteJournal::open(path).with_context(|| format!("Failed to open journal {:?}", path))?;
        let (writer, handle) = JournalWriter::spawn(journal, config.journal.queue_capacity);
        info!("Journal at {}", path.display());
        runner = runner.with_journal(writer);
        journal_task = Some(handle);
    }

    let feeds = discover_feeds(&data_dir)?;
    info!("Replaying {} symbols from {}", feeds.len(), data_dir.display());

    let runner = Arc::new(runner);
    let pace = (pace_ms > 0).then(|| Duration::from_millis(pace_ms));
    let tasks = feeds.into_iter().map(|feed| {
        let runner = runner.clone();
        tokio::spawn(async move {
            let bars = load_bars_csv(&feed.path)?;
            runner.run_feed(&feed.symbol, bars, pace).await
        })
    });

    for result in join_all(tasks).await {
        match result {
            Ok(Ok(summary)) => info!("{}", serde_json::to_string(&summary)?),
            Ok(Err(e)) => error!("Feed failed: {:#}", e),
            Err(e) => error!("Feed task panicked: {}", e),
        }
    }

    // last writer handle goes with the runner; wait for queued records
    drop(runner);
    if let Some(handle) = journal_task {
        handle.await.context("Journal writer task failed")?;
    }
    Ok(())
}

async fn serve(store: ConfigStore, port: Option<u16>) -> Result<()> {
    let config = store.snapshot().await;
    let _watcher = store.spawn_watcher(Duration::from_secs(5));
    let port = port.unwrap_or(config.server.port);

    let state = Arc::new(AppState::new(store, Duration::from_secs(config.server.cache_ttl_secs)));
    let app = router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Server running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

use clap::{Parser, Subcommand};
use markov_engine::{scheduler, Engine, EngineConfig, Instructions, IntervalUnit, MarkovError, Method};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "markov-engine")]
#[command(about = "File-backed Markov chain storage and text generation", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Storage directory, overrides the configuration file
    #[arg(long, global = true)]
    dir: Option<PathBuf>,
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine and scheduler, reading `channel<TAB>text` lines from stdin
    Serve {
        /// Write interval, in `--unit`s
        #[arg(long)]
        write_interval: Option<u64>,
        #[arg(long)]
        unit: Option<IntervalUnit>,
        #[arg(long)]
        zip: bool,
        #[arg(long)]
        defluff: bool,
    },
    /// Generate one sentence from a chain
    Generate {
        chain: String,
        #[arg(long, default_value = "LikelyBeginning")]
        method: Method,
        #[arg(long, default_value = "")]
        target: String,
    },
    /// Remove a word from every chain
    Cleanse { word: String },
    /// Prune low-weight edges from every chain
    Defluff {
        #[arg(long)]
        threshold: Option<u64>,
    },
    /// Write the snapshot archive
    Zip,
    /// Flush every buffered delta (useful after `serve` was killed with buffered input)
    Flush,
    /// Print the stats snapshot as JSON
    Stats,
    /// List known chains
    Chains,
}

fn load_config(cli: &Cli) -> Result<EngineConfig, MarkovError> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = &cli.dir {
        config.storage_dir = dir.clone();
    }
    config.debug |= cli.debug;
    Ok(config)
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> Result<(), MarkovError> {
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    init_tracing(config.debug);

    match cli.command {
        Commands::Serve {
            write_interval,
            unit,
            zip,
            defluff,
        } => {
            if let Some(interval) = write_interval {
                config.write_interval = interval;
            }
            if let Some(unit) = unit {
                config.interval_unit = unit;
            }
            config.zip_enabled |= zip;
            config.defluff_enabled |= defluff;
            serve(config).await?;
        }
        Commands::Generate { chain, method, target } => {
            let engine = Engine::open(config)?;
            let text = engine.generate(&Instructions::new(chain, method, target))?;
            println!("{}", text);
        }
        Commands::Cleanse { word } => {
            let engine = Engine::open(config)?;
            let removed = engine.cleanse(&word)?;
            println!("removed {} records", removed);
        }
        Commands::Defluff { threshold } => {
            if let Some(threshold) = threshold {
                config.defluff_threshold = threshold;
            }
            let engine = Engine::open(config)?;
            let outcome = engine.defluff();
            println!(
                "removed {} edges and {} parents",
                outcome.edges_removed, outcome.parents_removed
            );
        }
        Commands::Zip => {
            let engine = Engine::open(config)?;
            let outcome = engine.zip()?;
            println!("archived {} files ({} bytes)", outcome.entries, outcome.bytes);
        }
        Commands::Flush => {
            let engine = Engine::open(config)?;
            let report = engine.write_cycle().unwrap_or_default();
            println!("flushed {} chains, {} failed", report.flushed, report.failed);
        }
        Commands::Stats => {
            let engine = Engine::open(config)?;
            println!("{}", serde_json::to_string_pretty(&engine.stats())?);
        }
        Commands::Chains => {
            let engine = Engine::open(config)?;
            for name in engine.known_chains() {
                println!("{}", name);
            }
        }
    }
    Ok(())
}

async fn serve(config: EngineConfig) -> Result<(), MarkovError> {
    let engine = Arc::new(Engine::open(config)?);
    let handle = scheduler::start(engine.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => match line.split_once('\t') {
                        Some((channel, text)) => engine.ingest(channel, text),
                        None => warn!("expected channel<TAB>text, skipping line"),
                    },
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    info!("shutting down");
    handle.shutdown().await;
    let engine_for_flush = engine.clone();
    tokio::task::spawn_blocking(move || {
        engine_for_flush.wait_until_idle();
        engine_for_flush.write_cycle();
        engine_for_flush.save_stats()
    })
    .await
    .map_err(|e| MarkovError::Other(format!("final flush panicked: {}", e)))??;
    info!("shutdown complete");
    Ok(())
}

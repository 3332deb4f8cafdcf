use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use batch_geocoder::cache::{CacheStore, SqliteCacheStore};
use batch_geocoder::config::{AppConfig, DEFAULT_CONFIG_FILE};
use batch_geocoder::{init_tracing, Geocoder, RunState};

/// Resumable batch geocoding of shipping addresses
#[derive(Parser)]
#[command(name = "batch-geocoder")]
#[command(about = "Geocode a column of addresses in resumable batches", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Geocode the input file (default)
    Run(RunArgs),

    /// Write the effective configuration to a file
    #[command(name = "init-config")]
    InitConfig {
        /// Destination, defaults to the --config path
        path: Option<PathBuf>,
    },

    /// Show how many cached entries resolved and failed
    #[command(name = "cache-stats")]
    CacheStats,

    /// Drop cached failures so the next run retries them
    #[command(name = "purge-failed")]
    PurgeFailed,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Input CSV
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output CSV
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    workers: Option<usize>,

    /// Minimum seconds between external calls
    #[arg(long)]
    delay: Option<f64>,

    #[arg(long)]
    cache_file: Option<PathBuf>,
}

impl RunArgs {
    fn apply(self, config: &mut AppConfig) {
        if let Some(input) = self.input {
            config.files.input_file = input;
        }
        if let Some(output) = self.output {
            config.files.output_file = output;
        }
        if let Some(batch_size) = self.batch_size {
            config.processing.batch_size = batch_size;
        }
        if let Some(workers) = self.workers {
            config.processing.max_workers = workers;
        }
        if let Some(delay) = self.delay {
            config.api.delay_between_requests_secs = delay;
        }
        if let Some(cache_file) = self.cache_file {
            config.cache.cache_file = cache_file;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = AppConfig::load(Some(&cli.config));

    match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            args.apply(&mut config);
            run(config.sanitized()).await
        }
        Commands::InitConfig { path } => {
            let path = path.unwrap_or(cli.config);
            config
                .save_to_file(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Configuration written to {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::CacheStats => {
            let store = open_store(&config)?;
            let (resolved, failed) = store.counts()?;
            println!("Cache file: {}", store.path().display());
            println!("Resolved entries: {resolved}");
            println!("Failed entries: {failed}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::PurgeFailed => {
            let store = open_store(&config)?;
            let removed = store.purge_failed()?;
            println!(
                "Removed {removed} failed entries from {}",
                store.path().display()
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<ExitCode> {
    let geocoder = Geocoder::initialize(config).context("initializing geocoder")?;

    let cancel_flag = Arc::new(AtomicBool::new(false));
    let signal_flag = Arc::clone(&cancel_flag);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight lookups and saving");
            signal_flag.store(true, Ordering::SeqCst);
        }
    });

    let report = match geocoder.run(cancel_flag).await {
        Ok(report) => report,
        Err(err) => {
            error!(error = %err, "run aborted");
            return Ok(ExitCode::from(1));
        }
    };
    println!("{report}");
    info!(state = report.state.as_str(), "run finished");

    Ok(match report.state {
        RunState::Completed => ExitCode::SUCCESS,
        RunState::Interrupted => ExitCode::from(130),
        _ => ExitCode::from(1),
    })
}

fn open_store(config: &AppConfig) -> anyhow::Result<SqliteCacheStore> {
    let path = &config.cache.cache_file;
    let store = SqliteCacheStore::open(path)
        .with_context(|| format!("opening cache {}", path.display()))?;
    let entries = store.load()?.len();
    info!(path = %path.display(), entries, "cache opened");
    Ok(store)
}

pub mod cache;
pub mod config;
pub mod errors;
pub mod ingestion;
pub mod journal;
pub mod lookup;
pub mod normalize;
pub mod output;
pub mod progress;
pub mod report;
pub mod runner;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::{ResultCache, SqliteCacheStore};
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::ingestion::CsvAddressSource;
use crate::journal::RunJournal;
use crate::lookup::{HttpGeocoder, RateLimitedLookup};
use crate::normalize::AddressNormalizer;
use crate::output::FileResultWriter;
use crate::report::RunReport;
use crate::runner::{BatchRunner, RunnerSettings};

pub use crate::errors::AppError;
pub use crate::runner::RunState;

/// Everything one run needs, wired from an [`AppConfig`].
pub struct Geocoder {
    config: AppConfig,
    cache: Arc<ResultCache>,
    lookup: Arc<RateLimitedLookup>,
    journal: Arc<RunJournal>,
}

impl Geocoder {
    /// Opens the cache (memory-only when disabled) and builds the HTTP lookup.
    /// Failing to open cache storage at all is a structural error.
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        info!(profile = ?config.public_profile(), "starting geocoder");

        let cache = if config.cache.enabled {
            let store = SqliteCacheStore::open(&config.cache.cache_file)?;
            Arc::new(ResultCache::new(Box::new(store)))
        } else {
            warn!("result cache disabled; lookups will not survive this run");
            Arc::new(ResultCache::in_memory())
        };
        cache.load();

        let geocoder = HttpGeocoder::new(&config.api)?;
        let lookup = Arc::new(RateLimitedLookup::new(
            Arc::clone(&cache),
            Arc::new(geocoder),
            config.api.request_delay(),
            config.api.max_retries,
        ));
        let journal = Arc::new(RunJournal::new(&config.files.journal_file));

        Ok(Self {
            config,
            cache,
            lookup,
            journal,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn runner(&self, cancel_flag: Arc<AtomicBool>) -> BatchRunner {
        BatchRunner::new(
            RunnerSettings::from(&self.config.processing),
            AddressNormalizer::from_settings(&self.config.normalize),
            Arc::clone(&self.lookup),
            Arc::new(FileResultWriter::from_settings(&self.config.files)),
        )
        .with_journal(Arc::clone(&self.journal))
        .with_cancel_flag(cancel_flag)
    }

    /// Loads the configured input and processes it to a terminal state.
    pub async fn run(&self, cancel_flag: Arc<AtomicBool>) -> AppResult<RunReport> {
        let source = CsvAddressSource::new(
            &self.config.files.input_file,
            &self.config.files.address_column,
        );
        let mut runner = self.runner(cancel_flag);
        runner.load(&source)?;
        runner.process_all().await
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,batch_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}

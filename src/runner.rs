use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::cache::ResultCache;
use crate::config::ProcessingSettings;
use crate::errors::{AppError, AppResult};
use crate::ingestion::{AddressRecord, AddressSource};
use crate::journal::RunJournal;
use crate::lookup::RateLimitedLookup;
use crate::normalize::AddressNormalizer;
use crate::output::ResultWriter;
use crate::progress::ProgressTracker;
use crate::report::{RunReport, FAILED_SAMPLE_SIZE};

const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Where a run is. `Processing` and `Saving` carry the 1-based batch number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Loading,
    Processing { batch: usize, total: usize },
    Saving { batch: usize, total: usize },
    Completed,
    Interrupted,
    Aborted,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Loading => "loading",
            RunState::Processing { .. } => "processing",
            RunState::Saving { .. } => "saving",
            RunState::Completed => "completed",
            RunState::Interrupted => "interrupted",
            RunState::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub batch_size: usize,
    pub max_workers: usize,
    pub save_cache_every: usize,
    pub batch_pause: Duration,
}

impl From<&ProcessingSettings> for RunnerSettings {
    fn from(value: &ProcessingSettings) -> Self {
        Self {
            batch_size: value.batch_size.max(1),
            max_workers: value.max_workers.max(1),
            save_cache_every: value.save_cache_every.max(1),
            batch_pause: value.batch_pause(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub batch: usize,
    pub total_batches: usize,
    pub batch_len: usize,
    pub processed_in_batch: usize,
    pub resolved_in_batch: usize,
}

/// Drives a run: load and normalize every address, then walk fixed-size
/// batches, resolving each record through the shared lookup and saving both
/// results and cache after every batch.
///
/// Setting the cancel flag stops new lookups from starting; lookups already in
/// flight finish, the partial batch is saved and the run ends `Interrupted`.
pub struct BatchRunner {
    settings: RunnerSettings,
    normalizer: AddressNormalizer,
    lookup: Arc<RateLimitedLookup>,
    cache: Arc<ResultCache>,
    writer: Arc<dyn ResultWriter>,
    journal: Arc<RunJournal>,
    cancel_flag: Arc<AtomicBool>,
    observer: Option<Arc<dyn Fn(BatchProgress) + Send + Sync>>,
    state: RunState,
    records: Vec<AddressRecord>,
    tracker: ProgressTracker,
    save_failures: usize,
    started: Option<Instant>,
}

impl BatchRunner {
    pub fn new(
        settings: RunnerSettings,
        normalizer: AddressNormalizer,
        lookup: Arc<RateLimitedLookup>,
        writer: Arc<dyn ResultWriter>,
    ) -> Self {
        let cache = Arc::clone(lookup.cache());
        Self {
            settings,
            normalizer,
            lookup,
            cache,
            writer,
            journal: Arc::new(RunJournal::disabled()),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            observer: None,
            state: RunState::Idle,
            records: Vec::new(),
            tracker: ProgressTracker::default(),
            save_failures: 0,
            started: None,
        }
    }

    pub fn with_journal(mut self, journal: Arc<RunJournal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = flag;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Fn(BatchProgress) + Send + Sync>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn records(&self) -> &[AddressRecord] {
        &self.records
    }

    /// `Idle → Loading`. Reads every address and normalizes it. An unreadable
    /// source or an empty one ends the run as `Aborted`.
    pub fn load(&mut self, source: &dyn AddressSource) -> AppResult<usize> {
        if self.state != RunState::Idle {
            return Err(AppError::Config(format!(
                "cannot load addresses while {}",
                self.state.as_str()
            )));
        }
        self.state = RunState::Loading;
        info!(source = %source.describe(), "loading addresses");

        let raw = match source.load() {
            Ok(raw) => raw,
            Err(err) => {
                self.abort(&err);
                return Err(err);
            }
        };
        if raw.is_empty() {
            let err = AppError::Input(format!("no addresses found in {}", source.describe()));
            self.abort(&err);
            return Err(err);
        }

        self.records = raw
            .into_iter()
            .map(|original| {
                let normalized = self.normalizer.normalize(&original);
                AddressRecord::new(original, normalized)
            })
            .collect();
        self.tracker = ProgressTracker::new(self.records.len(), self.settings.batch_size);
        info!(
            addresses = self.records.len(),
            batches = self.tracker.stats().total_batches,
            cached = self.cache.size(),
            "addresses loaded"
        );
        Ok(self.records.len())
    }

    /// Processes every batch in order and returns the final report.
    pub async fn process_all(&mut self) -> AppResult<RunReport> {
        if self.state != RunState::Loading {
            return Err(AppError::Config(format!(
                "nothing to process while {}",
                self.state.as_str()
            )));
        }

        self.started = Some(Instant::now());
        let total = self.tracker.stats().total_batches;
        self.journal.record(
            "run_started",
            json!({
                "addresses": self.records.len(),
                "batches": total,
                "batch_size": self.settings.batch_size,
                "workers": self.settings.max_workers,
                "cache_entries": self.cache.size(),
            }),
        );
        self.journal.flush();

        for batch in 1..=total {
            if self.is_cancelled() {
                break;
            }

            self.state = RunState::Processing { batch, total };
            let range = self.batch_range(batch);
            info!(batch, total, size = range.len(), "processing batch");
            let (processed, resolved) = self.process_batch(batch, range).await;
            self.tracker.record_batch(processed, resolved);

            self.state = RunState::Saving { batch, total };
            self.checkpoint(batch);
            let stats = self.tracker.stats();
            info!(
                batch,
                processed = stats.processed,
                total = stats.total,
                percent = %format!("{:.1}", stats.percentage_complete()),
                success_rate = %format!("{:.1}", stats.success_rate()),
                "batch saved"
            );

            if batch < total {
                self.pause(self.settings.batch_pause).await;
            }
        }

        let stats = self.tracker.stats();
        self.state = if stats.processed >= stats.total {
            RunState::Completed
        } else {
            warn!(
                processed = stats.processed,
                total = stats.total,
                "run interrupted; progress saved"
            );
            self.journal
                .record("run_interrupted", json!({ "processed": stats.processed }));
            RunState::Interrupted
        };

        self.cache.flush();
        let report = self.report();
        self.journal.record(
            "run_finished",
            json!({
                "state": self.state.as_str(),
                "processed": stats.processed,
                "succeeded": stats.succeeded,
                "failed": stats.failed,
                "external_calls": report.lookups.external_calls,
                "cache_hits": report.lookups.cache_hits,
                "elapsed_ms": report.elapsed.as_millis() as u64,
            }),
        );
        self.journal.flush();
        Ok(report)
    }

    pub fn report(&self) -> RunReport {
        let failed: Vec<&AddressRecord> = self
            .records
            .iter()
            .filter(|record| !record.is_resolved())
            .collect();
        let failed_sample: Vec<String> = failed
            .iter()
            .take(FAILED_SAMPLE_SIZE)
            .map(|record| record.normalized.clone())
            .collect();

        RunReport {
            state: self.state,
            stats: self.tracker.stats(),
            lookups: self.lookup.stats(),
            cache_entries: self.cache.size(),
            resolved_rows: self.records.len() - failed.len(),
            failed_remaining: failed.len() - failed_sample.len(),
            failed_sample,
            save_failures: self.save_failures,
            elapsed: self
                .started
                .map(|started| started.elapsed())
                .unwrap_or_default(),
            batch_size: self.settings.batch_size,
            request_delay: self.lookup.gate().interval(),
        }
    }

    async fn process_batch(&mut self, batch: usize, range: Range<usize>) -> (usize, usize) {
        let batch_len = range.len();
        let total_batches = self.tracker.stats().total_batches;
        let jobs: Vec<(usize, String)> = range
            .map(|idx| (idx, self.records[idx].normalized.clone()))
            .collect();

        let lookup = Arc::clone(&self.lookup);
        let cancel = Arc::clone(&self.cancel_flag);
        let mut outcomes = stream::iter(jobs)
            .map(|(idx, key)| {
                let lookup = Arc::clone(&lookup);
                let cancel = Arc::clone(&cancel);
                async move {
                    if cancel.load(Ordering::SeqCst) {
                        return (idx, None);
                    }
                    (idx, Some(lookup.resolve(&key).await))
                }
            })
            .buffer_unordered(self.settings.max_workers);

        let mut processed = 0;
        let mut resolved = 0;
        let mut skipped = 0;
        while let Some((idx, outcome)) = outcomes.next().await {
            let Some(outcome) = outcome else {
                skipped += 1;
                continue;
            };
            let record = &mut self.records[idx];
            record.apply(outcome);
            processed += 1;
            if record.is_resolved() {
                resolved += 1;
            }

            if processed % self.settings.save_cache_every == 0 {
                self.cache.flush();
            }
            if let Some(observer) = &self.observer {
                observer(BatchProgress {
                    batch,
                    total_batches,
                    batch_len,
                    processed_in_batch: processed,
                    resolved_in_batch: resolved,
                });
            }
        }

        if skipped > 0 {
            debug!(batch, skipped, "lookups not started after cancellation");
        }
        (processed, resolved)
    }

    fn checkpoint(&mut self, batch: usize) {
        let stats = self.tracker.stats();
        if let Err(err) = self.writer.write(&self.records, &stats) {
            self.save_failures += 1;
            warn!(batch, error = %err, "failed to save results; continuing");
        }
        self.cache.flush();
        self.journal.record(
            "batch_completed",
            json!({
                "batch": batch,
                "total_batches": stats.total_batches,
                "processed": stats.processed,
                "succeeded": stats.succeeded,
                "cache_entries": self.cache.size(),
            }),
        );
        self.journal.flush();
    }

    fn batch_range(&self, batch: usize) -> Range<usize> {
        let start = (batch - 1) * self.settings.batch_size;
        let end = (start + self.settings.batch_size).min(self.records.len());
        start..end
    }

    async fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep((deadline - now).min(PAUSE_POLL)).await;
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    fn abort(&mut self, err: &AppError) {
        warn!(error = %err, "run aborted");
        self.state = RunState::Aborted;
        self.journal
            .record("run_aborted", json!({ "reason": err.to_string() }));
        self.journal.flush();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::cache::{Coordinates, LookupOutcome};
    use crate::lookup::GeocodeLookup;
    use crate::progress::RunStats;

    struct FixedLookup {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GeocodeLookup for FixedLookup {
        async fn geocode(&self, address: &str) -> AppResult<Option<Coordinates>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(address
                .strip_prefix("Street ")
                .and_then(|n| n.parse::<f64>().ok())
                .map(|n| Coordinates::new(n / 10.0, n / 10.0)))
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        writes: Mutex<Vec<usize>>,
        fail: bool,
    }

    impl ResultWriter for RecordingWriter {
        fn write(&self, records: &[AddressRecord], _stats: &RunStats) -> AppResult<()> {
            if self.fail {
                return Err(AppError::Config("read-only output".into()));
            }
            let resolved = records.iter().filter(|r| r.is_resolved()).count();
            self.writes.lock().push(resolved);
            Ok(())
        }
    }

    fn settings(batch_size: usize, workers: usize) -> RunnerSettings {
        RunnerSettings {
            batch_size,
            max_workers: workers,
            save_cache_every: 2,
            batch_pause: Duration::ZERO,
        }
    }

    fn runner_with(
        batch_size: usize,
        workers: usize,
        writer: Arc<RecordingWriter>,
    ) -> (BatchRunner, Arc<FixedLookup>) {
        let external = Arc::new(FixedLookup {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(ResultCache::in_memory());
        let lookup = Arc::new(RateLimitedLookup::new(
            cache,
            external.clone(),
            Duration::ZERO,
            1,
        ));
        let runner = BatchRunner::new(
            settings(batch_size, workers),
            AddressNormalizer::default(),
            lookup,
            writer,
        );
        (runner, external)
    }

    fn addresses(count: usize) -> Vec<String> {
        (1..=count).map(|i| format!("Street {i}, Cairo")).collect()
    }

    #[tokio::test]
    async fn walks_every_batch_and_saves_after_each() {
        let writer = Arc::new(RecordingWriter::default());
        let (mut runner, external) = runner_with(2, 3, writer.clone());
        assert_eq!(runner.load(&addresses(5)).unwrap(), 5);
        assert_eq!(runner.state(), RunState::Loading);

        let report = runner.process_all().await.unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.stats.total_batches, 3);
        assert_eq!(report.stats.processed, 5);
        assert_eq!(report.stats.succeeded, 5);
        assert_eq!(*writer.writes.lock(), vec![2, 4, 5]);
        assert_eq!(external.calls.load(Ordering::SeqCst), 5);
        assert_eq!(
            runner.records()[2].coordinates().as_deref(),
            Some("0.3,0.3")
        );
    }

    #[tokio::test]
    async fn empty_source_aborts() {
        let writer = Arc::new(RecordingWriter::default());
        let (mut runner, _) = runner_with(2, 1, writer.clone());
        let err = runner.load(&Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, AppError::Input(_)));
        assert_eq!(runner.state(), RunState::Aborted);
        assert!(runner.process_all().await.is_err());
        assert!(writer.writes.lock().is_empty());
    }

    #[tokio::test]
    async fn cancellation_before_start_saves_nothing_new() {
        let writer = Arc::new(RecordingWriter::default());
        let (runner, external) = runner_with(2, 1, writer.clone());
        let mut runner = runner.with_cancel_flag(Arc::new(AtomicBool::new(true)));
        runner.load(&addresses(4)).unwrap();

        let report = runner.process_all().await.unwrap();
        assert_eq!(report.state, RunState::Interrupted);
        assert_eq!(report.stats.processed, 0);
        assert_eq!(external.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.failed_total(), 4);
    }

    #[tokio::test]
    async fn cancellation_mid_run_keeps_finished_batches() {
        let writer = Arc::new(RecordingWriter::default());
        let (runner, _) = runner_with(2, 1, writer.clone());
        let flag = Arc::new(AtomicBool::new(false));
        let trip = Arc::clone(&flag);
        let mut runner = runner
            .with_cancel_flag(flag)
            .with_observer(Arc::new(move |progress: BatchProgress| {
                if progress.batch == 1 && progress.processed_in_batch == progress.batch_len {
                    trip.store(true, Ordering::SeqCst);
                }
            }));
        runner.load(&addresses(6)).unwrap();

        let report = runner.process_all().await.unwrap();
        assert_eq!(report.state, RunState::Interrupted);
        assert_eq!(report.stats.processed, 2);
        assert_eq!(report.stats.current_batch, 1);
        assert_eq!(*writer.writes.lock(), vec![2]);
    }

    #[tokio::test]
    async fn writer_failures_do_not_abort() {
        let writer = Arc::new(RecordingWriter {
            writes: Mutex::new(Vec::new()),
            fail: true,
        });
        let (mut runner, _) = runner_with(1, 2, writer);
        runner.load(&addresses(2)).unwrap();

        let report = runner.process_all().await.unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.save_failures, 2);
    }

    #[tokio::test]
    async fn unmatched_addresses_count_as_failed() {
        let writer = Arc::new(RecordingWriter::default());
        let (mut runner, _) = runner_with(10, 4, writer);
        runner
            .load(&vec![
                "Street 5".to_string(),
                "Unknown lane".to_string(),
                String::new(),
            ])
            .unwrap();

        let report = runner.process_all().await.unwrap();
        assert_eq!(report.stats.succeeded, 1);
        assert_eq!(report.stats.failed, 2);
        assert_eq!(report.failed_sample, vec!["Unknown lane".to_string(), String::new()]);
        assert_eq!(
            runner.lookup.cache().get("Unknown lane"),
            Some(LookupOutcome::Failed)
        );
    }
}

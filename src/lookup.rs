use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::cache::{Coordinates, LookupOutcome, ResultCache};
use crate::config::ApiSettings;
use crate::errors::{AppError, AppResult};

const BASE_BACKOFF_MS: u64 = 250;

/// The external geocoding capability. `Ok(None)` means the service had no
/// match; `Err` is a transient failure worth another attempt.
#[async_trait]
pub trait GeocodeLookup: Send + Sync {
    async fn geocode(&self, address: &str) -> AppResult<Option<Coordinates>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LookupStats {
    pub cache_hits: usize,
    pub external_calls: usize,
    pub failed_calls: usize,
}

/// Global minimum spacing between outbound calls. Every caller queues on the
/// same tick lock, so concurrent workers never bypass the delay.
pub struct RateGate {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_tick: AsyncMutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait(&self) {
        let interval = self.interval();
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

/// Cache-first resolution of normalized addresses with a shared rate gate.
///
/// Cache hits return immediately. Misses pass the gate, call the external
/// lookup (retrying transient errors with backoff) and store the outcome,
/// `Failed` included, before returning. Errors never escape `resolve`.
pub struct RateLimitedLookup {
    cache: Arc<ResultCache>,
    lookup: Arc<dyn GeocodeLookup>,
    gate: RateGate,
    max_attempts: u32,
    jitter_rng: Mutex<StdRng>,
    in_flight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    cache_hits: AtomicUsize,
    external_calls: AtomicUsize,
    failed_calls: AtomicUsize,
}

impl RateLimitedLookup {
    pub fn new(
        cache: Arc<ResultCache>,
        lookup: Arc<dyn GeocodeLookup>,
        min_interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self::with_rng(
            cache,
            lookup,
            min_interval,
            max_attempts,
            StdRng::from_entropy(),
        )
    }

    pub fn with_rng(
        cache: Arc<ResultCache>,
        lookup: Arc<dyn GeocodeLookup>,
        min_interval: Duration,
        max_attempts: u32,
        rng: StdRng,
    ) -> Self {
        Self {
            cache,
            lookup,
            gate: RateGate::new(min_interval),
            max_attempts: max_attempts.max(1),
            jitter_rng: Mutex::new(rng),
            in_flight: Mutex::new(HashMap::new()),
            cache_hits: AtomicUsize::new(0),
            external_calls: AtomicUsize::new(0),
            failed_calls: AtomicUsize::new(0),
        }
    }

    pub fn gate(&self) -> &RateGate {
        &self.gate
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn stats(&self) -> LookupStats {
        LookupStats {
            cache_hits: self.cache_hits.load(Ordering::SeqCst),
            external_calls: self.external_calls.load(Ordering::SeqCst),
            failed_calls: self.failed_calls.load(Ordering::SeqCst),
        }
    }

    pub async fn resolve(&self, normalized: &str) -> LookupOutcome {
        if normalized.is_empty() {
            return LookupOutcome::Failed;
        }

        if let Some(outcome) = self.cache.get(normalized) {
            self.cache_hits.fetch_add(1, Ordering::SeqCst);
            return outcome;
        }

        let key_lock = self.key_lock(normalized);
        let outcome = {
            let _held = key_lock.lock().await;
            // a concurrent worker may have resolved this key while we queued
            if let Some(outcome) = self.cache.get(normalized) {
                self.cache_hits.fetch_add(1, Ordering::SeqCst);
                outcome
            } else {
                let outcome = self.lookup_with_retry(normalized).await;
                self.cache.put(normalized, outcome);
                outcome
            }
        };
        self.release_key_lock(normalized, &key_lock);
        outcome
    }

    async fn lookup_with_retry(&self, address: &str) -> LookupOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.gate.wait().await;
            self.external_calls.fetch_add(1, Ordering::SeqCst);
            match self.lookup.geocode(address).await {
                Ok(Some(coordinates)) => {
                    let outcome = LookupOutcome::from_coordinates(coordinates);
                    if !outcome.is_resolved() {
                        warn!(
                            address,
                            latitude = coordinates.latitude,
                            longitude = coordinates.longitude,
                            "lookup returned coordinates out of range"
                        );
                    }
                    trace!(address, attempt, "lookup resolved");
                    return outcome;
                }
                Ok(None) => {
                    debug!(address, "no match for address");
                    return LookupOutcome::Failed;
                }
                Err(err) if attempt < self.max_attempts => {
                    self.failed_calls.fetch_add(1, Ordering::SeqCst);
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        error = %err,
                        address,
                        attempt, "lookup failed; retrying after {:?}", delay
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    self.failed_calls.fetch_add(1, Ordering::SeqCst);
                    warn!(error = %err, address, attempt, "lookup failed; giving up");
                    return LookupOutcome::Failed;
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt - 1).min(6);
        let base = Duration::from_millis(BASE_BACKOFF_MS * (1 << exponent));
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..BASE_BACKOFF_MS))
        };
        base + jitter
    }

    fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut in_flight = self.in_flight.lock();
        Arc::clone(
            in_flight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    fn release_key_lock(&self, key: &str, lock: &Arc<AsyncMutex<()>>) {
        let mut in_flight = self.in_flight.lock();
        // the map holds one reference and `lock` another; anything more is a waiter
        if Arc::strong_count(lock) <= 2 {
            in_flight.remove(key);
        }
    }
}

/// Nominatim-style `/search` client.
pub struct HttpGeocoder {
    http: Client,
    search_url: Url,
    api_key: Option<SecretString>,
    country_codes: Option<String>,
}

impl HttpGeocoder {
    pub fn new(settings: &ApiSettings) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.timeout())
            .build()?;

        let mut search_url = Url::parse(&settings.endpoint).map_err(|err| {
            AppError::Config(format!("invalid geocoder endpoint: {err}"))
        })?;
        search_url
            .path_segments_mut()
            .map_err(|_| AppError::Config("geocoder endpoint cannot be a base URL".into()))?
            .pop_if_empty()
            .push("search");

        Ok(Self {
            http,
            search_url,
            api_key: settings.api_key.clone(),
            country_codes: settings.country_codes.clone(),
        })
    }
}

#[async_trait]
impl GeocodeLookup for HttpGeocoder {
    async fn geocode(&self, address: &str) -> AppResult<Option<Coordinates>> {
        #[derive(Deserialize)]
        struct SearchHit {
            lat: String,
            lon: String,
        }

        let mut request = self
            .http
            .get(self.search_url.clone())
            .query(&[("q", address), ("format", "jsonv2"), ("limit", "1")]);
        if let Some(codes) = &self.country_codes {
            request = request.query(&[("countrycodes", codes.as_str())]);
        }
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key.expose_secret())]);
        }

        let response = request.send().await?.error_for_status()?;
        let hits: Vec<SearchHit> = response.json().await?;
        let Some(hit) = hits.into_iter().next() else {
            return Ok(None);
        };

        let latitude = hit
            .lat
            .trim()
            .parse::<f64>()
            .map_err(|err| AppError::Parse(format!("invalid latitude {:?}: {err}", hit.lat)))?;
        let longitude = hit
            .lon
            .trim()
            .parse::<f64>()
            .map_err(|err| AppError::Parse(format!("invalid longitude {:?}: {err}", hit.lon)))?;
        Ok(Some(Coordinates::new(latitude, longitude)))
    }
}

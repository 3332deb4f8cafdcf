use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fmt};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::AppResult;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
const DEFAULT_ENDPOINT: &str = "https://nominatim.openstreetmap.org";
const MAX_DELAY_SECS: f64 = 86_400.0;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiSettings,
    pub cache: CacheSettings,
    pub processing: ProcessingSettings,
    pub files: FileSettings,
    pub normalize: NormalizeSettings,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub user_agent: String,
    pub endpoint: String,
    #[serde(skip)]
    pub api_key: Option<SecretString>,
    pub country_codes: Option<String>,
    pub delay_between_requests_secs: f64,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub cache_file: PathBuf,
    pub enabled: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
    pub batch_size: usize,
    pub max_workers: usize,
    pub save_cache_every: usize,
    pub batch_pause_secs: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    pub input_file: PathBuf,
    pub address_column: String,
    pub output_file: PathBuf,
    pub json_output: PathBuf,
    pub literal_output: PathBuf,
    pub journal_file: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeSettings {
    pub markers: Vec<String>,
    pub delimiter: char,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub endpoint: String,
    pub user_agent: String,
    pub has_api_key: bool,
    pub delay_between_requests_secs: f64,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub cache_file: PathBuf,
    pub cache_enabled: bool,
    pub batch_size: usize,
    pub max_workers: usize,
    pub save_cache_every: usize,
    pub input_file: PathBuf,
    pub output_file: PathBuf,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            user_agent: "large_scale_geocoder".to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            country_codes: None,
            delay_between_requests_secs: 1.5,
            max_retries: 3,
            timeout_secs: 30,
        }
    }
}

impl fmt::Debug for ApiSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiSettings")
            .field("user_agent", &self.user_agent)
            .field("endpoint", &self.endpoint)
            .field("has_api_key", &self.api_key.is_some())
            .field("country_codes", &self.country_codes)
            .field(
                "delay_between_requests_secs",
                &self.delay_between_requests_secs,
            )
            .field("max_retries", &self.max_retries)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_file: PathBuf::from("geocoding_cache.sqlite3"),
            enabled: true,
        }
    }
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_workers: 5,
            save_cache_every: 100,
            batch_pause_secs: 2.0,
        }
    }
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            input_file: PathBuf::from("geocoded_addresses.csv"),
            address_column: "Shipping Address".to_string(),
            output_file: PathBuf::from("geocoded_addresses_updated.csv"),
            json_output: PathBuf::from("address_coordinates_map.json"),
            literal_output: PathBuf::from("address_coordinates_map.py"),
            journal_file: PathBuf::from("geocoding-journal.jsonl"),
        }
    }
}

impl Default for NormalizeSettings {
    fn default() -> Self {
        Self {
            markers: vec![
                "Jumia- Pargo- Pickup station -".to_string(),
                "Point 192 -".to_string(),
            ],
            delimiter: ',',
        }
    }
}

impl ApiSettings {
    pub fn request_delay(&self) -> Duration {
        secs_to_duration(self.delay_between_requests_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl ProcessingSettings {
    pub fn batch_pause(&self) -> Duration {
        secs_to_duration(self.batch_pause_secs)
    }
}

impl AppConfig {
    /// Defaults, then the JSON file (if any), then `GEOCODER_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Self {
        load_dotenv_if_applicable();
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = Self::from_file(path);
        config.apply_overrides(|key| env::var(key).ok());
        config.sanitized()
    }

    pub fn from_file(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(config) => config,
                Err(err) => {
                    warn!(
                        target: "config",
                        path = %path.display(),
                        error = %err,
                        "failed to parse config file; using defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(err) => {
                warn!(
                    target: "config",
                    path = %path.display(),
                    error = %err,
                    "failed to read config file; using defaults"
                );
                Self::default()
            }
        }
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let api = &mut self.api;
        if let Some(value) = lookup("GEOCODER_USER_AGENT").filter(|v| !v.trim().is_empty()) {
            api.user_agent = value;
        }
        if let Some(value) = lookup("GEOCODER_ENDPOINT").filter(|v| !v.trim().is_empty()) {
            api.endpoint = value;
        }
        if let Some(value) = lookup("GEOCODER_API_KEY").filter(|v| !v.trim().is_empty()) {
            api.api_key = Some(SecretString::from(value));
        }
        if let Some(value) = lookup("GEOCODER_COUNTRY_CODES").filter(|v| !v.trim().is_empty()) {
            api.country_codes = Some(value);
        }
        api.delay_between_requests_secs = parse_f64(
            &lookup,
            "GEOCODER_DELAY_SECS",
            api.delay_between_requests_secs,
        );
        api.max_retries = parse_u32(&lookup, "GEOCODER_MAX_RETRIES", api.max_retries);
        api.timeout_secs = parse_u64(&lookup, "GEOCODER_TIMEOUT_SECS", api.timeout_secs);

        if let Some(value) = lookup("GEOCODER_CACHE_FILE") {
            self.cache.cache_file = PathBuf::from(value);
        }
        self.cache.enabled = parse_bool(&lookup, "GEOCODER_CACHE_ENABLED", self.cache.enabled);

        let processing = &mut self.processing;
        processing.batch_size = parse_usize(&lookup, "GEOCODER_BATCH_SIZE", processing.batch_size);
        processing.max_workers =
            parse_usize(&lookup, "GEOCODER_MAX_WORKERS", processing.max_workers);
        processing.save_cache_every = parse_usize(
            &lookup,
            "GEOCODER_SAVE_CACHE_EVERY",
            processing.save_cache_every,
        );
        processing.batch_pause_secs = parse_f64(
            &lookup,
            "GEOCODER_BATCH_PAUSE_SECS",
            processing.batch_pause_secs,
        );

        if let Some(value) = lookup("GEOCODER_INPUT_FILE") {
            self.files.input_file = PathBuf::from(value);
        }
        if let Some(value) = lookup("GEOCODER_OUTPUT_FILE") {
            self.files.output_file = PathBuf::from(value);
        }
        if let Some(value) = lookup("GEOCODER_ADDRESS_COLUMN") {
            self.files.address_column = value;
        }
    }

    pub fn sanitized(mut self) -> Self {
        self.processing.batch_size = self.processing.batch_size.max(1);
        self.processing.max_workers = self.processing.max_workers.max(1);
        self.processing.save_cache_every = self.processing.save_cache_every.max(1);
        self.api.max_retries = self.api.max_retries.max(1);
        self.api.delay_between_requests_secs = clamp_secs(self.api.delay_between_requests_secs);
        self.processing.batch_pause_secs = clamp_secs(self.processing.batch_pause_secs);
        self.normalize.markers.retain(|marker| !marker.is_empty());
        self
    }

    pub fn save_to_file(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            endpoint: self.api.endpoint.clone(),
            user_agent: self.api.user_agent.clone(),
            has_api_key: self.api.api_key.is_some(),
            delay_between_requests_secs: self.api.delay_between_requests_secs,
            max_retries: self.api.max_retries,
            timeout_secs: self.api.timeout_secs,
            cache_file: self.cache.cache_file.clone(),
            cache_enabled: self.cache.enabled,
            batch_size: self.processing.batch_size,
            max_workers: self.processing.max_workers,
            save_cache_every: self.processing.save_cache_every,
            input_file: self.files.input_file.clone(),
            output_file: self.files.output_file.clone(),
        }
    }
}

fn clamp_secs(secs: f64) -> f64 {
    if secs.is_finite() {
        secs.clamp(0.0, MAX_DELAY_SECS)
    } else {
        0.0
    }
}

/// Non-positive and non-finite values mean no delay; anything above a day is
/// clamped to a day.
fn secs_to_duration(secs: f64) -> Duration {
    if !secs.is_finite() || secs <= 0.0 {
        return Duration::ZERO;
    }
    if secs > MAX_DELAY_SECS {
        warn!(
            target: "config",
            requested = secs,
            max = MAX_DELAY_SECS,
            "delay too large; clamping"
        );
        return Duration::from_secs_f64(MAX_DELAY_SECS);
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions)
        || env::var("ALLOW_DOTENV")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false)
}

fn parse_bool<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: bool) -> bool {
    lookup(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: u64) -> u64 {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: u32) -> u32 {
    lookup(key)
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: f64) -> f64 {
    lookup(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(default)
}

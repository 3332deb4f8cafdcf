use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::ffi::ErrorCode;
use rusqlite::{params, Connection, Error as SqliteError, OpenFlags};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Result of one resolution attempt. `Failed` is sticky: it is cached so the
/// external service is not asked again for the same address.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LookupOutcome {
    Resolved { latitude: f64, longitude: f64 },
    Failed,
}

impl LookupOutcome {
    /// Coordinates outside the WGS84 range collapse into `Failed`.
    pub fn from_coordinates(coordinates: Coordinates) -> Self {
        if coordinates.is_valid() {
            LookupOutcome::Resolved {
                latitude: coordinates.latitude,
                longitude: coordinates.longitude,
            }
        } else {
            LookupOutcome::Failed
        }
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        match *self {
            LookupOutcome::Resolved {
                latitude,
                longitude,
            } => Some(Coordinates::new(latitude, longitude)),
            LookupOutcome::Failed => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, LookupOutcome::Resolved { .. })
    }

    fn as_tag(&self) -> &'static str {
        match self {
            LookupOutcome::Resolved { .. } => "resolved",
            LookupOutcome::Failed => "failed",
        }
    }
}

/// Durable backing for [`ResultCache`].
pub trait CacheStore: Send + Sync {
    fn load(&self) -> AppResult<HashMap<String, LookupOutcome>>;

    /// Upserts the given entries; entries not mentioned are left untouched.
    fn save(&self, entries: &[(String, LookupOutcome)]) -> AppResult<()>;
}

/// In-memory map from normalized address to outcome, flushed to a
/// [`CacheStore`]. Reads share a lock; writes are exclusive.
pub struct ResultCache {
    entries: RwLock<HashMap<String, LookupOutcome>>,
    dirty: Mutex<HashSet<String>>,
    store: Option<Box<dyn CacheStore>>,
}

impl ResultCache {
    pub fn new(store: Box<dyn CacheStore>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            store: Some(store),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            store: None,
        }
    }

    /// Replaces the in-memory state with the persisted one. A store that cannot
    /// be read leaves the cache empty rather than failing the run.
    pub fn load(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let loaded = match store.load() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    target: "result_cache",
                    error = %err,
                    "could not load cache; starting empty"
                );
                HashMap::new()
            }
        };
        info!(target: "result_cache", entries = loaded.len(), "cache loaded");
        *self.entries.write() = loaded;
        self.dirty.lock().clear();
    }

    pub fn get(&self, key: &str) -> Option<LookupOutcome> {
        self.entries.read().get(key).copied()
    }

    pub fn put(&self, key: impl Into<String>, outcome: LookupOutcome) {
        let key = key.into();
        self.entries.write().insert(key.clone(), outcome);
        self.dirty.lock().insert(key);
    }

    pub fn size(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn pending_writes(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Persists pending entries; failures are logged and the entries stay
    /// pending for the next flush.
    pub fn flush(&self) {
        if let Err(err) = self.try_flush() {
            warn!(
                target: "result_cache",
                error = %err,
                pending = self.pending_writes(),
                "could not persist cache; continuing"
            );
        }
    }

    pub fn try_flush(&self) -> AppResult<usize> {
        let Some(store) = &self.store else {
            self.dirty.lock().clear();
            return Ok(0);
        };

        let keys: Vec<String> = self.dirty.lock().drain().collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let batch: Vec<(String, LookupOutcome)> = {
            let entries = self.entries.read();
            keys.iter()
                .filter_map(|key| entries.get(key).map(|outcome| (key.clone(), *outcome)))
                .collect()
        };

        match store.save(&batch) {
            Ok(()) => {
                debug!(target: "result_cache", written = batch.len(), "cache flushed");
                Ok(batch.len())
            }
            Err(err) => {
                self.dirty.lock().extend(keys);
                Err(err)
            }
        }
    }

    pub fn snapshot(&self) -> HashMap<String, LookupOutcome> {
        self.entries.read().clone()
    }

    pub fn failed_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|outcome| !outcome.is_resolved())
            .count()
    }
}

pub struct SqliteCacheStore {
    connection: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteCacheStore {
    /// Opens (or creates) the cache database. A file that is not a database is
    /// moved aside and replaced with a fresh one.
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let connection = match establish(&path) {
            Ok(connection) => connection,
            Err(AppError::Database(err)) if is_corruption(&err) && path.exists() => {
                let quarantined = quarantine(&path)?;
                warn!(
                    target: "result_cache",
                    path = %path.display(),
                    moved_to = %quarantined.display(),
                    error = %err,
                    "cache database unreadable; starting a new one"
                );
                establish(&path)?
            }
            Err(err) => return Err(err),
        };

        Ok(Self {
            connection: Mutex::new(connection),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn purge_failed(&self) -> AppResult<usize> {
        let conn = self.connection.lock();
        let removed = conn.execute("DELETE FROM geocode_cache WHERE status = 'failed'", [])?;
        Ok(removed)
    }

    pub fn counts(&self) -> AppResult<(usize, usize)> {
        let conn = self.connection.lock();
        let (resolved, failed): (i64, i64) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'resolved' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
            FROM geocode_cache",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((resolved as usize, failed as usize))
    }
}

impl CacheStore for SqliteCacheStore {
    fn load(&self) -> AppResult<HashMap<String, LookupOutcome>> {
        let conn = self.connection.lock();
        let mut stmt = conn.prepare(
            "SELECT normalized_address, status, latitude, longitude FROM geocode_cache",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let key: String = row.get(0)?;
                let status: String = row.get(1)?;
                let latitude: Option<f64> = row.get(2)?;
                let longitude: Option<f64> = row.get(3)?;
                Ok((key, status, latitude, longitude))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = HashMap::with_capacity(rows.len());
        for (key, status, latitude, longitude) in rows {
            let outcome = match (status.as_str(), latitude, longitude) {
                ("resolved", Some(lat), Some(lon)) => {
                    LookupOutcome::from_coordinates(Coordinates::new(lat, lon))
                }
                ("failed", _, _) => LookupOutcome::Failed,
                _ => {
                    debug!(target: "result_cache", key = %key, status = %status, "skipping malformed cache row");
                    continue;
                }
            };
            entries.insert(key, outcome);
        }
        Ok(entries)
    }

    fn save(&self, entries: &[(String, LookupOutcome)]) -> AppResult<()> {
        let mut conn = self.connection.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO geocode_cache (normalized_address, status, latitude, longitude, updated_at)
                VALUES (?1, ?2, ?3, ?4, DATETIME('now'))
                ON CONFLICT(normalized_address) DO UPDATE SET
                    status = excluded.status,
                    latitude = excluded.latitude,
                    longitude = excluded.longitude,
                    updated_at = DATETIME('now')",
            )?;
            for (key, outcome) in entries {
                let coordinates = outcome.coordinates();
                stmt.execute(params![
                    key,
                    outcome.as_tag(),
                    coordinates.map(|c| c.latitude),
                    coordinates.map(|c| c.longitude),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn establish(path: &Path) -> AppResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(path, flags)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        CREATE TABLE IF NOT EXISTS geocode_cache (
            normalized_address TEXT PRIMARY KEY,
            status TEXT NOT NULL CHECK (status IN ('resolved', 'failed')),
            latitude REAL,
            longitude REAL,
            updated_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );
        "#,
    )?;
    Ok(connection)
}

fn is_corruption(err: &SqliteError) -> bool {
    match err {
        SqliteError::SqliteFailure(code, _) => {
            matches!(code.code, ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
        }
        _ => false,
    }
}

fn quarantine(path: &Path) -> AppResult<PathBuf> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "geocoding_cache".into());
    let target = path.with_file_name(format!(
        "{file_name}.corrupt-{}",
        Utc::now().format("%Y%m%d%H%M%S")
    ));
    fs::rename(path, &target)?;
    for suffix in ["-wal", "-shm"] {
        let sidecar = path.with_file_name(format!("{file_name}{suffix}"));
        if sidecar.exists() {
            let _ = fs::remove_file(sidecar);
        }
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;

    #[derive(Default)]
    struct FlakyStore {
        fail_saves: AtomicBool,
        saved: Mutex<HashMap<String, LookupOutcome>>,
    }

    impl CacheStore for Arc<FlakyStore> {
        fn load(&self) -> AppResult<HashMap<String, LookupOutcome>> {
            Err(AppError::Parse("garbled cache".into()))
        }

        fn save(&self, entries: &[(String, LookupOutcome)]) -> AppResult<()> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(AppError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "simulated disk full",
                )));
            }
            let mut saved = self.saved.lock();
            for (key, outcome) in entries {
                saved.insert(key.clone(), *outcome);
            }
            Ok(())
        }
    }

    fn resolved(latitude: f64, longitude: f64) -> LookupOutcome {
        LookupOutcome::Resolved {
            latitude,
            longitude,
        }
    }

    #[test]
    fn returns_what_was_put() {
        let cache = ResultCache::in_memory();
        assert!(cache.get("Maadi").is_none());
        cache.put("Maadi", resolved(29.96, 31.25));
        cache.put("Nowhere", LookupOutcome::Failed);
        assert_eq!(cache.get("Maadi"), Some(resolved(29.96, 31.25)));
        assert_eq!(cache.get("Nowhere"), Some(LookupOutcome::Failed));
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.failed_count(), 1);
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert_eq!(
            LookupOutcome::from_coordinates(Coordinates::new(91.0, 0.0)),
            LookupOutcome::Failed
        );
        assert_eq!(
            LookupOutcome::from_coordinates(Coordinates::new(0.0, f64::NAN)),
            LookupOutcome::Failed
        );
        assert!(LookupOutcome::from_coordinates(Coordinates::new(-90.0, 180.0)).is_resolved());
    }

    #[test]
    fn persists_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.sqlite3");
        {
            let cache = ResultCache::new(Box::new(SqliteCacheStore::open(&path).unwrap()));
            cache.load();
            cache.put("Zamalek", resolved(30.06, 31.22));
            cache.put("Atlantis", LookupOutcome::Failed);
            assert_eq!(cache.try_flush().unwrap(), 2);
            assert_eq!(cache.try_flush().unwrap(), 0);
        }

        let cache = ResultCache::new(Box::new(SqliteCacheStore::open(&path).unwrap()));
        cache.load();
        assert_eq!(cache.get("Zamalek"), Some(resolved(30.06, 31.22)));
        assert_eq!(cache.get("Atlantis"), Some(LookupOutcome::Failed));
    }

    #[test]
    fn unreadable_store_starts_empty() {
        let store = Arc::new(FlakyStore::default());
        let cache = ResultCache::new(Box::new(Arc::clone(&store)));
        cache.load();
        assert!(cache.is_empty());
    }

    #[test]
    fn failed_flush_keeps_entries_pending() {
        let store = Arc::new(FlakyStore::default());
        store.fail_saves.store(true, Ordering::SeqCst);
        let cache = ResultCache::new(Box::new(Arc::clone(&store)));
        cache.put("Dokki", resolved(30.03, 31.21));

        cache.flush();
        assert_eq!(cache.pending_writes(), 1);
        assert_eq!(cache.get("Dokki"), Some(resolved(30.03, 31.21)));

        store.fail_saves.store(false, Ordering::SeqCst);
        assert_eq!(cache.try_flush().unwrap(), 1);
        assert_eq!(cache.pending_writes(), 0);
        assert!(store.saved.lock().contains_key("Dokki"));
    }

    #[test]
    fn quarantines_garbage_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.sqlite3");
        fs::write(&path, vec![0xAB_u8; 8192]).unwrap();

        let store = SqliteCacheStore::open(&path).unwrap();
        assert!(store.load().unwrap().is_empty());
        let quarantined = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".corrupt-"))
            .count();
        assert_eq!(quarantined, 1);
    }

    #[test]
    fn purges_failed_entries() {
        let dir = tempdir().unwrap();
        let store = SqliteCacheStore::open(dir.path().join("cache.sqlite3")).unwrap();
        store
            .save(&[
                ("Giza".to_string(), resolved(30.01, 31.20)),
                ("Mars".to_string(), LookupOutcome::Failed),
            ])
            .unwrap();
        assert_eq!(store.counts().unwrap(), (1, 1));
        assert_eq!(store.purge_failed().unwrap(), 1);
        assert_eq!(store.counts().unwrap(), (1, 0));
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let cache = Arc::new(ResultCache::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        cache.put(format!("w{worker}-{i}"), LookupOutcome::Failed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.size(), 2000);
    }
}

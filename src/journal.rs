use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::errors::AppResult;

/// Append-only JSONL record of what a run did. Events queue in memory and hit
/// the disk on [`RunJournal::flush`]; a journal that cannot be written never
/// stops the run.
pub struct RunJournal {
    queue: Mutex<Vec<JournalEvent>>,
    path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct JournalEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl JournalEvent {
    fn new(name: String, payload: serde_json::Value) -> Self {
        Self {
            name,
            timestamp: Utc::now(),
            payload,
        }
    }
}

impl RunJournal {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            path: Some(path.as_ref().to_path_buf()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, name: impl Into<String>, payload: serde_json::Value) {
        if self.path.is_none() {
            return;
        }
        self.queue.lock().push(JournalEvent::new(name.into(), payload));
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn flush(&self) {
        if let Err(err) = self.try_flush() {
            warn!(target: "journal", error = %err, "failed to write run journal");
        }
    }

    /// On failure the queued events are kept for the next attempt.
    pub fn try_flush(&self) -> AppResult<usize> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            return Ok(0);
        }

        let mut encoded = Vec::new();
        for event in queue.iter() {
            serde_json::to_writer(&mut encoded, event)?;
            encoded.push(b'\n');
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&encoded)?;
        file.flush()?;

        let written = queue.len();
        queue.clear();
        Ok(written)
    }
}

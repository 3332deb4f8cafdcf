use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::lookup::LookupStats;
use crate::progress::RunStats;
use crate::runner::RunState;

pub const FAILED_SAMPLE_SIZE: usize = 10;

/// Everything worth telling the operator once a run stops.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub state: RunState,
    pub stats: RunStats,
    pub lookups: LookupStats,
    pub cache_entries: usize,
    pub resolved_rows: usize,
    pub failed_sample: Vec<String>,
    pub failed_remaining: usize,
    pub save_failures: usize,
    pub elapsed: Duration,
    pub batch_size: usize,
    pub request_delay: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn failed_total(&self) -> usize {
        self.failed_sample.len() + self.failed_remaining
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(80);
        writeln!(f, "{rule}")?;
        match self.state {
            RunState::Completed => writeln!(f, "GEOCODING COMPLETED")?,
            RunState::Interrupted => writeln!(f, "GEOCODING INTERRUPTED - partial results saved")?,
            RunState::Aborted => writeln!(f, "GEOCODING ABORTED")?,
            other => writeln!(f, "GEOCODING STOPPED ({})", other.as_str())?,
        }
        writeln!(f, "{rule}")?;

        writeln!(
            f,
            "Processed: {}/{} addresses ({:.1}%)",
            format_number(self.stats.processed),
            format_number(self.stats.total),
            self.stats.percentage_complete()
        )?;
        writeln!(
            f,
            "Successfully geocoded: {} ({:.2}%)",
            format_number(self.stats.succeeded),
            self.stats.success_rate()
        )?;
        writeln!(f, "Failed addresses: {}", format_number(self.stats.failed))?;
        writeln!(
            f,
            "Batches: {}/{}",
            self.stats.current_batch, self.stats.total_batches
        )?;

        if !self.failed_sample.is_empty() {
            writeln!(
                f,
                "\nSample failed addresses (showing up to {FAILED_SAMPLE_SIZE}):"
            )?;
            for (idx, address) in self.failed_sample.iter().enumerate() {
                writeln!(f, "  {}. {}", idx + 1, address)?;
            }
            if self.failed_remaining > 0 {
                writeln!(f, "  ... and {} more", format_number(self.failed_remaining))?;
            }
        }

        writeln!(f, "\nCache entries: {}", format_number(self.cache_entries))?;
        writeln!(
            f,
            "Lookups: {} cache hits, {} external calls, {} failed calls",
            format_number(self.lookups.cache_hits),
            format_number(self.lookups.external_calls),
            format_number(self.lookups.failed_calls)
        )?;
        if self.save_failures > 0 {
            writeln!(f, "Result saves that failed: {}", self.save_failures)?;
        }
        writeln!(
            f,
            "Batch size: {} | Delay between requests: {:.2}s",
            format_number(self.batch_size),
            self.request_delay.as_secs_f64()
        )?;
        writeln!(f, "Elapsed: {}", format_duration(self.elapsed))?;
        write!(f, "{rule}")
    }
}

pub fn format_number(value: usize) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}

pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs_f64();
    if seconds < 60.0 {
        format!("{seconds:.1} seconds")
    } else if seconds < 3600.0 {
        format!("{:.1} minutes", seconds / 60.0)
    } else if seconds < 86400.0 {
        format!("{:.1} hours", seconds / 3600.0)
    } else {
        format!("{:.1} days", seconds / 86400.0)
    }
}

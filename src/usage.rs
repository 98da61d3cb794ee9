//! Usage counters embedded into release audit entries.
//!
//! Telemetry is collected elsewhere; this module only records increments to
//! a JSONL file and reduces the most recent records to totals.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Default number of trailing records folded into a summary.
pub const DEFAULT_SUMMARY_WINDOW: usize = 200;

/// Longest note kept on a usage record.
const MAX_NOTE_CHARS: usize = 80;

/// Errors from the usage log.
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    /// The log file could not be read or written.
    #[error("usage log io error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A record could not be rendered.
    #[error("failed to serialize usage record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A counter name is not one of the known kinds.
    #[error("unknown usage kind: {0}")]
    UnknownKind(String),

    /// The record lock was poisoned.
    #[error("usage log lock poisoned")]
    LockPoisoned,
}

/// Named counter kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    /// API operations.
    Operation,
    /// Messages routed.
    Message,
    /// Query units consumed.
    QueryUnit,
}

impl FromStr for UsageKind {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operation" => Ok(Self::Operation),
            "message" => Ok(Self::Message),
            "query_unit" => Ok(Self::QueryUnit),
            other => Err(UsageError::UnknownKind(other.to_owned())),
        }
    }
}

/// Totals per counter kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    /// Operation total.
    pub operation: u64,
    /// Message total.
    pub message: u64,
    /// Query unit total.
    pub query_unit: u64,
}

impl UsageCounters {
    fn add(&mut self, kind: UsageKind, count: u64) {
        let slot = match kind {
            UsageKind::Operation => &mut self.operation,
            UsageKind::Message => &mut self.message,
            UsageKind::QueryUnit => &mut self.query_unit,
        };
        *slot = slot.saturating_add(count);
    }
}

/// Read-only source of a usage snapshot.
pub trait UsageSource: Send + Sync {
    /// Current totals. Sources that cannot be read report zeros.
    fn snapshot(&self) -> UsageCounters;
}

/// Source that always reports the same counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedUsage(pub UsageCounters);

impl UsageSource for FixedUsage {
    fn snapshot(&self) -> UsageCounters {
        self.0
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UsageRecord {
    ts: String,
    kind: UsageKind,
    count: u64,
    #[serde(default)]
    note: String,
}

/// JSONL usage log: one `{ts, kind, count, note}` record per line.
#[derive(Debug)]
pub struct UsageLog {
    path: PathBuf,
    window: usize,
    lock: Mutex<()>,
}

impl UsageLog {
    /// Usage log at `path`, summarizing the last [`DEFAULT_SUMMARY_WINDOW`] records.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            window: DEFAULT_SUMMARY_WINDOW,
            lock: Mutex::new(()),
        }
    }

    /// Change how many trailing records a summary covers.
    #[must_use]
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one increment. Notes are cut to 80 characters.
    ///
    /// # Errors
    ///
    /// Returns an IO or serialization error.
    pub fn record(&self, kind: UsageKind, count: u64, note: &str) -> Result<(), UsageError> {
        let record = UsageRecord {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            kind,
            count,
            note: note.chars().take(MAX_NOTE_CHARS).collect(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let io_err = |source: std::io::Error| UsageError::Io {
            path: self.path.clone(),
            source,
        };
        let _guard = self.lock.lock().map_err(|_| UsageError::LockPoisoned)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)?;
        trace!(kind = ?kind, count, "usage recorded");
        Ok(())
    }

    /// Totals over the last `window` records. Malformed lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file exists but cannot be read.
    pub fn summarize(&self) -> Result<UsageCounters, UsageError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(UsageCounters::default())
            }
            Err(source) => {
                return Err(UsageError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(self.window);
        let mut totals = UsageCounters::default();
        for line in lines.iter().skip(start) {
            match serde_json::from_str::<UsageRecord>(line) {
                Ok(record) => totals.add(record.kind, record.count),
                Err(e) => debug!(error = %e, "skipping malformed usage record"),
            }
        }
        Ok(totals)
    }
}

impl UsageSource for UsageLog {
    fn snapshot(&self) -> UsageCounters {
        match self.summarize() {
            Ok(totals) => totals,
            Err(e) => {
                warn!(error = %e, "usage summary unavailable, reporting zeros");
                UsageCounters::default()
            }
        }
    }
}

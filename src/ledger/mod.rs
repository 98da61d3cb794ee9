//! Append-only, hash-chained audit ledger.
//!
//! Each entry is one JSON line holding `timestamp`, `prev_hash`, `payload`
//! and `entry_hash`, where `entry_hash` is the SHA-256 of the canonical JSON
//! of the other three fields. `prev_hash` is the previous entry's hash
//! (`null` for the first entry), so the file is a singly linked list by hash.
//!
//! The hash of the latest entry is also kept in a small head file,
//! `{"head_hash": .., "updated_at": ..}`, replaced atomically on every
//! append. A single process writes a given ledger; appends inside that
//! process are serialized by an internal mutex.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::canonical;

mod verify;

pub use verify::{verify_chain, ChainReport, EntryStatus, HeadStatus};

/// Errors from ledger storage.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Reading or writing a ledger file failed.
    #[error("ledger io error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// An entry or head record could not be rendered.
    #[error("failed to serialize ledger record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A stored record is not valid JSON of the expected shape.
    #[error("corrupt ledger record in {path}: {reason}")]
    Corrupt {
        /// File involved.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// A previous append panicked while holding the append lock.
    #[error("ledger append lock poisoned")]
    LockPoisoned,
}

/// One record of the audit chain.
///
/// Parsing is strict: unknown keys are rejected and `prev_hash` must be
/// present (as `null` for the first entry), so no byte outside the hashed
/// content can change without the line failing to load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditEntry {
    /// RFC 3339 UTC append time, non-decreasing within a ledger.
    pub timestamp: String,
    /// Hash of the previous entry; `None` for the first entry.
    #[serde(deserialize_with = "present_or_null")]
    pub prev_hash: Option<String>,
    /// Caller-supplied record.
    pub payload: serde_json::Value,
    /// SHA-256 over the canonical form of the fields above.
    pub entry_hash: String,
}

impl AuditEntry {
    /// Recompute the content hash, ignoring the stored `entry_hash`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be rendered.
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        content_hash(&self.timestamp, self.prev_hash.as_deref(), &self.payload)
    }
}

/// `Option` field that must appear in the input, possibly as `null`.
fn present_or_null<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)
}

fn content_hash(
    timestamp: &str,
    prev_hash: Option<&str>,
    payload: &serde_json::Value,
) -> Result<String, serde_json::Error> {
    canonical::digest_of(&json!({
        "timestamp": timestamp,
        "prev_hash": prev_hash,
        "payload": payload,
    }))
}

/// Persisted pointer to the latest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    /// `entry_hash` of the most recently appended entry.
    pub head_hash: String,
    /// When the head was last moved.
    pub updated_at: String,
}

#[derive(Debug, Default)]
struct AppendState {
    last_timestamp: Option<DateTime<Utc>>,
}

/// Ledger owning its entry file and head file.
#[derive(Debug)]
pub struct AuditLedger {
    ledger_path: PathBuf,
    head_path: PathBuf,
    state: Mutex<AppendState>,
}

impl AuditLedger {
    /// Open (or prepare to create) a ledger, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] if a parent directory cannot be created.
    pub fn open(
        ledger_path: impl Into<PathBuf>,
        head_path: impl Into<PathBuf>,
    ) -> Result<Self, LedgerError> {
        let ledger_path = ledger_path.into();
        let head_path = head_path.into();
        for path in [&ledger_path, &head_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        Ok(Self {
            ledger_path,
            head_path,
            state: Mutex::new(AppendState::default()),
        })
    }

    /// Path of the JSONL entry file.
    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    /// Path of the head record.
    pub fn head_path(&self) -> &Path {
        &self.head_path
    }

    /// Append a payload and return the new entry's hash.
    ///
    /// The entry line is flushed and synced before the head moves, so a
    /// crash can leave the head one entry behind but never ahead. If the
    /// line or the head cannot be written the entry file is cut back to its
    /// previous length, so the next append still links to the stored head.
    ///
    /// # Errors
    ///
    /// Returns an IO, serialization, corrupt-head, or lock error. Nothing is
    /// written when the head cannot be read.
    pub fn append(&self, payload: serde_json::Value) -> Result<String, LedgerError> {
        let mut state = self.state.lock().map_err(|_| LedgerError::LockPoisoned)?;

        let head = self.read_chain_head()?;
        if state.last_timestamp.is_none() {
            // Pick up where a previous process left off.
            state.last_timestamp = head
                .as_ref()
                .and_then(|h| DateTime::parse_from_rfc3339(&h.updated_at).ok())
                .map(|t| t.with_timezone(&Utc));
        }
        let prev_hash = head.map(|h| h.head_hash);
        let now = Utc::now().trunc_subsecs(3);
        let now = match state.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);

        let entry_hash = content_hash(&timestamp, prev_hash.as_deref(), &payload)?;
        let entry = AuditEntry {
            timestamp: timestamp.clone(),
            prev_hash,
            payload,
            entry_hash: entry_hash.clone(),
        };

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let committed_len = self.entry_file_len()?;
        let written = self.append_line(&line).and_then(|()| {
            self.write_head(&ChainHead {
                head_hash: entry_hash.clone(),
                updated_at: timestamp,
            })
        });
        if let Err(e) = written {
            if let Err(rollback) = self.truncate_entries(committed_len) {
                warn!(error = %rollback, "failed to roll back unlinked ledger entry");
            }
            return Err(e);
        }
        state.last_timestamp = Some(now);

        info!(entry_hash = %entry_hash, "ledger entry appended");
        Ok(entry_hash)
    }

    /// Hash of the latest entry, or `None` for an empty ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the head file exists but is unreadable.
    pub fn read_head(&self) -> Result<Option<String>, LedgerError> {
        Ok(self.read_chain_head()?.map(|head| head.head_hash))
    }

    /// Full head record, or `None` if no entry has been appended yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the head file exists but is unreadable.
    pub fn read_chain_head(&self) -> Result<Option<ChainHead>, LedgerError> {
        let text = match fs::read_to_string(&self.head_path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: self.head_path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| LedgerError::Corrupt {
                path: self.head_path.clone(),
                reason: e.to_string(),
            })
    }

    /// Load every entry in append order.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Corrupt`] on the first line that does not
    /// parse; use [`AuditLedger::verify`] to inspect damaged ledgers.
    pub fn load(&self) -> Result<Vec<AuditEntry>, LedgerError> {
        self.read_records()?
            .into_iter()
            .enumerate()
            .map(|(i, record)| {
                record.map_err(|reason| LedgerError::Corrupt {
                    path: self.ledger_path.clone(),
                    reason: format!("line {}: {reason}", i.saturating_add(1)),
                })
            })
            .collect()
    }

    /// Last `n` entries, oldest first.
    ///
    /// # Errors
    ///
    /// Same as [`AuditLedger::load`].
    pub fn tail(&self, n: usize) -> Result<Vec<AuditEntry>, LedgerError> {
        let mut entries = self.load()?;
        let skip = entries.len().saturating_sub(n);
        Ok(entries.split_off(skip))
    }

    /// Verify content hashes, linkage from the genesis sentinel, and that
    /// the persisted head matches the last entry.
    ///
    /// # Errors
    ///
    /// Returns an error only when files cannot be read; tampering is
    /// reported through the [`ChainReport`].
    pub fn verify(&self) -> Result<ChainReport, LedgerError> {
        let records = self.read_records()?;
        let mut report = verify::check_records(&records, None);
        match self.read_chain_head() {
            Ok(head) => report.check_head(head.map(|h| h.head_hash)),
            Err(LedgerError::Corrupt { reason, .. }) => report.mark_head_unreadable(reason),
            Err(e) => return Err(e),
        }
        debug!(entries = records.len(), intact = report.is_intact(), "ledger verified");
        Ok(report)
    }

    fn read_records(&self) -> Result<Vec<Result<AuditEntry, String>>, LedgerError> {
        let bytes = match fs::read(&self.ledger_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: self.ledger_path.clone(),
                    source,
                })
            }
        };
        Ok(bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .map(|line| serde_json::from_slice::<AuditEntry>(line).map_err(|e| e.to_string()))
            .collect())
    }

    fn entry_file_len(&self) -> Result<u64, LedgerError> {
        match fs::metadata(&self.ledger_path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(source) => Err(LedgerError::Io {
                path: self.ledger_path.clone(),
                source,
            }),
        }
    }

    fn truncate_entries(&self, len: u64) -> Result<(), LedgerError> {
        let io_err = |source: std::io::Error| LedgerError::Io {
            path: self.ledger_path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .write(true)
            .open(&self.ledger_path)
            .map_err(io_err)?;
        file.set_len(len).map_err(io_err)?;
        file.sync_data().map_err(io_err)
    }

    fn append_line(&self, line: &str) -> Result<(), LedgerError> {
        let io_err = |source: std::io::Error| LedgerError::Io {
            path: self.ledger_path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.ledger_path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        file.sync_data().map_err(io_err)
    }

    /// Write the head to a temp file, then rename it over the real one so
    /// readers never see a partial record.
    fn write_head(&self, head: &ChainHead) -> Result<(), LedgerError> {
        let json = serde_json::to_string_pretty(head)?;
        let tmp_path = self.head_path.with_extension("json.tmp");
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| LedgerError::Io { path, source }
        };

        let mut tmp = fs::File::create(&tmp_path).map_err(io_err(&tmp_path))?;
        tmp.write_all(json.as_bytes()).map_err(io_err(&tmp_path))?;
        tmp.sync_all().map_err(io_err(&tmp_path))?;
        drop(tmp);

        fs::rename(&tmp_path, &self.head_path).map_err(io_err(&self.head_path))
    }
}

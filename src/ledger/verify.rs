//! Chain verification.
//!
//! Verification never repairs. Once an entry fails, every later entry is
//! reported as [`EntryStatus::AfterBreak`]: its own hash may be fine, but it
//! is anchored to something that can no longer be trusted.

use serde::Serialize;

use super::AuditEntry;

/// Verification result for one stored entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryStatus {
    /// Hash and link both check out.
    Valid,
    /// The stored `entry_hash` does not match the content.
    HashMismatch {
        /// Hash stored in the entry.
        stored: String,
        /// Hash recomputed from the content.
        computed: String,
    },
    /// `prev_hash` does not point at the previous entry.
    BrokenLink {
        /// Hash the link should carry.
        expected: Option<String>,
        /// Hash the link carries.
        found: Option<String>,
    },
    /// The line is not a ledger entry.
    Unparseable {
        /// Parser message.
        reason: String,
    },
    /// An earlier entry failed.
    AfterBreak,
}

impl EntryStatus {
    /// Whether this entry verified.
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Agreement between the head file and the last entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HeadStatus {
    /// Head was not checked (in-memory verification).
    Unchecked,
    /// Head is absent and the ledger is empty.
    Empty,
    /// Head equals the last entry's hash.
    Matches,
    /// Head and last entry disagree.
    Mismatch {
        /// Hash recorded in the head file.
        head: Option<String>,
        /// Hash of the last stored entry.
        last_entry: Option<String>,
    },
    /// Head file could not be parsed.
    Unreadable {
        /// Parser message.
        reason: String,
    },
}

/// Per-entry verification report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    /// One status per stored line, in order.
    pub entries: Vec<EntryStatus>,
    /// Head pointer check.
    pub head: HeadStatus,
    #[serde(skip)]
    last_hash: Option<String>,
}

impl ChainReport {
    /// True when every entry is valid and the head (if checked) agrees.
    pub fn is_intact(&self) -> bool {
        self.entries.iter().all(EntryStatus::is_valid)
            && matches!(
                self.head,
                HeadStatus::Unchecked | HeadStatus::Empty | HeadStatus::Matches
            )
    }

    /// Index and status of the first failing entry.
    pub fn first_break(&self) -> Option<(usize, &EntryStatus)> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, status)| !status.is_valid())
    }

    /// Number of entries checked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries were checked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(super) fn check_head(&mut self, head: Option<String>) {
        self.head = match (&head, &self.last_hash) {
            (None, None) if self.entries.is_empty() => HeadStatus::Empty,
            (Some(h), Some(last)) if h == last => HeadStatus::Matches,
            _ => HeadStatus::Mismatch {
                head,
                last_entry: self.last_hash.clone(),
            },
        };
    }

    pub(super) fn mark_head_unreadable(&mut self, reason: String) {
        self.head = HeadStatus::Unreadable { reason };
    }
}

/// Verify a loaded sequence of entries.
///
/// `anchor` is the hash the first entry must link to: `None` for a chain
/// starting at genesis, or the last trusted hash when verifying a segment.
pub fn verify_chain(entries: &[AuditEntry], anchor: Option<&str>) -> ChainReport {
    let records: Vec<Result<AuditEntry, String>> = entries.iter().cloned().map(Ok).collect();
    check_records(&records, anchor)
}

pub(super) fn check_records(
    records: &[Result<AuditEntry, String>],
    anchor: Option<&str>,
) -> ChainReport {
    let mut statuses = Vec::with_capacity(records.len());
    let mut expected_prev = anchor.map(str::to_owned);
    let mut broken = false;
    let mut last_hash = None;

    for record in records {
        let status = match record {
            _ if broken => EntryStatus::AfterBreak,
            Err(reason) => EntryStatus::Unparseable {
                reason: reason.clone(),
            },
            Ok(entry) => check_entry(entry, expected_prev.as_deref()),
        };
        if let Ok(entry) = record {
            expected_prev = Some(entry.entry_hash.clone());
            last_hash = Some(entry.entry_hash.clone());
        } else {
            last_hash = None;
        }
        broken = broken || !status.is_valid();
        statuses.push(status);
    }

    ChainReport {
        entries: statuses,
        head: HeadStatus::Unchecked,
        last_hash,
    }
}

fn check_entry(entry: &AuditEntry, expected_prev: Option<&str>) -> EntryStatus {
    let computed = match entry.compute_hash() {
        Ok(hash) => hash,
        Err(e) => {
            return EntryStatus::Unparseable {
                reason: e.to_string(),
            }
        }
    };
    if computed != entry.entry_hash {
        return EntryStatus::HashMismatch {
            stored: entry.entry_hash.clone(),
            computed,
        };
    }
    if entry.prev_hash.as_deref() != expected_prev {
        return EntryStatus::BrokenLink {
            expected: expected_prev.map(str::to_owned),
            found: entry.prev_hash.clone(),
        };
    }
    EntryStatus::Valid
}

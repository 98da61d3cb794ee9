//! Detection of modified ledgers.

use std::fs;

use aegis::ledger::{AuditLedger, EntryStatus, HeadStatus};
use serde_json::json;

fn ledger_with(dir: &tempfile::TempDir, n: usize) -> AuditLedger {
    let ledger = AuditLedger::open(
        dir.path().join("ledger.jsonl"),
        dir.path().join("ledger.head.json"),
    )
    .expect("ledger should open");
    for seq in 0..n {
        ledger
            .append(json!({ "note": format!("entry-{seq}"), "seq": seq }))
            .expect("append");
    }
    ledger
}

#[test]
fn edited_payload_breaks_entry_and_successors() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ledger = ledger_with(&tmp, 5);

    let text = fs::read_to_string(ledger.ledger_path()).expect("read");
    fs::write(ledger.ledger_path(), text.replace("entry-2", "entry-Z")).expect("write");

    let report = ledger.verify().expect("verify");
    assert!(!report.is_intact());
    assert!(report.entries[0].is_valid());
    assert!(report.entries[1].is_valid());
    assert!(matches!(report.entries[2], EntryStatus::HashMismatch { .. }));
    assert_eq!(report.entries[3], EntryStatus::AfterBreak);
    assert_eq!(report.entries[4], EntryStatus::AfterBreak);
    assert_eq!(report.first_break().map(|(i, _)| i), Some(2));
}

/// Byte range of line `index`, newline excluded.
fn line_span(bytes: &[u8], index: usize) -> std::ops::Range<usize> {
    let mut start = 0;
    for _ in 0..index {
        start = bytes[start..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|i| start.saturating_add(i).saturating_add(1))
            .expect("earlier newline");
    }
    let end = bytes[start..]
        .iter()
        .position(|b| *b == b'\n')
        .map(|i| start.saturating_add(i))
        .expect("line newline");
    start..end
}

#[test]
fn any_flipped_byte_in_an_entry_is_caught() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ledger = ledger_with(&tmp, 3);
    let original = fs::read(ledger.ledger_path()).expect("read");

    for line in 0..2 {
        for offset in line_span(&original, line) {
            let mut tampered = original.clone();
            tampered[offset] ^= 0x01;
            fs::write(ledger.ledger_path(), &tampered).expect("write");

            let report = ledger.verify().expect("verify");
            assert!(!report.is_intact(), "line {line} offset {offset} went unnoticed");
            assert!(
                report.entries.iter().take(line).all(EntryStatus::is_valid),
                "line {line} offset {offset}"
            );
            assert!(
                report.entries.iter().skip(line).all(|s| !s.is_valid()),
                "line {line} offset {offset}"
            );
        }
    }
}

#[test]
fn genesis_entry_must_spell_out_null_prev_hash() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ledger = ledger_with(&tmp, 2);
    let text = fs::read_to_string(ledger.ledger_path()).expect("read");
    assert!(text.contains("\"prev_hash\":null"));

    for edited in [
        text.replacen("\"prev_hash\":null,", "", 1),
        text.replacen("\"prev_hash\":null", "\"prev_hasi\":null", 1),
    ] {
        fs::write(ledger.ledger_path(), &edited).expect("write");
        let report = ledger.verify().expect("verify");
        assert!(!report.entries[0].is_valid(), "accepted: {edited}");
        assert_eq!(report.entries[1], EntryStatus::AfterBreak);
        assert!(ledger.load().is_err());
    }
}

#[test]
fn unknown_keys_are_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ledger = ledger_with(&tmp, 1);
    let text = fs::read_to_string(ledger.ledger_path()).expect("read");
    fs::write(
        ledger.ledger_path(),
        text.replacen('{', "{\"extra\":1,", 1),
    )
    .expect("write");

    let report = ledger.verify().expect("verify");
    assert!(!report.entries[0].is_valid());
    assert!(!report.is_intact());
}

#[test]
fn relinked_entry_is_a_broken_link() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ledger = ledger_with(&tmp, 3);
    let mut entries = ledger.load().expect("load");

    entries[1].prev_hash = Some("0".repeat(64));
    entries[1].entry_hash = entries[1].compute_hash().expect("hash");
    let body: String = entries
        .iter()
        .map(|e| format!("{}\n", serde_json::to_string(e).expect("serialize")))
        .collect();
    fs::write(ledger.ledger_path(), body).expect("write");

    let report = ledger.verify().expect("verify");
    assert!(matches!(report.entries[1], EntryStatus::BrokenLink { .. }));
    assert_eq!(report.entries[2], EntryStatus::AfterBreak);
}

#[test]
fn truncated_ledger_disagrees_with_head() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ledger = ledger_with(&tmp, 3);

    let text = fs::read_to_string(ledger.ledger_path()).expect("read");
    let kept: String = text.lines().take(2).map(|l| format!("{l}\n")).collect();
    fs::write(ledger.ledger_path(), kept).expect("write");

    let report = ledger.verify().expect("verify");
    assert!(report.entries.iter().all(EntryStatus::is_valid));
    assert!(matches!(report.head, HeadStatus::Mismatch { .. }));
    assert!(!report.is_intact());
}

#[test]
fn corrupt_head_is_reported_not_fatal() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ledger = ledger_with(&tmp, 2);
    fs::write(ledger.head_path(), "{ not json").expect("write");

    let report = ledger.verify().expect("verify");
    assert!(matches!(report.head, HeadStatus::Unreadable { .. }));
    assert!(!report.is_intact());
    assert!(ledger.append(json!({})).is_err());
}

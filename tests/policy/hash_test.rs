//! Policy fingerprints.

use std::fs;

use aegis::policy::{policy_file_hash, policy_hash, Policy};

fn policy() -> Policy {
    Policy {
        budget_cap: 500.0,
        sla_min: 99.0,
        allow_cross_region: true,
        max_delay_minutes: 30,
    }
}

#[test]
fn hash_is_stable_and_hex() {
    let first = policy_hash(&policy()).expect("hash");
    let second = policy_hash(&policy()).expect("hash");
    assert_eq!(first, second);
    assert_eq!(first.len(), 64);
    assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn any_field_change_moves_the_hash() {
    let base = policy_hash(&policy()).expect("hash");
    let changed = policy_hash(&Policy {
        max_delay_minutes: 31,
        ..policy()
    })
    .expect("hash");
    assert_ne!(base, changed);
}

#[test]
fn file_hash_ignores_key_order() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let a = tmp.path().join("a.json");
    let b = tmp.path().join("b.json");
    fs::write(&a, r#"{"budget_cap": 5, "max_delay_minutes": 10}"#).expect("write");
    fs::write(&b, r#"{"max_delay_minutes":10,"budget_cap":5}"#).expect("write");

    assert_eq!(
        policy_file_hash(&a).expect("hash a"),
        policy_file_hash(&b).expect("hash b")
    );
}

#[test]
fn toml_policy_loads() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("policy.toml");
    fs::write(
        &path,
        "budget_cap = 500.0\nsla_min = 99.0\nallow_cross_region = true\nmax_delay_minutes = 30\n",
    )
    .expect("write");

    let loaded = Policy::from_file(&path).expect("load");
    assert_eq!(loaded, policy());
    assert!(policy_file_hash(&path).is_ok());
}

#[test]
fn missing_file_is_an_io_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let err = policy_file_hash(&tmp.path().join("absent.json"));
    assert!(matches!(err, Err(aegis::policy::PolicyError::Io { .. })));
}

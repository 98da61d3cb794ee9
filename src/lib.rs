//! Aegis: prove-then-release gate.
//!
//! Checks a proposed operational plan against a declarative policy, repairs
//! it when it can, and releases a vault secret only to a caller that presents
//! an attestation proof. Every release decision lands in a hash-chained,
//! append-only ledger that can be verified offline.
//!
//! See `DESIGN.md` for the module map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod canonical;
pub mod config;
pub mod ledger;
pub mod logging;
pub mod policy;
pub mod release;
pub mod retry;
pub mod usage;

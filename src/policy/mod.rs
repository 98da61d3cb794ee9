//! Policy constraint evaluation for proposed plans.
//!
//! A [`Policy`] is a small, closed set of limits. [`evaluate`] checks a
//! [`Plan`] against it in a fixed priority order (budget, delay, data
//! residency, PII) and reports the first violation only. The check is pure:
//! it borrows both inputs and has no hidden state.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::canonical;

pub mod revision;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating policy inputs.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// A policy or plan field is out of range or malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A policy file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// A policy file could not be parsed as TOML or JSON.
    #[error("failed to parse {path}: {reason}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Explicit limits a plan must satisfy before it may proceed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum added cost, in currency units.
    pub budget_cap: f64,
    /// Minimum on-time percentage. Informational; delay models SLA risk.
    pub sla_min: f64,
    /// Whether plan data may leave the EU.
    pub allow_cross_region: bool,
    /// Maximum tolerated delay in minutes.
    pub max_delay_minutes: u32,
}

impl Policy {
    /// Reject non-finite or negative limits.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidInput`] naming the offending field.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if !self.budget_cap.is_finite() || self.budget_cap < 0.0 {
            return Err(PolicyError::InvalidInput(format!(
                "budget_cap must be a finite non-negative amount, got {}",
                self.budget_cap
            )));
        }
        if !self.sla_min.is_finite() || !(0.0..=100.0).contains(&self.sla_min) {
            return Err(PolicyError::InvalidInput(format!(
                "sla_min must be a percentage between 0 and 100, got {}",
                self.sla_min
            )));
        }
        Ok(())
    }

    /// Load a policy document from a TOML or JSON file.
    ///
    /// Files ending in `.toml` are parsed as TOML; everything else as JSON.
    ///
    /// # Errors
    ///
    /// Returns an IO, parse, or validation error.
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let policy: Policy = parse_document(path)?;
        policy.validate()?;
        Ok(policy)
    }
}

/// Data residency of a plan. Unknown labels are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataRegion {
    /// European Union.
    Eu,
    /// United States.
    Us,
    /// Any other region label.
    Other(String),
}

impl DataRegion {
    /// Wire label of the region.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Eu => "EU",
            Self::Us => "US",
            Self::Other(label) => label,
        }
    }
}

impl From<String> for DataRegion {
    fn from(label: String) -> Self {
        match label.as_str() {
            "EU" => Self::Eu,
            "US" => Self::Us,
            _ => Self::Other(label),
        }
    }
}

impl From<DataRegion> for String {
    fn from(region: DataRegion) -> Self {
        match region {
            DataRegion::Other(label) => label,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for DataRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed remediation action.
///
/// Plans are values: revision builds a new plan with the `with_*` methods
/// rather than mutating one in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Route identifier (e.g. "R7").
    pub route: String,
    /// Added cost, in currency units.
    pub added_cost: f64,
    /// Expected delay in minutes.
    pub expected_delay_minutes: u32,
    /// Where the plan's data is processed.
    pub data_region: DataRegion,
    /// Whether the plan touches personal data.
    pub pii_used: bool,
}

impl Plan {
    /// Reject empty routes and non-finite or negative cost.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidInput`] naming the offending field.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.route.trim().is_empty() {
            return Err(PolicyError::InvalidInput("route must not be empty".to_owned()));
        }
        if !self.added_cost.is_finite() || self.added_cost < 0.0 {
            return Err(PolicyError::InvalidInput(format!(
                "added_cost must be a finite non-negative amount, got {}",
                self.added_cost
            )));
        }
        Ok(())
    }

    /// Copy of this plan with a different cost.
    #[must_use]
    pub fn with_added_cost(self, added_cost: f64) -> Self {
        Self { added_cost, ..self }
    }

    /// Copy of this plan with a different delay.
    #[must_use]
    pub fn with_expected_delay(self, expected_delay_minutes: u32) -> Self {
        Self {
            expected_delay_minutes,
            ..self
        }
    }

    /// Copy of this plan with a different data region.
    #[must_use]
    pub fn with_data_region(self, data_region: DataRegion) -> Self {
        Self {
            data_region,
            ..self
        }
    }

    /// Copy of this plan with a different PII flag.
    #[must_use]
    pub fn with_pii_used(self, pii_used: bool) -> Self {
        Self { pii_used, ..self }
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Why a plan passed or failed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VerdictReason {
    /// No rule fired.
    Ok,
    /// `added_cost > budget_cap`.
    BudgetExceeded,
    /// `expected_delay_minutes > max_delay_minutes`.
    DelayExceedsLimit,
    /// Cross-region disallowed and data is outside the EU.
    DataEgressNonEu,
    /// The plan uses PII.
    PiiUsedNotAllowed,
    /// Reason reported by a verifier other than the built-in rules.
    Other(String),
}

impl VerdictReason {
    /// Machine-readable reason label.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ok => "ok",
            Self::BudgetExceeded => "budget_exceeded",
            Self::DelayExceedsLimit => "delay_exceeds_limit",
            Self::DataEgressNonEu => "data_egress_non_eu",
            Self::PiiUsedNotAllowed => "pii_used_not_allowed",
            Self::Other(label) => label,
        }
    }
}

impl From<String> for VerdictReason {
    fn from(label: String) -> Self {
        match label.as_str() {
            "ok" => Self::Ok,
            "budget_exceeded" => Self::BudgetExceeded,
            "delay_exceeds_limit" => Self::DelayExceedsLimit,
            "data_egress_non_eu" => Self::DataEgressNonEu,
            "pii_used_not_allowed" => Self::PiiUsedNotAllowed,
            _ => Self::Other(label),
        }
    }
}

impl From<VerdictReason> for String {
    fn from(reason: VerdictReason) -> Self {
        match reason {
            VerdictReason::Other(label) => label,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compliance decision for one (policy, plan) pair.
///
/// `sat` is derived from the reason, so a satisfied verdict always carries
/// [`VerdictReason::Ok`] and vice versa.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    reason: VerdictReason,
    details: serde_json::Value,
}

impl Verdict {
    /// Satisfied verdict with supporting details.
    pub fn satisfied(details: serde_json::Value) -> Self {
        Self {
            reason: VerdictReason::Ok,
            details,
        }
    }

    /// Verdict for a violation. An [`VerdictReason::Ok`] reason yields a
    /// satisfied verdict.
    pub fn violation(reason: VerdictReason, details: serde_json::Value) -> Self {
        Self { reason, details }
    }

    /// Whether the plan complies.
    pub fn sat(&self) -> bool {
        self.reason == VerdictReason::Ok
    }

    /// First failing rule, or `ok`.
    pub fn reason(&self) -> &VerdictReason {
        &self.reason
    }

    /// Evidence for the reason (offending value and limit).
    pub fn details(&self) -> &serde_json::Value {
        &self.details
    }
}

#[derive(Serialize, Deserialize)]
struct VerdictRecord {
    sat: bool,
    reason: VerdictReason,
    #[serde(default)]
    details: serde_json::Value,
}

impl Serialize for Verdict {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        VerdictRecord {
            sat: self.sat(),
            reason: self.reason.clone(),
            details: self.details.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Verdict {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = VerdictRecord::deserialize(deserializer)?;
        if record.sat != (record.reason == VerdictReason::Ok) {
            return Err(serde::de::Error::custom(format!(
                "inconsistent verdict: sat={} with reason {}",
                record.sat, record.reason
            )));
        }
        Ok(Self {
            reason: record.reason,
            details: record.details,
        })
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a plan against a policy, returning the first violation.
///
/// Rules run in priority order: budget, delay, data residency, PII. Limits
/// are inclusive: a value equal to its limit complies.
pub fn evaluate(policy: &Policy, plan: &Plan) -> Verdict {
    if plan.added_cost > policy.budget_cap {
        return Verdict::violation(
            VerdictReason::BudgetExceeded,
            json!({ "added_cost": plan.added_cost, "cap": policy.budget_cap }),
        );
    }

    if plan.expected_delay_minutes > policy.max_delay_minutes {
        return Verdict::violation(
            VerdictReason::DelayExceedsLimit,
            json!({
                "delay": plan.expected_delay_minutes,
                "limit": policy.max_delay_minutes,
            }),
        );
    }

    if !policy.allow_cross_region && plan.data_region != DataRegion::Eu {
        return Verdict::violation(
            VerdictReason::DataEgressNonEu,
            json!({ "region": plan.data_region.as_str() }),
        );
    }

    if plan.pii_used {
        return Verdict::violation(
            VerdictReason::PiiUsedNotAllowed,
            json!({ "pii_used": true }),
        );
    }

    Verdict::satisfied(json!({ "policy": policy, "plan": plan }))
}

/// Anything that can decide whether a plan satisfies a policy.
///
/// The built-in [`RuleVerifier`] runs [`evaluate`]; deeper verifiers (for
/// example an SMT-backed one) can be swapped in for auto-revision.
pub trait Verifier: Send + Sync {
    /// Produce a verdict for the pair.
    fn verify(&self, policy: &Policy, plan: &Plan) -> Verdict;
}

/// Verifier backed by the fixed rule set in [`evaluate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleVerifier;

impl Verifier for RuleVerifier {
    fn verify(&self, policy: &Policy, plan: &Plan) -> Verdict {
        evaluate(policy, plan)
    }
}

// ---------------------------------------------------------------------------
// Policy fingerprint
// ---------------------------------------------------------------------------

/// SHA-256 fingerprint of a policy's canonical JSON form.
///
/// # Errors
///
/// Returns [`PolicyError::InvalidInput`] if the policy cannot be rendered.
pub fn policy_hash(policy: &Policy) -> Result<String, PolicyError> {
    canonical::digest_of(policy)
        .map_err(|e| PolicyError::InvalidInput(format!("policy is not serializable: {e}")))
}

/// SHA-256 fingerprint of a policy document on disk (TOML or JSON).
///
/// The document is hashed as-is after canonicalization, so any extra
/// sections it carries are part of the fingerprint.
///
/// # Errors
///
/// Returns an IO or parse error.
pub fn policy_file_hash(path: &Path) -> Result<String, PolicyError> {
    let document: serde_json::Value = parse_document(path)?;
    canonical::digest_of(&document).map_err(|e| PolicyError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn parse_document<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, PolicyError> {
    let text = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(&text).map_err(|e| PolicyError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    } else {
        serde_json::from_str(&text).map_err(|e| PolicyError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

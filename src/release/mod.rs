//! Attestation-gated release.
//!
//! One request runs in three stages:
//!
//! 1. The gate call, retried with backoff while it fails transiently. A
//!    definitive denial stops the retries at once.
//! 2. Exactly one audit entry, whatever the outcome. It holds the proof's
//!    digest, never the proof or the secret.
//! 3. The protected action, only if the secret was released and the audit
//!    entry is on disk.

use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::canonical::sha256_hex;
use crate::ledger::{AuditLedger, LedgerError};
use crate::retry::{retry, RetryOutcome, RetryPolicy};
use crate::usage::UsageSource;

pub mod action;
pub mod gate;
pub mod vault;

use action::{ActionError, ProtectedAction};
use gate::{peek_attestation_type, AttestationGate, GateResponse, UNKNOWN_ATTESTATION};
use vault::SecretValue;

/// Audit payload `kind` for release decisions.
pub const RELEASE_AUDIT_KIND: &str = "gated_release";

static SECRET_NAME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-/]{0,127}$").ok());

/// Errors that stop a release before or while it is recorded.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    /// Secret name or proof is malformed. Nothing was recorded.
    #[error("invalid release request: {0}")]
    InvalidInput(String),

    /// The audit entry could not be written. The action did not run.
    #[error("failed to record release decision: {0}")]
    Audit(#[from] LedgerError),

    /// The blocking audit task did not complete.
    #[error("audit task failed: {0}")]
    AuditTask(String),

    /// The protected action ran after release and failed.
    #[error("protected action failed: {0}")]
    Action(#[from] ActionError),
}

/// Machine-readable outcome of a release request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The gate released the secret.
    Released,
    /// The gate answered and refused.
    AttestationDenied,
    /// Every gate call failed transiently.
    RetryExhausted {
        /// Error from the last attempt.
        last_message: String,
    },
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Released => f.write_str("released"),
            Self::AttestationDenied => f.write_str("attestation_denied"),
            Self::RetryExhausted { last_message } => write!(f, "retry_exhausted: {last_message}"),
        }
    }
}

/// Recorded decision for one release request.
#[derive(Debug, Clone)]
pub struct ReleaseDecision {
    /// Correlates logs with the audit entry.
    pub request_id: Uuid,
    /// Why the request ended as it did.
    pub reason: ReleaseReason,
    /// Attestation type reported by the gate or read from the proof.
    pub attestation_type: String,
    /// Gate calls made.
    pub attempts: u32,
    /// Hash of the audit entry recording this decision.
    pub entry_hash: String,
    secret: Option<SecretValue>,
}

impl ReleaseDecision {
    /// Whether the secret was released.
    pub fn released(&self) -> bool {
        self.reason == ReleaseReason::Released
    }

    /// Released secret, if any.
    pub fn secret(&self) -> Option<&SecretValue> {
        self.secret.as_ref()
    }
}

/// Gate, retrier and ledger wired together.
pub struct ReleaseProtocol {
    gate: Arc<dyn AttestationGate>,
    ledger: Arc<AuditLedger>,
    usage: Arc<dyn UsageSource>,
    retry: RetryPolicy,
    policy_hash: Option<String>,
}

impl ReleaseProtocol {
    /// Build a protocol around a gate, ledger and usage source.
    pub fn new(
        gate: Arc<dyn AttestationGate>,
        ledger: Arc<AuditLedger>,
        usage: Arc<dyn UsageSource>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            gate,
            ledger,
            usage,
            retry,
            policy_hash: None,
        }
    }

    /// Stamp audit entries with the fingerprint of the policy in force.
    #[must_use]
    pub fn with_policy_hash(mut self, policy_hash: impl Into<String>) -> Self {
        self.policy_hash = Some(policy_hash.into());
        self
    }

    /// Ask the gate for `secret_name` and record the decision.
    ///
    /// # Errors
    ///
    /// [`ReleaseError::InvalidInput`] for a malformed request (nothing is
    /// recorded), or an audit error if the decision could not be recorded.
    /// Denials and exhausted retries are decisions, not errors.
    pub async fn gated_release(
        &self,
        secret_name: &str,
        proof: &[u8],
    ) -> Result<ReleaseDecision, ReleaseError> {
        validate_request(secret_name, proof)?;
        let request_id = Uuid::new_v4();

        let gate = &self.gate;
        let outcome = retry(&self.retry, |attempt| async move {
            gate.check_and_release(secret_name, proof)
                .await
                .map_err(|e| {
                    warn!(%request_id, attempt, error = %e, "gate call failed");
                    e.to_string()
                })
        })
        .await;

        let attempts = outcome.attempts();
        let (reason, response) = match outcome {
            RetryOutcome::Succeeded { value, .. } if value.released() => {
                (ReleaseReason::Released, value)
            }
            RetryOutcome::Succeeded { value, .. } => (ReleaseReason::AttestationDenied, value),
            RetryOutcome::Exhausted { last_message, .. } => (
                ReleaseReason::RetryExhausted { last_message },
                GateResponse::default(),
            ),
        };
        let attestation_type = response
            .attestation_type
            .clone()
            .or_else(|| peek_attestation_type(proof))
            .unwrap_or_else(|| UNKNOWN_ATTESTATION.to_owned());

        let mut payload = json!({
            "kind": RELEASE_AUDIT_KIND,
            "request_id": request_id.to_string(),
            "secret_name": secret_name,
            "released": reason == ReleaseReason::Released,
            "reason": reason.to_string(),
            "attempts": attempts,
            "attestation_type": attestation_type,
            "proof_digest": sha256_hex(proof),
            "policy_hash": self.policy_hash,
        });

        // Usage sources may read files, so the snapshot joins the append
        // on the blocking pool.
        let ledger = Arc::clone(&self.ledger);
        let usage = Arc::clone(&self.usage);
        let entry_hash = tokio::task::spawn_blocking(move || {
            if let Some(fields) = payload.as_object_mut() {
                fields.insert("usage".to_owned(), json!(usage.snapshot()));
            }
            ledger.append(payload)
        })
        .await
            .map_err(|e| ReleaseError::AuditTask(e.to_string()))??;

        info!(
            %request_id,
            secret_name,
            reason = %reason,
            attempts,
            entry_hash = %entry_hash,
            "release decision recorded"
        );

        Ok(ReleaseDecision {
            request_id,
            reason,
            attestation_type,
            attempts,
            entry_hash,
            secret: response.secret,
        })
    }

    /// Release, record, then run `action` if and only if released.
    ///
    /// # Errors
    ///
    /// Errors from [`ReleaseProtocol::gated_release`], or
    /// [`ReleaseError::Action`] if the action itself fails.
    pub async fn run_protected(
        &self,
        secret_name: &str,
        proof: &[u8],
        action: &dyn ProtectedAction,
    ) -> Result<ReleaseDecision, ReleaseError> {
        let decision = self.gated_release(secret_name, proof).await?;
        if let Some(secret) = decision.secret() {
            action.run(secret_name, secret).await?;
        } else {
            info!(request_id = %decision.request_id, reason = %decision.reason, "protected action blocked");
        }
        Ok(decision)
    }
}

fn validate_request(secret_name: &str, proof: &[u8]) -> Result<(), ReleaseError> {
    let name_ok = SECRET_NAME_RE
        .as_ref()
        .is_some_and(|re| re.is_match(secret_name));
    if !name_ok {
        return Err(ReleaseError::InvalidInput(format!(
            "secret name {secret_name:?} must be 1-128 characters of [A-Za-z0-9_.-/]"
        )));
    }
    if proof.iter().all(u8::is_ascii_whitespace) {
        return Err(ReleaseError::InvalidInput(
            "attestation proof is empty".to_owned(),
        ));
    }
    Ok(())
}

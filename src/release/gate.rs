//! Attestation gate: the trust boundary in front of the vault.
//!
//! The protocol only needs [`AttestationGate`]; a verifying implementation
//! can replace [`VaultGate`] without touching retry or audit logic.
//! [`VaultGate`] checks proof *structure* only (a JWT-shaped token with a
//! readable claims segment, optional type allowlist, `exp` not passed). It
//! does not verify signatures and trusts whoever issued the proof.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::vault::{SecretStore, SecretValue, VaultError};

/// Claim carrying the attestation type label.
pub const ATTESTATION_TYPE_CLAIM: &str = "x-ms-attestation-type";

/// Label used when no attestation type can be read.
pub const UNKNOWN_ATTESTATION: &str = "unknown";

/// Transient gate failures. These are retried; denials are not errors.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The gate or its backing store is temporarily unavailable.
    #[error("gate unavailable: {0}")]
    Unavailable(String),
    /// The vault lookup did not answer within the gate's lookup timeout.
    #[error("gate timed out: {0}")]
    Timeout(String),
}

/// Answer from one gate call.
#[derive(Debug, Clone, Default)]
pub struct GateResponse {
    /// Released secret, or `None` when the gate denied the request.
    pub secret: Option<SecretValue>,
    /// Best-effort attestation type parsed from the proof.
    pub attestation_type: Option<String>,
}

impl GateResponse {
    /// Denial carrying whatever type label was read.
    pub fn denied(attestation_type: Option<String>) -> Self {
        Self {
            secret: None,
            attestation_type,
        }
    }

    /// Whether the gate released a secret.
    pub fn released(&self) -> bool {
        self.secret.is_some()
    }
}

/// Pluggable check-and-release capability.
///
/// Implementations must be idempotent for a given proof: the protocol may
/// call them several times for one request.
#[async_trait]
pub trait AttestationGate: Send + Sync {
    /// Check `proof` and release `secret_name` if it attests.
    async fn check_and_release(
        &self,
        secret_name: &str,
        proof: &[u8],
    ) -> Result<GateResponse, GateError>;
}

/// Decode the claims segment of a compact JWT without verifying it.
///
/// Returns `None` unless the proof has exactly three dot-separated segments
/// and the middle one is base64url JSON object.
pub fn decode_claims(proof: &[u8]) -> Option<serde_json::Map<String, serde_json::Value>> {
    let text = std::str::from_utf8(proof).ok()?.trim();
    let mut segments = text.split('.');
    let (_header, claims, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(claims.trim_end_matches('=')).ok()?;
    match serde_json::from_slice(&bytes).ok()? {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Read the attestation type claim from a JWT-shaped proof.
pub fn peek_attestation_type(proof: &[u8]) -> Option<String> {
    decode_claims(proof)?
        .get(ATTESTATION_TYPE_CLAIM)?
        .as_str()
        .map(str::to_owned)
}

/// Gate releasing secrets from a [`SecretStore`] to structurally valid proofs.
pub struct VaultGate {
    vault: Arc<dyn SecretStore>,
    allowed_types: Vec<String>,
    lookup_timeout: Option<Duration>,
}

impl VaultGate {
    /// Gate accepting any attestation type.
    pub fn new(vault: Arc<dyn SecretStore>) -> Self {
        Self {
            vault,
            allowed_types: Vec::new(),
            lookup_timeout: None,
        }
    }

    /// Only release when the attestation type is one of `types`.
    /// An empty list accepts any type.
    #[must_use]
    pub fn with_allowed_types(mut self, types: Vec<String>) -> Self {
        self.allowed_types = types;
        self
    }

    /// Bound each vault lookup; an overrun is a retryable [`GateError::Timeout`].
    #[must_use]
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = Some(timeout);
        self
    }

    async fn lookup(&self, secret_name: &str) -> Result<Result<SecretValue, VaultError>, GateError> {
        let Some(limit) = self.lookup_timeout else {
            return Ok(self.vault.get_secret(secret_name).await);
        };
        tokio::time::timeout(limit, self.vault.get_secret(secret_name))
            .await
            .map_err(|_| {
                warn!(secret_name, timeout = ?limit, "vault lookup timed out");
                GateError::Timeout(format!(
                    "vault lookup for {secret_name} exceeded {}ms",
                    limit.as_millis()
                ))
            })
    }
}

#[async_trait]
impl AttestationGate for VaultGate {
    async fn check_and_release(
        &self,
        secret_name: &str,
        proof: &[u8],
    ) -> Result<GateResponse, GateError> {
        let Some(claims) = decode_claims(proof) else {
            debug!(secret_name, "proof is not a readable attestation token");
            return Ok(GateResponse::denied(None));
        };
        let attestation_type = claims
            .get(ATTESTATION_TYPE_CLAIM)
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned);

        if let Some(exp) = claims.get("exp").and_then(serde_json::Value::as_i64) {
            if exp < Utc::now().timestamp() {
                debug!(secret_name, exp, "attestation token expired");
                return Ok(GateResponse::denied(attestation_type));
            }
        }

        if !self.allowed_types.is_empty() {
            let allowed = attestation_type
                .as_ref()
                .is_some_and(|t| self.allowed_types.iter().any(|a| a == t));
            if !allowed {
                debug!(
                    secret_name,
                    attestation_type = attestation_type.as_deref().unwrap_or(UNKNOWN_ATTESTATION),
                    "attestation type not allowed"
                );
                return Ok(GateResponse::denied(attestation_type));
            }
        }

        match self.lookup(secret_name).await? {
            Ok(secret) => {
                info!(secret_name, "gate released secret");
                Ok(GateResponse {
                    secret: Some(secret),
                    attestation_type,
                })
            }
            Err(VaultError::NotFound(_)) => {
                debug!(secret_name, "secret not in vault");
                Ok(GateResponse::denied(attestation_type))
            }
            Err(VaultError::AccessError(e)) => Err(GateError::Unavailable(e)),
        }
    }
}

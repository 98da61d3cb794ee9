//! Bounded retry with exponential backoff and jitter.
//!
//! The delay after failed attempt `i` is
//! `min(max_delay, base_delay * 1.5^(i-1)) + U(-jitter, jitter) * base_delay`,
//! floored at [`MIN_DELAY`]. Sleeping uses `tokio::time::sleep`, so a waiting
//! request never blocks other tasks. There is no sleep after the last attempt
//! and no call after a success.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

/// Floor for any backoff delay.
pub const MIN_DELAY: Duration = Duration::from_millis(50);

/// Backoff growth factor between attempts.
const GROWTH: f64 = 1.5;

/// Retry bounds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of calls (0 is treated as 1).
    pub attempts: u32,
    /// Initial delay in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on the exponential part of the delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the base delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay_ms: 300,
            max_delay_ms: 2_000,
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Base delay as a [`Duration`].
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Maximum delay as a [`Duration`].
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay after failed attempt `attempt` (1-based) for a jitter sample
    /// in `[-1.0, 1.0]`, scaled by [`RetryPolicy::jitter`].
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for(&self, attempt: u32, jitter_sample: f64) -> Duration {
        // Millisecond arithmetic keeps the common cases exact.
        let base_ms = self.base_delay_ms as f64;
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let grown_ms = (base_ms * GROWTH.powi(exponent)).min(self.max_delay_ms as f64);
        let jittered_ms = grown_ms + jitter_sample.clamp(-1.0, 1.0) * self.jitter * base_ms;
        let floor_ms = MIN_DELAY.as_millis() as f64;
        let nanos = (jittered_ms.max(floor_ms) * 1_000_000.0).round();
        if nanos.is_finite() && nanos < u64::MAX as f64 {
            Duration::from_nanos(nanos as u64)
        } else {
            self.max_single_delay()
        }
    }

    /// Largest delay any single wait can take.
    pub fn max_single_delay(&self) -> Duration {
        let jitter =
            Duration::try_from_secs_f64(self.base_delay().as_secs_f64() * self.jitter.max(0.0))
                .unwrap_or(Duration::ZERO);
        self.max_delay().saturating_add(jitter).max(MIN_DELAY)
    }

    fn effective_attempts(&self) -> u32 {
        self.attempts.max(1)
    }
}

/// Outcome of [`retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    /// The operation succeeded.
    Succeeded {
        /// Value returned by the successful call.
        value: T,
        /// Calls made, including the successful one.
        attempts: u32,
    },
    /// Every call failed.
    Exhausted {
        /// Calls made.
        attempts: u32,
        /// Message reported by the last failed call.
        last_message: String,
    },
}

impl<T> RetryOutcome<T> {
    /// Calls made.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// Whether the operation eventually succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Caller-facing message: the exhaustion reason, or `None` on success.
    pub fn exhausted_reason(&self) -> Option<String> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Exhausted { last_message, .. } => Some(format!("retry_exhausted: {last_message}")),
        }
    }
}

/// Call `op` until it succeeds or `policy.attempts` calls have failed.
///
/// `op` receives the 1-based attempt number and reports failure with a
/// message, which is kept for the exhaustion reason.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let attempts = policy.effective_attempts();
    let mut last_message = String::new();

    for attempt in 1..=attempts {
        match op(attempt).await {
            Ok(value) => {
                debug!(attempt, "operation succeeded");
                return RetryOutcome::Succeeded { value, attempts: attempt };
            }
            Err(message) => {
                last_message = message;
            }
        }

        if attempt == attempts {
            break;
        }

        let delay = policy.delay_for(attempt, jitter_sample(policy.jitter));
        warn!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %last_message,
            "operation failed, backing off"
        );
        tokio::time::sleep(delay).await;
    }

    RetryOutcome::Exhausted {
        attempts,
        last_message,
    }
}

/// Uniform sample in `[-1, 1]`, or 0 when jitter is disabled.
fn jitter_sample(jitter: f64) -> f64 {
    if jitter > 0.0 {
        rand::thread_rng().gen_range(-1.0..=1.0)
    } else {
        0.0
    }
}

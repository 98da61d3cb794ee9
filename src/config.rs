//! Configuration loading and validation.
//!
//! Loads Aegis configuration from `./aegis.toml` (or `$AEGIS_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Variable naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "AEGIS_CONFIG_PATH";

/// Config file used when [`CONFIG_PATH_ENV`] is unset.
pub const DEFAULT_CONFIG_FILE: &str = "aegis.toml";

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AegisConfig {
    /// Storage locations.
    pub paths: PathsConfig,
    /// Backoff for gate calls.
    pub retry: RetryPolicy,
    /// Auto-revision bounds.
    pub revision: RevisionConfig,
    /// Attestation gate settings.
    pub gate: GateConfig,
    /// Log level and optional log directory.
    pub logging: LoggingConfig,
}

impl AegisConfig {
    /// Load from the config file, apply env overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the resulting values are out of range.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// [`AegisConfig::load`] with an injectable environment.
    ///
    /// # Errors
    ///
    /// Same as [`AegisConfig::load`].
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path = Self::config_path_with(&env);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::debug!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to load {}", path.display()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file found, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        config.apply_overrides(&env);
        config.validate()?;
        Ok(config)
    }

    /// Config file location for the given environment.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env(CONFIG_PATH_ENV).map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from)
    }

    /// Apply `AEGIS_*` overrides. Unparseable numbers are ignored with a warning.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        // Paths.
        if let Some(v) = env("AEGIS_LEDGER_PATH") {
            self.paths.ledger = PathBuf::from(v);
        }
        if let Some(v) = env("AEGIS_HEAD_PATH") {
            self.paths.head = PathBuf::from(v);
        }
        if let Some(v) = env("AEGIS_USAGE_LOG") {
            self.paths.usage_log = PathBuf::from(v);
        }
        if let Some(v) = env("AEGIS_SECRETS_FILE") {
            self.paths.secrets_file = PathBuf::from(v);
        }

        // Numeric bounds.
        if let Some(n) = parse_override(&env, "AEGIS_RETRY_ATTEMPTS") {
            self.retry.attempts = n;
        }
        if let Some(n) = parse_override(&env, "AEGIS_MAX_ATTEMPTS") {
            self.revision.max_attempts = n;
        }
        if let Some(n) = parse_override(&env, "AEGIS_GATE_TIMEOUT_MS") {
            self.gate.lookup_timeout_ms = u64::from(n);
        }

        // Logging.
        if let Some(v) = env("AEGIS_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Parse config from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or has wrongly typed fields.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AegisConfig = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Reject values the retrier or ledger cannot work with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.retry.attempts == 0 {
            bail!("retry.attempts must be at least 1");
        }
        if !self.retry.jitter.is_finite() || self.retry.jitter < 0.0 {
            bail!(
                "retry.jitter must be a non-negative number, got {}",
                self.retry.jitter
            );
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!(
                "retry.base_delay_ms ({}) must not exceed retry.max_delay_ms ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            );
        }
        if self.gate.lookup_timeout_ms == 0 {
            bail!("gate.lookup_timeout_ms must be at least 1");
        }
        if self.paths.ledger == self.paths.head {
            bail!("paths.ledger and paths.head must differ");
        }
        Ok(())
    }
}

fn parse_override(env: impl Fn(&str) -> Option<String>, var: &str) -> Option<u32> {
    let value = env(var)?;
    match value.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(var, value = %value, "ignoring invalid env override");
            None
        }
    }
}

// ── Paths config ────────────────────────────────────────────────

/// Where Aegis keeps its files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Append-only JSONL ledger.
    pub ledger: PathBuf,
    /// Chain head record next to the ledger.
    pub head: PathBuf,
    /// Usage counter log.
    pub usage_log: PathBuf,
    /// Dotenv-style file seeding the vault.
    pub secrets_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            ledger: PathBuf::from("aegis-data/ledger.jsonl"),
            head: PathBuf::from("aegis-data/ledger.head.json"),
            usage_log: PathBuf::from("aegis-data/usage.jsonl"),
            secrets_file: PathBuf::from("aegis-data/secrets.env"),
        }
    }
}

// ── Revision config ─────────────────────────────────────────────

/// Auto-revision bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RevisionConfig {
    /// Attempts used when the request does not name its own.
    pub max_attempts: u32,
}

impl Default for RevisionConfig {
    fn default() -> Self {
        Self { max_attempts: 6 }
    }
}

// ── Gate config ─────────────────────────────────────────────────

/// Attestation gate settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Attestation types allowed to receive secrets. Empty accepts any.
    pub allowed_attestation_types: Vec<String>,
    /// Upper bound on one vault lookup, in milliseconds.
    pub lookup_timeout_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            allowed_attestation_types: Vec::new(),
            lookup_timeout_ms: 5_000,
        }
    }
}

impl GateConfig {
    /// Lookup bound as a [`Duration`].
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

// ── Logging config ──────────────────────────────────────────────

/// Log settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// When set, JSON logs are also written here with daily rotation.
    pub logs_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_owned(),
            logs_dir: None,
        }
    }
}

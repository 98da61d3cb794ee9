//! Aegis CLI entry point.
//!
//! Subcommands evaluate and revise plans (optionally recording the result),
//! run an attestation-gated release, and inspect or extend the audit ledger
//! and usage log. Results go to stdout as JSON;
//! logs go to stderr.
//!
//! Exit status: `0` success, `2` policy denial (UNSAT, denied release,
//! exhausted retries, broken chain), `1` operational or input error.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use aegis::config::AegisConfig;
use aegis::ledger::AuditLedger;
use aegis::policy::revision::auto_revise;
use aegis::policy::{evaluate, policy_file_hash, policy_hash, Plan, Policy};
use aegis::release::action::CommandAction;
use aegis::release::gate::VaultGate;
use aegis::release::vault::{InMemoryVault, SecretStore};
use aegis::release::ReleaseProtocol;
use aegis::usage::{UsageKind, UsageLog};

/// Aegis: prove-then-release gate for operational plans and secrets.
#[derive(Parser)]
#[command(name = "aegis", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Evaluate a plan against a policy.
    Check {
        /// JSON file holding `{policy, plan}`.
        #[arg(long)]
        input: PathBuf,
        /// Append the verdict to the audit ledger.
        #[arg(long)]
        record: bool,
    },
    /// Repair a plan until it complies or attempts run out.
    Revise {
        /// JSON file holding `{policy, plan, max_attempts?}`.
        #[arg(long)]
        input: PathBuf,
        /// Overrides the input file and the configured default.
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Append the outcome to the audit ledger.
        #[arg(long)]
        record: bool,
    },
    /// Release a secret to an attested caller and record the decision.
    Release {
        /// Name of the secret in the vault.
        secret_name: String,
        /// File holding the attestation proof.
        #[arg(long)]
        proof: PathBuf,
        /// Policy file whose fingerprint is stamped on the audit entry.
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Program (and arguments) to run with the released secret.
        #[arg(long, num_args = 1.., allow_hyphen_values = true, value_name = "PROGRAM")]
        exec: Vec<String>,
    },
    /// Inspect the audit ledger.
    Ledger {
        /// Ledger operation.
        #[command(subcommand)]
        command: LedgerCommand,
    },
    /// Print the fingerprint of a policy file (TOML or JSON).
    PolicyHash {
        /// Policy file.
        file: PathBuf,
    },
    /// Record or summarize usage counters.
    Usage {
        /// Usage operation.
        #[command(subcommand)]
        command: UsageCommand,
    },
}

/// Ledger subcommands.
#[derive(Subcommand)]
enum LedgerCommand {
    /// Recompute every hash and link; exit 2 on any break.
    Verify,
    /// Print the chain head record.
    Head,
    /// Print the last entries.
    Tail {
        /// Number of entries.
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },
    /// Append a JSON document as a new entry's payload.
    Append {
        /// File holding the payload.
        #[arg(long)]
        input: PathBuf,
    },
}

/// Usage subcommands.
#[derive(Subcommand)]
enum UsageCommand {
    /// Append one usage record.
    Record {
        /// `operation`, `message` or `query_unit`.
        kind: String,
        /// Amount to add.
        #[arg(long, default_value_t = 1)]
        count: u64,
        /// Free-form note (truncated to 80 characters).
        #[arg(long, default_value = "")]
        note: String,
    },
    /// Print totals over the recent window.
    Summary,
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// Success, SAT, released, or intact.
    Ok,
    /// A policy denial of some kind.
    Denied,
}

impl From<Status> for ExitCode {
    fn from(status: Status) -> Self {
        match status {
            Status::Ok => ExitCode::SUCCESS,
            Status::Denied => ExitCode::from(2),
        }
    }
}

/// Ledger `kind` of a recorded `check`.
const CHECK_AUDIT_KIND: &str = "compliance_check";

/// Ledger `kind` of a recorded `revise`.
const REVISION_AUDIT_KIND: &str = "auto_revision";

/// `{policy, plan}` document read by `check` and `revise`.
#[derive(Debug, Deserialize)]
struct PlanInput {
    policy: Policy,
    plan: Plan,
    #[serde(default)]
    max_attempts: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors are input errors (1), not denials (clap's default is 2).
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let config = match AegisConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let _logging_guard = match &config.logging.logs_dir {
        Some(dir) => match aegis::logging::init_production(dir, &config.logging.level) {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("error: {e:#}");
                return ExitCode::FAILURE;
            }
        },
        None => {
            aegis::logging::init_cli(&config.logging.level);
            None
        }
    };

    match run(cli.command, &config).await {
        Ok(status) => status.into(),
        Err(e) => {
            error!(error = %format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: &AegisConfig) -> anyhow::Result<Status> {
    match command {
        Command::Check { input, record } => handle_check(&input, record, config),
        Command::Revise {
            input,
            max_attempts,
            record,
        } => handle_revise(&input, max_attempts, record, config),
        Command::Release {
            secret_name,
            proof,
            policy,
            exec,
        } => handle_release(&secret_name, &proof, policy.as_deref(), exec, config).await,
        Command::Ledger { command } => handle_ledger(command, config),
        Command::PolicyHash { file } => {
            let hash = policy_file_hash(&file)?;
            println!("{hash}");
            Ok(Status::Ok)
        }
        Command::Usage { command } => handle_usage(command, config),
    }
}

fn handle_check(input: &Path, record: bool, config: &AegisConfig) -> anyhow::Result<Status> {
    let input = read_plan_input(input)?;
    let verdict = evaluate(&input.policy, &input.plan);
    let policy_hash = policy_hash(&input.policy)?;

    let mut report = json!({
        "sat": verdict.sat(),
        "reason": verdict.reason(),
        "details": verdict.details(),
        "policy_hash": policy_hash,
    });
    if record {
        let entry_hash = record_decision(
            config,
            json!({
                "kind": CHECK_AUDIT_KIND,
                "policy_hash": policy_hash,
                "plan": input.plan,
                "verdict": verdict,
            }),
        )?;
        report["entry_hash"] = json!(entry_hash);
    }
    print_json(&report)?;
    Ok(if verdict.sat() {
        Status::Ok
    } else {
        Status::Denied
    })
}

fn handle_revise(
    input: &Path,
    max_attempts: Option<u32>,
    record: bool,
    config: &AegisConfig,
) -> anyhow::Result<Status> {
    let input = read_plan_input(input)?;
    let max_attempts = max_attempts
        .or(input.max_attempts)
        .unwrap_or(config.revision.max_attempts);
    let policy_hash = policy_hash(&input.policy)?;
    let submitted = input.plan.clone();

    let result = auto_revise(&input.policy, input.plan, max_attempts);
    info!(
        outcome = result.outcome.label(),
        attempts = result.attempts,
        "revision finished"
    );
    let mut report = json!({
        "final": result.outcome.label(),
        "attempts": result.attempts,
        "counterexample": result.outcome.counterexample(),
        "plan": result.plan,
        "outcome": result.outcome,
        "history": result.history,
    });
    if record {
        let entry_hash = record_decision(
            config,
            json!({
                "kind": REVISION_AUDIT_KIND,
                "policy_hash": policy_hash,
                "submitted_plan": submitted,
                "plan": result.plan,
                "outcome": result.outcome,
                "attempts": result.attempts,
            }),
        )?;
        report["entry_hash"] = json!(entry_hash);
    }
    print_json(&report)?;
    Ok(if result.outcome.is_sat() {
        Status::Ok
    } else {
        Status::Denied
    })
}

fn record_decision(config: &AegisConfig, payload: serde_json::Value) -> anyhow::Result<String> {
    let ledger = AuditLedger::open(&config.paths.ledger, &config.paths.head)
        .context("failed to open audit ledger")?;
    let entry_hash = ledger.append(payload).context("failed to record decision")?;
    Ok(entry_hash)
}

async fn handle_release(
    secret_name: &str,
    proof_path: &Path,
    policy_path: Option<&Path>,
    exec: Vec<String>,
    config: &AegisConfig,
) -> anyhow::Result<Status> {
    let proof = std::fs::read(proof_path)
        .with_context(|| format!("failed to read proof {}", proof_path.display()))?;

    let vault: Arc<dyn SecretStore> = Arc::new(load_vault(&config.paths.secrets_file)?);
    let gate = VaultGate::new(vault)
        .with_allowed_types(config.gate.allowed_attestation_types.clone())
        .with_lookup_timeout(config.gate.lookup_timeout());
    let ledger = Arc::new(
        AuditLedger::open(&config.paths.ledger, &config.paths.head)
            .context("failed to open audit ledger")?,
    );
    let usage = Arc::new(UsageLog::new(&config.paths.usage_log));

    let mut protocol = ReleaseProtocol::new(Arc::new(gate), ledger, usage, config.retry.clone());
    if let Some(path) = policy_path {
        protocol = protocol.with_policy_hash(policy_file_hash(path)?);
    }

    let decision = match exec.split_first() {
        Some((program, args)) => {
            let action = CommandAction::new(program.clone(), args.to_vec());
            protocol
                .run_protected(secret_name, &proof, &action)
                .await?
        }
        None => protocol.gated_release(secret_name, &proof).await?,
    };

    print_json(&json!({
        "request_id": decision.request_id.to_string(),
        "released": decision.released(),
        "reason": decision.reason.to_string(),
        "attempts": decision.attempts,
        "attestation_type": decision.attestation_type,
        "entry_hash": decision.entry_hash,
    }))?;
    Ok(if decision.released() {
        Status::Ok
    } else {
        Status::Denied
    })
}

fn handle_ledger(command: LedgerCommand, config: &AegisConfig) -> anyhow::Result<Status> {
    let ledger = AuditLedger::open(&config.paths.ledger, &config.paths.head)
        .context("failed to open audit ledger")?;

    match command {
        LedgerCommand::Verify => {
            let report = ledger.verify()?;
            print_json(&report)?;
            if report.is_intact() {
                Ok(Status::Ok)
            } else {
                if let Some((index, status)) = report.first_break() {
                    warn!(index, status = ?status, "ledger chain is broken");
                }
                Ok(Status::Denied)
            }
        }
        LedgerCommand::Head => {
            print_json(&ledger.read_chain_head()?)?;
            Ok(Status::Ok)
        }
        LedgerCommand::Tail { count } => {
            for entry in ledger.tail(count)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
            Ok(Status::Ok)
        }
        LedgerCommand::Append { input } => {
            let text = std::fs::read_to_string(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let payload: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", input.display()))?;
            let entry_hash = ledger.append(payload)?;
            print_json(&json!({ "entry_hash": entry_hash }))?;
            Ok(Status::Ok)
        }
    }
}

fn handle_usage(command: UsageCommand, config: &AegisConfig) -> anyhow::Result<Status> {
    let log = UsageLog::new(&config.paths.usage_log);
    match command {
        UsageCommand::Record { kind, count, note } => {
            let kind: UsageKind = kind.parse()?;
            log.record(kind, count, &note)?;
        }
        UsageCommand::Summary => {
            print_json(&log.summarize()?)?;
        }
    }
    Ok(Status::Ok)
}

fn read_plan_input(path: &Path) -> anyhow::Result<PlanInput> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let input: PlanInput = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    input.policy.validate()?;
    input.plan.validate()?;
    Ok(input)
}

/// A missing secrets file yields an empty vault, so every release is denied.
fn load_vault(path: &Path) -> anyhow::Result<InMemoryVault> {
    if path.exists() {
        Ok(InMemoryVault::from_env_file(path)?)
    } else {
        warn!(path = %path.display(), "secrets file not found, vault is empty");
        Ok(InMemoryVault::new())
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

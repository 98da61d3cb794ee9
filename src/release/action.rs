//! The action a successful release unlocks.

use async_trait::async_trait;
use tracing::info;

use super::vault::SecretValue;

/// Environment variable carrying the released secret into a [`CommandAction`].
pub const SECRET_ENV_VAR: &str = "AEGIS_SECRET_VALUE";

/// Errors from running the protected action.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// The program could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The program ran and reported failure.
    #[error("{program} exited with status {code:?}")]
    Failed {
        /// Program name.
        program: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
    },
}

/// Work that may only run after a release was granted and audited.
#[async_trait]
pub trait ProtectedAction: Send + Sync {
    /// Run with the released secret.
    async fn run(&self, secret_name: &str, secret: &SecretValue) -> Result<(), ActionError>;
}

/// Runs an external program (for example a runbook script).
///
/// The secret name is appended as the last argument; the secret value is
/// passed in [`SECRET_ENV_VAR`], never on the command line.
#[derive(Debug, Clone)]
pub struct CommandAction {
    program: String,
    args: Vec<String>,
}

impl CommandAction {
    /// Action running `program` with `args`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl ProtectedAction for CommandAction {
    async fn run(&self, secret_name: &str, secret: &SecretValue) -> Result<(), ActionError> {
        info!(program = %self.program, secret_name, "running protected action");
        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(secret_name)
            .env(SECRET_ENV_VAR, secret.expose())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|source| ActionError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(ActionError::Failed {
                program: self.program.clone(),
                code: status.code(),
            })
        }
    }
}

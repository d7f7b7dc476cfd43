//! Password hand-off between a launcher and supervisor-managed children.
//!
//! The launcher prompts once and places the password in the environment of
//! the supervisor it spawns; every child the supervisor starts inherits it.
//! The launcher then scrubs the variable from its own environment. A child
//! consults the variable first and falls back to an interactive prompt, so a
//! server can still be started standalone.
//!
//! The password is never written to a file. The trade-off is that it is
//! readable in the environment of the supervisor and its children, which is
//! only acceptable because the front-ends listen on local-only transports.

use std::process::Command;

use async_trait::async_trait;
use thiserror::Error;

use crate::secret::Secret;

/// Default environment variable carrying the vault password.
pub const PASSWORD_ENV_VAR: &str = "MAILGATE_PASSWORD";

/// Error type for password acquisition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PropagationError {
    /// No terminal was available or reading it failed.
    #[error("password prompt failed: {message}")]
    PromptFailed { message: String },

    /// The operator entered an empty password.
    #[error("empty password")]
    Empty,

    /// Confirmation did not match the first entry.
    #[error("passwords do not match")]
    Mismatch,
}

/// Source of interactively entered passwords.
#[async_trait]
pub trait PasswordPrompt: Send + Sync {
    /// Ask the operator for a password, showing `message`.
    async fn prompt(&self, message: &str) -> Result<Secret, PropagationError>;
}

/// Reads a password from the controlling terminal without echo.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

#[async_trait]
impl PasswordPrompt for TerminalPrompt {
    async fn prompt(&self, message: &str) -> Result<Secret, PropagationError> {
        let message = message.to_string();
        let entered = tokio::task::spawn_blocking(move || rpassword::prompt_password(message))
            .await
            .map_err(|e| PropagationError::PromptFailed {
                message: e.to_string(),
            })?
            .map_err(|e| PropagationError::PromptFailed {
                message: e.to_string(),
            })?;
        Ok(Secret::new(entered))
    }
}

/// Where a resolved password came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordOrigin {
    Environment,
    Prompt,
}

/// Resolves the vault password: inherited environment first, prompt second.
pub struct PasswordSource {
    env_var: String,
    prompt: Box<dyn PasswordPrompt>,
}

impl PasswordSource {
    /// Use [`PASSWORD_ENV_VAR`] and the terminal prompt.
    pub fn new() -> Self {
        Self::with_prompt(PASSWORD_ENV_VAR, TerminalPrompt)
    }

    pub fn with_prompt(env_var: impl Into<String>, prompt: impl PasswordPrompt + 'static) -> Self {
        Self {
            env_var: env_var.into(),
            prompt: Box::new(prompt),
        }
    }

    /// Name of the environment variable consulted first.
    pub fn env_var(&self) -> &str {
        &self.env_var
    }

    /// Read the inherited password, if any. Empty values count as absent.
    pub fn from_env(&self) -> Option<Secret> {
        std::env::var(&self.env_var)
            .ok()
            .filter(|v| !v.is_empty())
            .map(Secret::new)
    }

    /// Resolve the password, preferring the inherited variable.
    pub async fn resolve(&self) -> Result<(Secret, PasswordOrigin), PropagationError> {
        if let Some(password) = self.from_env() {
            tracing::info!("Using password from environment variable {}", self.env_var);
            return Ok((password, PasswordOrigin::Environment));
        }

        let password = self.prompt.prompt("Enter vault password: ").await?;
        if password.is_empty() {
            return Err(PropagationError::Empty);
        }
        Ok((password, PasswordOrigin::Prompt))
    }

    /// Prompt twice and require both entries to match (used when sealing).
    pub async fn prompt_new(&self) -> Result<Secret, PropagationError> {
        let first = self.prompt.prompt("New vault password: ").await?;
        if first.is_empty() {
            return Err(PropagationError::Empty);
        }
        let second = self.prompt.prompt("Confirm vault password: ").await?;
        if first != second {
            return Err(PropagationError::Mismatch);
        }
        Ok(first)
    }
}

impl Default for PasswordSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PasswordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordSource")
            .field("env_var", &self.env_var)
            .finish()
    }
}

/// Export `password` into the environment of a child about to be spawned.
///
/// Only the child's environment block is touched; the current process is not.
pub fn export_to(command: &mut Command, env_var: &str, password: &Secret) {
    command.env(env_var, password.expose());
}

/// Remove `env_var` from the current process environment.
///
/// # Safety
///
/// Must be called while no other thread reads or writes the environment,
/// e.g. from a single-threaded `main` before any runtime is started.
pub unsafe fn scrub_current_process(env_var: &str) {
    // SAFETY: upheld by the caller, see above.
    unsafe { std::env::remove_var(env_var) };
}

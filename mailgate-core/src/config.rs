//! Authentication settings shared by every process that talks to the provider.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kdf::DEFAULT_ITERATIONS;
use crate::propagation::PASSWORD_ENV_VAR;
use crate::vault::{MAX_ITERATIONS, VaultError};

/// Environment variable overriding [`AuthConfig::credentials_path`].
pub const CREDENTIALS_PATH_ENV: &str = "MAILGATE_CREDENTIALS_PATH";

/// Environment variable overriding [`AuthConfig::token_path`].
pub const TOKEN_PATH_ENV: &str = "MAILGATE_TOKEN_PATH";

/// Environment variable overriding [`AuthConfig::kdf_iterations`].
pub const KDF_ITERATIONS_ENV: &str = "MAILGATE_KDF_ITERATIONS";

/// Where the encrypted artifacts live and how authentication behaves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    /// Encrypted client-secret artifact.
    pub credentials_path: PathBuf,

    /// Encrypted token-cache artifact.
    pub token_path: PathBuf,

    /// PBKDF2 rounds applied when sealing new artifacts.
    pub kdf_iterations: u32,

    /// Upper bound on one authentication attempt, interactive consent included.
    pub auth_timeout_secs: u64,

    /// Tokens expiring within this window are treated as expired.
    pub expiry_buffer_secs: i64,

    /// Environment variable consulted for the vault password.
    pub password_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials_path: PathBuf::from("credentials.encrypted"),
            token_path: PathBuf::from("token.encrypted"),
            kdf_iterations: DEFAULT_ITERATIONS,
            auth_timeout_secs: 300,
            expiry_buffer_secs: 300,
            password_env: PASSWORD_ENV_VAR.to_string(),
        }
    }
}

impl AuthConfig {
    /// Apply `MAILGATE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), VaultError> {
        if let Ok(path) = std::env::var(CREDENTIALS_PATH_ENV) {
            self.credentials_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var(TOKEN_PATH_ENV) {
            self.token_path = PathBuf::from(path);
        }
        if let Ok(raw) = std::env::var(KDF_ITERATIONS_ENV) {
            self.kdf_iterations = raw.trim().parse().map_err(|_| VaultError::Configuration {
                message: format!("{} must be a positive integer, got {:?}", KDF_ITERATIONS_ENV, raw),
            })?;
        }
        self.validate()
    }

    /// Reject settings that can never work.
    pub fn validate(&self) -> Result<(), VaultError> {
        if self.kdf_iterations == 0 || self.kdf_iterations > MAX_ITERATIONS {
            return Err(VaultError::Configuration {
                message: format!(
                    "kdf_iterations must be between 1 and {}, got {}",
                    MAX_ITERATIONS, self.kdf_iterations
                ),
            });
        }
        if self.credentials_path.as_os_str().is_empty() {
            return Err(VaultError::Configuration {
                message: "credentials_path must not be empty".to_string(),
            });
        }
        if self.token_path.as_os_str().is_empty() {
            return Err(VaultError::Configuration {
                message: "token_path must not be empty".to_string(),
            });
        }
        if self.auth_timeout_secs == 0 {
            return Err(VaultError::Configuration {
                message: "auth_timeout_secs must be at least 1".to_string(),
            });
        }
        if self.expiry_buffer_secs < 0 {
            return Err(VaultError::Configuration {
                message: format!(
                    "expiry_buffer_secs must not be negative, got {}",
                    self.expiry_buffer_secs
                ),
            });
        }
        if self.password_env.is_empty() {
            return Err(VaultError::Configuration {
                message: "password_env must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn expiry_buffer(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_buffer_secs)
    }
}

//! Top-level error types for mailgate.

use thiserror::Error;

use crate::guard::OperationError;
use crate::propagation::PropagationError;
use crate::provider::ProviderError;
use crate::session::AuthError;
use crate::vault::VaultError;

/// Top-level error type encompassing all mailgate errors.
#[derive(Debug, Error)]
pub enum MailgateError {
    /// Error from the credential vault.
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    /// Error obtaining the vault password.
    #[error("password error: {0}")]
    Password(#[from] PropagationError),

    /// Error from an authentication attempt.
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Error from the mail provider.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A guarded operation failed.
    #[error(transparent)]
    Operation(#[from] OperationError),

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

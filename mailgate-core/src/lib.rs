//! # Mailgate Core
//!
//! Shared authentication core for processes that talk to a mail provider.
//!
//! This crate provides:
//! - Password-based key derivation and an authenticated-encryption vault for
//!   the OAuth client secret and token cache
//! - The password hand-off between a launcher and supervised children
//! - A decrypt-and-authenticate state machine ([`AuthSession`]) behind a
//!   single-flight cache ([`ConnectorFactory`])
//! - The retry-once policy every provider call goes through ([`OperationGuard`])
//! - A Google OAuth / Gmail provider (feature `google`)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mailgate_core::{AuthConfig, AuthSession, ConnectorFactory, OperationGuard, GmailProvider};
//!
//! async fn unread(config: AuthConfig) -> Result<serde_json::Value, mailgate_core::OperationError> {
//!     let provider = Arc::new(GmailProvider::new());
//!     let session = AuthSession::new(config, provider.clone());
//!     let guard = OperationGuard::new(Arc::new(ConnectorFactory::new(session)), provider);
//!     let output = guard
//!         .perform("list_messages", serde_json::json!({"query": "is:unread"}))
//!         .await?;
//!     Ok(output.result)
//! }
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod guard;
pub mod kdf;
pub mod propagation;
pub mod provider;
pub mod secret;
pub mod session;
pub mod setup;
pub mod token;
pub mod vault;

#[cfg(feature = "google")]
pub mod google;

// Re-export commonly used types at crate root
pub use config::AuthConfig;

pub use connector::ConnectorFactory;

pub use error::MailgateError;

pub use guard::{
    AuthStatus,
    ErrorKind,
    OperationError,
    OperationGuard,
    OperationOutput,
};

pub use propagation::{
    PASSWORD_ENV_VAR,
    PasswordPrompt,
    PasswordSource,
    PropagationError,
    TerminalPrompt,
};

pub use provider::{
    FailureKind,
    MailProvider,
    MailRequest,
    ProviderError,
};

pub use secret::Secret;

pub use session::{
    AuthError,
    AuthSession,
    AuthState,
};

pub use token::{
    ClientSecret,
    Session,
    Token,
    TokenSet,
};

pub use vault::{
    CredentialVault,
    EncryptedArtifact,
    VaultError,
};

#[cfg(feature = "google")]
pub use google::GmailProvider;

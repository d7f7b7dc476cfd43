//! Contract expected from the mail-provider client.
//!
//! This module provides:
//! - [`MailProvider`] - Trait implemented by the remote mail API client
//! - [`MailRequest`] - A named operation plus JSON arguments
//! - [`ProviderError`] / [`FailureKind`] - Classified provider failures
//!
//! The core never interprets operations; it only needs failures to be
//! classifiable so that expired authentication can be told apart from
//! transient and fatal errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::token::{ClientSecret, Session, TokenSet};

/// Classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The session's credentials are no longer accepted; re-authenticating may help.
    AuthExpired,
    /// The provider refused the stored credentials outright (e.g. revoked refresh token).
    Rejected,
    /// Network trouble, rate limiting or a provider-side outage.
    Transient,
    /// Anything else: malformed request, missing resource, quota exhausted.
    Fatal,
}

/// Error type for provider calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("authentication expired: {message}")]
    AuthExpired { message: String },

    #[error("credentials rejected by provider: {message}")]
    Rejected { message: String },

    #[error("transient provider failure: {message}")]
    Transient { message: String },

    #[error("provider error: {message}")]
    Fatal { message: String },

    /// The request named an unknown operation or carried bad arguments.
    #[error("invalid request for {operation}: {message}")]
    InvalidRequest { operation: String, message: String },
}

impl ProviderError {
    /// Classify this failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            ProviderError::AuthExpired { .. } => FailureKind::AuthExpired,
            ProviderError::Rejected { .. } => FailureKind::Rejected,
            ProviderError::Transient { .. } => FailureKind::Transient,
            ProviderError::Fatal { .. } | ProviderError::InvalidRequest { .. } => FailureKind::Fatal,
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        self.kind() == FailureKind::AuthExpired
    }
}

/// A provider operation: a name plus free-form JSON arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailRequest {
    pub operation: String,

    #[serde(default)]
    pub args: serde_json::Value,
}

impl MailRequest {
    pub fn new(operation: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            operation: operation.into(),
            args,
        }
    }
}

/// Remote mail API client.
///
/// Implementations perform the OAuth exchanges and the actual API calls.
/// Every failure must be reported as a [`ProviderError`] so that it can be
/// classified.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Run the full interactive consent flow and return fresh tokens.
    async fn consent(&self, client: &ClientSecret) -> Result<TokenSet, ProviderError>;

    /// Exchange the refresh token in `tokens` for a new token set.
    async fn refresh(&self, client: &ClientSecret, tokens: &TokenSet) -> Result<TokenSet, ProviderError>;

    /// Execute one API operation with an authenticated session.
    async fn call(&self, session: &Session, request: &MailRequest) -> Result<serde_json::Value, ProviderError>;
}

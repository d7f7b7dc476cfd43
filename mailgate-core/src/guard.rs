//! Retry-once policy wrapped around every provider call.
//!
//! Front-ends call [`OperationGuard::perform`] and nothing else. The guard:
//!
//! 1. obtains a [`Session`] from the [`ConnectorFactory`],
//! 2. runs the operation,
//! 3. on an "authentication expired" failure forces exactly one
//!    re-authentication and retries,
//! 4. reports a second authentication failure as
//!    [`ErrorKind::Authentication`] without retrying further,
//! 5. surfaces every other failure immediately.
//!
//! Results and errors carry the operation name and a short correlation id
//! which also appear in the log lines for the call.
//!
//! Start-up warm-up, status reporting and operator resets go through the
//! guard as well, so front-ends never hold the [`ConnectorFactory`] itself.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connector::ConnectorFactory;
use crate::provider::{FailureKind, MailProvider, MailRequest, ProviderError};
use crate::session::{AuthError, AuthState};
use crate::token::Session;

/// Failure category reported to front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    WrongPasswordOrCorruptData,
    ProviderAuthRejected,
    Authentication,
    Transient,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::WrongPasswordOrCorruptData => "wrong_password_or_corrupt_data",
            ErrorKind::ProviderAuthRejected => "provider_auth_rejected",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        }
    }

    /// Whether an outer retry policy may resubmit the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&AuthError> for ErrorKind {
    fn from(err: &AuthError) -> Self {
        match err {
            AuthError::Configuration { .. } | AuthError::PasswordUnavailable { .. } => {
                ErrorKind::Configuration
            }
            AuthError::DecryptionFailed => ErrorKind::WrongPasswordOrCorruptData,
            AuthError::ProviderRejected { .. } => ErrorKind::ProviderAuthRejected,
            AuthError::NetworkUnavailable { .. } | AuthError::Timeout { .. } => ErrorKind::Transient,
            AuthError::Provider { .. } | AuthError::Internal { .. } => ErrorKind::Fatal,
        }
    }
}

impl From<&ProviderError> for ErrorKind {
    fn from(err: &ProviderError) -> Self {
        match err.kind() {
            FailureKind::AuthExpired => ErrorKind::Authentication,
            FailureKind::Rejected => ErrorKind::ProviderAuthRejected,
            FailureKind::Transient => ErrorKind::Transient,
            FailureKind::Fatal => ErrorKind::Fatal,
        }
    }
}

/// A failed guarded operation.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{operation} failed [{correlation_id}] ({kind}): {message}")]
pub struct OperationError {
    pub operation: String,
    pub correlation_id: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// A successful guarded operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationOutput<T = serde_json::Value> {
    pub operation: String,
    pub correlation_id: String,
    pub result: T,
}

/// Authentication state as seen by front-ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStatus {
    pub state: AuthState,
    /// Generation of the cached session, if any.
    pub generation: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Create an 8-character correlation id.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// The only entry point front-ends use to reach the provider.
#[derive(Clone)]
pub struct OperationGuard {
    connector: Arc<ConnectorFactory>,
    provider: Arc<dyn MailProvider>,
}

impl OperationGuard {
    pub fn new(connector: Arc<ConnectorFactory>, provider: Arc<dyn MailProvider>) -> Self {
        Self { connector, provider }
    }

    pub fn connector(&self) -> &Arc<ConnectorFactory> {
        &self.connector
    }

    /// Current state and cached session; never waits on an in-flight attempt.
    pub fn status(&self) -> AuthStatus {
        let session = self.connector.current();
        AuthStatus {
            state: self.connector.state(),
            generation: session.as_ref().map(Session::generation),
            expires_at: session.as_ref().and_then(Session::expires_at),
        }
    }

    /// Authenticate ahead of the first operation.
    pub async fn warm_up(&self) -> Result<OperationOutput<AuthStatus>, OperationError> {
        let output = self
            .run("authenticate", |_session| std::future::ready(Ok::<_, ProviderError>(())))
            .await?;
        Ok(OperationOutput {
            operation: output.operation,
            correlation_id: output.correlation_id,
            result: self.status(),
        })
    }

    /// Forget cached credentials and any sticky failure.
    ///
    /// The next operation authenticates from the artifacts on disk, running
    /// consent if no usable token cache remains.
    pub async fn reset(&self) -> AuthStatus {
        tracing::info!("Resetting authentication state on request");
        self.connector.reset().await;
        self.status()
    }

    /// Execute a named provider operation.
    pub async fn perform(
        &self,
        operation: &str,
        args: serde_json::Value,
    ) -> Result<OperationOutput, OperationError> {
        let request = MailRequest::new(operation, args);
        let provider = self.provider.clone();
        self.run(operation, |session| {
            let provider = provider.clone();
            let request = request.clone();
            async move { provider.call(&session, &request).await }
        })
        .await
    }

    /// Execute a custom operation under the same policy as [`perform`](Self::perform).
    ///
    /// `op` is invoked at most twice.
    pub async fn run<T, F, Fut>(&self, operation: &str, op: F) -> Result<OperationOutput<T>, OperationError>
    where
        F: Fn(Session) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let correlation_id = new_correlation_id();
        let started = Instant::now();
        tracing::info!(operation, correlation_id = %correlation_id, "Starting operation");

        match self.execute(&op).await {
            Ok(result) => {
                tracing::info!(
                    operation,
                    correlation_id = %correlation_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Operation completed"
                );
                Ok(OperationOutput {
                    operation: operation.to_string(),
                    correlation_id,
                    result,
                })
            }
            Err((kind, message)) => {
                tracing::error!(
                    operation,
                    correlation_id = %correlation_id,
                    kind = %kind,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Operation failed: {}",
                    message
                );
                Err(OperationError {
                    operation: operation.to_string(),
                    correlation_id,
                    kind,
                    message,
                })
            }
        }
    }

    async fn execute<T, F, Fut>(&self, op: &F) -> Result<T, (ErrorKind, String)>
    where
        F: Fn(Session) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let session = self.connector.get().await.map_err(auth_failure)?;

        let first = match op(session.clone()).await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_auth_expired() => err,
            Err(err) => return Err(provider_failure(err)),
        };

        tracing::warn!("Authentication expired ({}), re-authenticating once", first);
        let fresh = self
            .connector
            .invalidate_and_reauth(&session)
            .await
            .map_err(auth_failure)?;

        match op(fresh).await {
            Ok(result) => Ok(result),
            Err(err) if matches!(err.kind(), FailureKind::AuthExpired | FailureKind::Rejected) => Err((
                ErrorKind::Authentication,
                format!("still unauthorized after re-authentication: {}", err),
            )),
            Err(err) => Err(provider_failure(err)),
        }
    }
}

fn auth_failure(err: AuthError) -> (ErrorKind, String) {
    (ErrorKind::from(&err), err.to_string())
}

fn provider_failure(err: ProviderError) -> (ErrorKind, String) {
    (ErrorKind::from(&err), err.to_string())
}

impl std::fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationGuard")
            .field("connector", &self.connector)
            .finish()
    }
}

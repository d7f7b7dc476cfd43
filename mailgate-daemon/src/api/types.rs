//! API request/response types for the daemon JSON-RPC interface.

use mailgate_core::{AuthState, AuthStatus, ErrorKind, OperationError, OperationOutput};
use serde::{Deserialize, Serialize};

/// Request to perform a provider operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformRequest {
    /// Operation name (e.g., "list_messages", "send_message")
    pub operation: String,
    /// Operation arguments
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Response from a successful operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformResponse {
    pub operation: String,
    /// Correlation id also present in the daemon's log lines
    pub correlation_id: String,
    pub result: serde_json::Value,
}

impl From<OperationOutput> for PerformResponse {
    fn from(output: OperationOutput) -> Self {
        Self {
            operation: output.operation,
            correlation_id: output.correlation_id,
            result: output.result,
        }
    }
}

/// Authentication status of the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: AuthState,
    /// Generation of the cached session, if any
    pub generation: Option<u64>,
    /// Expiry of the cached session's access token (RFC 3339)
    pub expires_at: Option<String>,
    pub version: String,
}

impl From<AuthStatus> for StatusResponse {
    fn from(status: AuthStatus) -> Self {
        Self {
            state: status.state,
            generation: status.generation,
            expires_at: status.expires_at.map(|dt| dt.to_rfc3339()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// `data` member attached to JSON-RPC errors from failed operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationErrorData {
    pub operation: String,
    pub correlation_id: String,
    pub kind: ErrorKind,
}

impl From<&OperationError> for OperationErrorData {
    fn from(err: &OperationError) -> Self {
        Self {
            operation: err.operation.clone(),
            correlation_id: err.correlation_id.clone(),
            kind: err.kind,
        }
    }
}

/// JSON-RPC error code for each failure kind.
pub fn error_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Configuration => -32001,
        ErrorKind::WrongPasswordOrCorruptData => -32002,
        ErrorKind::ProviderAuthRejected => -32003,
        ErrorKind::Authentication => -32004,
        ErrorKind::Transient => -32005,
        ErrorKind::Fatal => -32006,
    }
}

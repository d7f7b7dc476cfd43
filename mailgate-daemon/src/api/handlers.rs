//! JSON-RPC API handlers for the daemon.

use std::sync::Arc;

use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObject;
use mailgate_core::{AuthConfig, AuthSession, ConnectorFactory, MailProvider, OperationError, OperationGuard};
use tracing::{debug, info, warn};

use super::types::{OperationErrorData, PerformResponse, StatusResponse, error_code};

/// State shared across RPC handlers.
#[derive(Clone)]
pub struct ApiState {
    /// The only path to the mail provider
    pub guard: OperationGuard,
}

impl ApiState {
    /// Wrap an existing guard (useful for tests).
    pub fn new(guard: OperationGuard) -> Self {
        Self { guard }
    }

    /// Compose session, connector and guard around `provider`.
    pub fn with_provider(auth: AuthConfig, provider: Arc<dyn MailProvider>) -> Self {
        let session = AuthSession::new(auth, provider.clone());
        let connector = Arc::new(ConnectorFactory::new(session));
        Self::new(OperationGuard::new(connector, provider))
    }

    /// Production state backed by Gmail.
    pub fn gmail(auth: AuthConfig) -> Self {
        Self::with_provider(auth, Arc::new(mailgate_core::GmailProvider::new()))
    }
}

/// JSON-RPC API trait definition.
#[rpc(server)]
pub trait MailgateApi {
    /// Perform a mail operation.
    ///
    /// # Parameters
    ///
    /// - `operation`: Operation name (e.g., "list_messages")
    /// - `args`: Operation arguments
    ///
    /// # Returns
    ///
    /// The provider's result, tagged with a correlation id.
    #[method(name = "perform")]
    async fn perform(&self, operation: String, args: Option<serde_json::Value>) -> RpcResult<PerformResponse>;

    /// Report the authentication state without triggering authentication.
    #[method(name = "status")]
    async fn status(&self) -> RpcResult<StatusResponse>;

    /// Drop cached credentials and clear a sticky provider rejection.
    ///
    /// The next `perform` authenticates again, running consent if the
    /// provider revoked the stored refresh token.
    #[method(name = "reset")]
    async fn reset(&self) -> RpcResult<StatusResponse>;
}

/// Implementation of the mailgate API.
pub struct MailgateApiImpl {
    state: ApiState,
}

impl MailgateApiImpl {
    /// Create a new API implementation with the given state.
    pub fn new(state: ApiState) -> Self {
        Self { state }
    }
}

#[async_trait::async_trait]
impl MailgateApiServer for MailgateApiImpl {
    async fn perform(&self, operation: String, args: Option<serde_json::Value>) -> RpcResult<PerformResponse> {
        info!("RPC: perform({})", operation);

        self.state
            .guard
            .perform(&operation, args.unwrap_or(serde_json::Value::Null))
            .await
            .map(PerformResponse::from)
            .map_err(operation_error)
    }

    async fn status(&self) -> RpcResult<StatusResponse> {
        debug!("RPC: status()");

        Ok(self.state.guard.status().into())
    }

    async fn reset(&self) -> RpcResult<StatusResponse> {
        warn!("RPC: reset() clearing cached credentials");

        Ok(self.state.guard.reset().await.into())
    }
}

/// Convert a failed operation into a JSON-RPC error carrying its context.
pub fn operation_error(err: OperationError) -> ErrorObject<'static> {
    ErrorObject::owned(
        error_code(err.kind),
        err.message.clone(),
        Some(OperationErrorData::from(&err)),
    )
}

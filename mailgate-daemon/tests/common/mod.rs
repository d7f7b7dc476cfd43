//! Shared fixtures for daemon integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use mailgate_core::{
    AuthConfig, AuthSession, ClientSecret, ConnectorFactory, CredentialVault, MailProvider,
    MailRequest, OperationGuard, PasswordPrompt, PasswordSource, PropagationError, ProviderError,
    Secret, Session, Token, TokenSet,
};
use mailgate_daemon::api::{ApiState, ServerHandle, start_server};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{Duration, sleep};

pub const ITERATIONS: u32 = 64;

/// Detect whether the sandbox allows binding Unix sockets. Skip tests if not.
pub fn can_bind_unix_socket() -> bool {
    let path = std::env::temp_dir().join(format!(
        "mailgate-socket-permission-check-{}.sock",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    let result = std::os::unix::net::UnixListener::bind(&path);
    let ok = result.is_ok();
    let _ = std::fs::remove_file(&path);
    ok
}

struct NoTerminal;

#[async_trait]
impl PasswordPrompt for NoTerminal {
    async fn prompt(&self, _message: &str) -> Result<Secret, PropagationError> {
        Err(PropagationError::PromptFailed {
            message: "not a terminal".to_string(),
        })
    }
}

/// Provider whose behaviour is selected by operation name.
///
/// - `echo` returns its arguments
/// - `expired` always fails with an expired token
/// - `expire_once` fails with an expired token for the first session only
/// - `throttled` fails with a transient error
/// - anything else is an invalid request
///
/// Refreshes succeed until `revoke_refresh` is set.
#[derive(Default)]
pub struct FakeProvider {
    pub consents: AtomicUsize,
    pub calls: AtomicUsize,
    pub revoke_refresh: AtomicBool,
}

#[async_trait]
impl MailProvider for FakeProvider {
    async fn consent(&self, _client: &ClientSecret) -> Result<TokenSet, ProviderError> {
        let n = self.consents.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenSet::new(
            Token::new(format!("access-{}", n)).with_expiry(Utc::now() + chrono::Duration::hours(1)),
        )
        .with_refresh_token("refresh-token"))
    }

    async fn refresh(&self, client: &ClientSecret, _tokens: &TokenSet) -> Result<TokenSet, ProviderError> {
        if self.revoke_refresh.load(Ordering::SeqCst) {
            return Err(ProviderError::Rejected {
                message: "invalid_grant".to_string(),
            });
        }
        self.consent(client).await
    }

    async fn call(&self, session: &Session, request: &MailRequest) -> Result<serde_json::Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match request.operation.as_str() {
            "echo" => Ok(json!({ "args": request.args, "generation": session.generation() })),
            "expired" => Err(ProviderError::AuthExpired {
                message: "HTTP 401".to_string(),
            }),
            "expire_once" if session.generation() == 1 => Err(ProviderError::AuthExpired {
                message: "HTTP 401".to_string(),
            }),
            "expire_once" => Ok(json!({ "generation": session.generation() })),
            "throttled" => Err(ProviderError::Transient {
                message: "HTTP 429".to_string(),
            }),
            other => Err(ProviderError::InvalidRequest {
                operation: other.to_string(),
                message: "unknown operation".to_string(),
            }),
        }
    }
}

/// A running daemon over a sealed client secret in a temp directory.
pub struct TestDaemon {
    pub dir: TempDir,
    pub socket_path: PathBuf,
    pub provider: Arc<FakeProvider>,
    pub handle: ServerHandle,
}

impl TestDaemon {
    /// Seal the client secret with `sealed_with` and serve with the password
    /// found in `env_var`.
    pub async fn start(sealed_with: &str, env_var: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let credentials_path = dir.path().join("credentials.encrypted");
        let document = json!({
            "installed": {
                "client_id": "1234567890-fake.apps.googleusercontent.com",
                "client_secret": "0123456789abcdef0123456789abcdef",
            }
        });
        let artifact = CredentialVault::with_iterations(ITERATIONS)
            .encrypt(&serde_json::to_vec(&document).unwrap(), sealed_with.as_bytes())
            .unwrap();
        CredentialVault::store(&credentials_path, &artifact).unwrap();

        let config = AuthConfig {
            credentials_path,
            token_path: dir.path().join("token.encrypted"),
            kdf_iterations: ITERATIONS,
            auth_timeout_secs: 5,
            password_env: env_var.to_string(),
            ..AuthConfig::default()
        };

        let provider = Arc::new(FakeProvider::default());
        let session = AuthSession::with_password_source(
            config,
            provider.clone(),
            PasswordSource::with_prompt(env_var, NoTerminal),
        );
        let guard = OperationGuard::new(Arc::new(ConnectorFactory::new(session)), provider.clone());

        let socket_path = dir.path().join("daemon.sock");
        let handle = start_server(&socket_path, ApiState::new(guard)).await.unwrap();

        // Give the server time to start accepting connections
        sleep(Duration::from_millis(100)).await;

        Self {
            dir,
            socket_path,
            provider,
            handle,
        }
    }
}

/// Set a test-specific password variable.
pub fn set_password(env_var: &str, password: &str) {
    // SAFETY: every test uses a variable name of its own.
    unsafe { std::env::set_var(env_var, password) };
}

/// Send one raw line and read one response line on a fresh connection.
pub async fn send_raw_request(
    socket_path: &std::path::Path,
    request: &str,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let mut stream = UnixStream::connect(socket_path).await?;
    stream.write_all(request.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;

    let (reader, _writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut response_str = String::new();
    reader.read_line(&mut response_str).await?;

    Ok(serde_json::from_str(&response_str)?)
}

/// Send a JSON-RPC call and return the full response object.
pub async fn call(
    socket_path: &std::path::Path,
    method: &str,
    params: serde_json::Value,
    id: u64,
) -> serde_json::Value {
    let request = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": id,
    });
    send_raw_request(socket_path, &request.to_string())
        .await
        .expect("Failed to get response")
}

//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mailgate_core::{
    AuthConfig, AuthSession, ClientSecret, ConnectorFactory, CredentialVault, MailProvider,
    MailRequest, OperationGuard, PasswordPrompt, PasswordSource, PropagationError, ProviderError,
    Secret, Session, Token, TokenSet,
};
use parking_lot::Mutex;
use tempfile::TempDir;

pub const ITERATIONS: u32 = 64;

/// 32-byte fake client secret.
pub const FAKE_CLIENT_SECRET: &str = "0123456789abcdef0123456789abcdef";

/// A prompt for processes without a terminal.
pub struct NoTerminal;

#[async_trait]
impl PasswordPrompt for NoTerminal {
    async fn prompt(&self, _message: &str) -> Result<Secret, PropagationError> {
        Err(PropagationError::PromptFailed {
            message: "not a terminal".to_string(),
        })
    }
}

/// Scriptable provider that counts handshakes.
#[derive(Default)]
pub struct FakeProvider {
    pub consents: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub calls: AtomicUsize,
    pub handshake_delay: Mutex<Option<Duration>>,
    revoked: Mutex<HashSet<String>>,
    scripted: Mutex<Vec<ProviderError>>,
    refresh_error: Mutex<Option<ProviderError>>,
    issued: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_handshake_delay(delay: Duration) -> Arc<Self> {
        let provider = Self::default();
        *provider.handshake_delay.lock() = Some(delay);
        Arc::new(provider)
    }

    /// Make every call with `session`'s token fail with `AuthExpired`.
    pub fn revoke(&self, session: &Session) {
        self.revoked.lock().insert(session.access_token().expose().to_string());
    }

    /// Queue errors returned by the next calls, in order.
    pub fn script(&self, errors: Vec<ProviderError>) {
        *self.scripted.lock() = errors;
    }

    pub fn fail_refresh(&self, error: ProviderError) {
        *self.refresh_error.lock() = Some(error);
    }

    pub fn handshakes(&self) -> usize {
        self.consents.load(Ordering::SeqCst) + self.refreshes.load(Ordering::SeqCst)
    }

    fn issue(&self) -> TokenSet {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        TokenSet::new(
            Token::new(format!("access-{}", n)).with_expiry(Utc::now() + chrono::Duration::hours(1)),
        )
    }

    async fn pause(&self) {
        let delay = *self.handshake_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl MailProvider for FakeProvider {
    async fn consent(&self, client: &ClientSecret) -> Result<TokenSet, ProviderError> {
        assert_eq!(client.client_secret.expose(), FAKE_CLIENT_SECRET);
        self.consents.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Ok(self.issue().with_refresh_token("refresh-token"))
    }

    async fn refresh(&self, _client: &ClientSecret, tokens: &TokenSet) -> Result<TokenSet, ProviderError> {
        assert!(tokens.refresh_token.is_some());
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if let Some(err) = self.refresh_error.lock().clone() {
            return Err(err);
        }
        Ok(self.issue())
    }

    async fn call(&self, session: &Session, request: &MailRequest) -> Result<serde_json::Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut scripted = self.scripted.lock();
            if !scripted.is_empty() {
                return Err(scripted.remove(0));
            }
        }
        if self.revoked.lock().contains(session.access_token().expose()) {
            return Err(ProviderError::AuthExpired {
                message: "HTTP 401: Invalid Credentials".to_string(),
            });
        }
        Ok(serde_json::json!({
            "operation": request.operation,
            "generation": session.generation(),
        }))
    }
}

/// A temp directory holding a sealed client secret.
pub struct Vault {
    pub dir: TempDir,
}

impl Vault {
    pub fn sealed_with(password: &str) -> Self {
        Self::sealed_with_iterations(password, ITERATIONS)
    }

    /// Seal the client secret with a custom key derivation cost.
    pub fn sealed_with_iterations(password: &str, iterations: u32) -> Self {
        let dir = TempDir::new().unwrap();
        let document = serde_json::json!({
            "installed": {
                "client_id": "1234567890-fake.apps.googleusercontent.com",
                "client_secret": FAKE_CLIENT_SECRET,
            }
        });
        let vault = CredentialVault::with_iterations(iterations);
        let artifact = vault
            .encrypt(&serde_json::to_vec(&document).unwrap(), password.as_bytes())
            .unwrap();
        CredentialVault::store(&dir.path().join("credentials.encrypted"), &artifact).unwrap();
        Self { dir }
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.dir.path().join("credentials.encrypted")
    }

    pub fn token_path(&self) -> PathBuf {
        self.dir.path().join("token.encrypted")
    }

    pub fn config(&self, env_var: &str) -> AuthConfig {
        AuthConfig {
            credentials_path: self.credentials_path(),
            token_path: self.token_path(),
            kdf_iterations: ITERATIONS,
            auth_timeout_secs: 5,
            password_env: env_var.to_string(),
            ..AuthConfig::default()
        }
    }

    /// An `AuthSession` whose password comes from `env_var` only.
    pub fn session(&self, env_var: &str, provider: Arc<FakeProvider>) -> AuthSession {
        AuthSession::with_password_source(
            self.config(env_var),
            provider,
            PasswordSource::with_prompt(env_var, NoTerminal),
        )
    }

    pub fn connector(&self, env_var: &str, provider: Arc<FakeProvider>) -> Arc<ConnectorFactory> {
        Arc::new(ConnectorFactory::new(self.session(env_var, provider)))
    }

    pub fn guard(&self, env_var: &str, provider: Arc<FakeProvider>) -> OperationGuard {
        OperationGuard::new(self.connector(env_var, provider.clone()), provider)
    }
}

/// Set a test-specific password variable.
pub fn set_password(env_var: &str, password: &str) {
    // SAFETY: every test uses a variable name of its own.
    unsafe { std::env::set_var(env_var, password) };
}

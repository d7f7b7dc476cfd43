//! Decrypt-and-authenticate state machine.
//!
//! [`AuthSession`] owns everything needed to turn the encrypted artifacts on
//! disk into a usable [`Session`]:
//!
//! 1. Resolve the vault password (inherited environment, else prompt) and
//!    cache it for the process lifetime.
//! 2. Decrypt the client secret and, if present, the token cache.
//! 3. Use a still-valid access token directly, refresh an expired one, or run
//!    the interactive consent flow when no token cache exists.
//! 4. Re-seal rotated tokens and persist them so the next process start can
//!    skip consent.
//!
//! Key derivation and artifact I/O run on the blocking pool, so an attempt's
//! time bound also covers them.
//!
//! ```text
//! Unauthenticated -> Authenticating -> Authenticated
//!        ^                 |                 |
//!        +-----------------+ (error)         | invalidate()
//!        +-----------------------------------+
//! any state -> Failed (credentials rejected outright; cleared by reset())
//! ```
//!
//! A rejected refresh also deletes the token cache, so the attempt after
//! `reset()` (or the next process start) runs consent instead of replaying
//! the revoked refresh token.
//!
//! An `AuthSession` is not shared directly; [`ConnectorFactory`] serializes
//! access to it.
//!
//! [`ConnectorFactory`]: crate::connector::ConnectorFactory

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AuthConfig;
use crate::kdf::SALT_LEN;
use crate::propagation::{PasswordSource, PropagationError};
use crate::provider::{MailProvider, ProviderError};
use crate::secret::Secret;
use crate::token::{ClientSecret, Session, TokenSet};
use crate::vault::{CredentialVault, VaultError};

/// Lifecycle state of an [`AuthSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Failed,
}

/// Error type for authentication attempts.
///
/// Messages never contain the password, derived keys or token values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Missing artifact, unusable settings or malformed client secret.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The password could not be obtained.
    #[error("password unavailable: {message}")]
    PasswordUnavailable { message: String },

    /// Wrong password or a corrupted artifact. Never retried automatically.
    #[error("decryption failed: wrong password or corrupted artifact")]
    DecryptionFailed,

    /// The provider refused the stored credentials; consent must be re-run.
    #[error("credentials rejected by provider: {message}")]
    ProviderRejected { message: String },

    /// The provider could not be reached. Callers may retry.
    #[error("network unavailable: {message}")]
    NetworkUnavailable { message: String },

    /// Any other provider failure during the handshake.
    #[error("provider error during authentication: {message}")]
    Provider { message: String },

    /// The attempt exceeded its time bound and was abandoned.
    #[error("authentication timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The attempt was lost (e.g. its task panicked).
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<VaultError> for AuthError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::WrongPasswordOrCorruptData => AuthError::DecryptionFailed,
            VaultError::Configuration { message } => AuthError::Configuration { message },
            other => AuthError::Configuration {
                message: other.to_string(),
            },
        }
    }
}

impl From<PropagationError> for AuthError {
    fn from(err: PropagationError) -> Self {
        AuthError::PasswordUnavailable {
            message: err.to_string(),
        }
    }
}

impl From<ProviderError> for AuthError {
    fn from(err: ProviderError) -> Self {
        match err {
            // An expired or refused refresh grant cannot be fixed by retrying.
            ProviderError::Rejected { message } | ProviderError::AuthExpired { message } => {
                AuthError::ProviderRejected { message }
            }
            ProviderError::Transient { message } => AuthError::NetworkUnavailable { message },
            other => AuthError::Provider {
                message: other.to_string(),
            },
        }
    }
}

/// Shared view of an [`AuthSession`]'s state, readable while an attempt holds the session.
pub type StateHandle = Arc<RwLock<AuthState>>;

/// Turns the encrypted artifacts into a [`Session`].
pub struct AuthSession {
    config: AuthConfig,
    vault: CredentialVault,
    passwords: PasswordSource,
    provider: Arc<dyn MailProvider>,

    password: Option<Secret>,
    tokens: Option<TokenSet>,
    token_salt: Option<[u8; SALT_LEN]>,
    force_refresh: bool,
    generation: u64,
    failure: Option<AuthError>,
    state: StateHandle,
}

impl AuthSession {
    /// Create a session reading the password from `config.password_env`,
    /// falling back to the terminal.
    pub fn new(config: AuthConfig, provider: Arc<dyn MailProvider>) -> Self {
        let passwords = PasswordSource::with_prompt(
            config.password_env.clone(),
            crate::propagation::TerminalPrompt,
        );
        Self::with_password_source(config, provider, passwords)
    }

    pub fn with_password_source(
        config: AuthConfig,
        provider: Arc<dyn MailProvider>,
        passwords: PasswordSource,
    ) -> Self {
        let vault = CredentialVault::with_iterations(config.kdf_iterations);
        Self {
            config,
            vault,
            passwords,
            provider,
            password: None,
            tokens: None,
            token_salt: None,
            force_refresh: false,
            generation: 0,
            failure: None,
            state: Arc::new(RwLock::new(AuthState::Unauthenticated)),
        }
    }

    pub fn state(&self) -> AuthState {
        *self.state.read()
    }

    /// A handle that observes state changes without locking the session.
    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    /// Reason recorded when the session entered [`AuthState::Failed`].
    pub fn failure(&self) -> Option<&AuthError> {
        self.failure.as_ref()
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    fn set_state(&self, state: AuthState) {
        *self.state.write() = state;
    }

    /// Produce an authenticated [`Session`].
    ///
    /// Fails fast with the recorded reason while in [`AuthState::Failed`].
    pub async fn authenticate(&mut self) -> Result<Session, AuthError> {
        if let Some(reason) = &self.failure {
            return Err(reason.clone());
        }

        self.set_state(AuthState::Authenticating);
        match self.run_handshake().await {
            Ok(session) => {
                self.set_state(AuthState::Authenticated);
                tracing::info!(generation = session.generation(), "Authenticated with mail provider");
                Ok(session)
            }
            Err(err) => {
                match &err {
                    AuthError::ProviderRejected { .. } => {
                        tracing::error!("Provider rejected stored credentials: {}", err);
                        self.failure = Some(err.clone());
                        self.tokens = None;
                        self.set_state(AuthState::Failed);
                    }
                    AuthError::DecryptionFailed => {
                        tracing::error!("Could not decrypt credentials: wrong password or corrupted artifact");
                        self.password = None;
                        self.set_state(AuthState::Unauthenticated);
                    }
                    _ => {
                        tracing::warn!("Authentication attempt failed: {}", err);
                        self.set_state(AuthState::Unauthenticated);
                    }
                }
                Err(err)
            }
        }
    }

    /// Drop the in-memory token cache and force the next
    /// [`authenticate`](Self::authenticate) to use the refresh token.
    pub fn invalidate(&mut self) {
        tracing::debug!("Invalidating cached tokens");
        self.tokens = None;
        self.force_refresh = true;
        if self.failure.is_none() {
            self.set_state(AuthState::Unauthenticated);
        }
    }

    /// Leave an attempt that was cut short (e.g. by a timeout).
    pub fn abandon(&mut self) {
        if self.state() == AuthState::Authenticating {
            self.set_state(AuthState::Unauthenticated);
        }
    }

    /// Clear every cached value including a sticky failure.
    pub fn reset(&mut self) {
        tracing::info!("Resetting authentication state");
        self.password = None;
        self.tokens = None;
        self.token_salt = None;
        self.force_refresh = false;
        self.failure = None;
        self.set_state(AuthState::Unauthenticated);
    }

    async fn password(&mut self) -> Result<Secret, AuthError> {
        if let Some(password) = &self.password {
            return Ok(password.clone());
        }
        let (password, origin) = self.passwords.resolve().await?;
        tracing::debug!(?origin, "Resolved vault password");
        self.password = Some(password.clone());
        Ok(password)
    }

    async fn run_handshake(&mut self) -> Result<Session, AuthError> {
        let password = self.password().await?;
        let client = self.open_client_secret(&password).await?;

        if self.tokens.is_none() {
            self.tokens = self.open_token_cache(&password).await?;
        }

        let buffer = self.config.expiry_buffer();
        let tokens = match self.tokens.take() {
            Some(tokens) if !self.force_refresh && !tokens.access_token.expires_within(buffer) => {
                tracing::debug!("Using cached access token");
                tokens
            }
            Some(tokens) if tokens.refresh_token.is_some() => {
                tracing::info!("Refreshing access token");
                let mut fresh = match self.provider.refresh(&client, &tokens).await {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        let err = AuthError::from(e);
                        if matches!(err, AuthError::ProviderRejected { .. }) {
                            self.discard_token_cache().await;
                        }
                        return Err(err);
                    }
                };
                if fresh.refresh_token.is_none() {
                    fresh.refresh_token = tokens.refresh_token.clone();
                }
                self.persist(&fresh, &password).await?;
                fresh
            }
            _ => {
                tracing::info!("No usable token cache, starting consent flow");
                let fresh = self.provider.consent(&client).await?;
                self.persist(&fresh, &password).await?;
                fresh
            }
        };

        self.generation += 1;
        let session = Session::new(self.generation, &tokens.access_token);
        self.tokens = Some(tokens);
        self.force_refresh = false;
        Ok(session)
    }

    async fn open_client_secret(&self, password: &Secret) -> Result<ClientSecret, AuthError> {
        let path = self.config.credentials_path.clone();
        let vault = self.vault.clone();
        let password = password.clone();

        off_runtime(move || {
            let artifact = match CredentialVault::load(&path) {
                Ok(artifact) => artifact,
                Err(VaultError::NotFound { path }) => {
                    return Err(AuthError::Configuration {
                        message: format!(
                            "encrypted client secret not found at {}; run `mailgate encrypt` first",
                            path.display()
                        ),
                    });
                }
                Err(e) => return Err(e.into()),
            };

            let plaintext = vault.decrypt(&artifact, password.expose_bytes())?;
            ClientSecret::from_json(&plaintext).map_err(|e| AuthError::Configuration {
                message: format!(
                    "decrypted client secret is not a credentials document (line {}, column {})",
                    e.line(),
                    e.column()
                ),
            })
        })
        .await
    }

    async fn open_token_cache(&mut self, password: &Secret) -> Result<Option<TokenSet>, AuthError> {
        let path = self.config.token_path.clone();
        let vault = self.vault.clone();
        let password = password.clone();

        let opened = off_runtime(move || {
            let artifact = match CredentialVault::load(&path) {
                Ok(artifact) => artifact,
                Err(VaultError::NotFound { .. }) => {
                    tracing::debug!("No token cache at {}", path.display());
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };

            let plaintext = vault.decrypt(&artifact, password.expose_bytes())?;
            let tokens = match serde_json::from_slice::<TokenSet>(&plaintext) {
                Ok(tokens) => Some(tokens),
                Err(e) => {
                    tracing::warn!(
                        "Ignoring unreadable token cache (line {}, column {})",
                        e.line(),
                        e.column()
                    );
                    None
                }
            };
            Ok(Some((*artifact.salt(), tokens)))
        })
        .await?;

        Ok(opened.and_then(|(salt, tokens)| {
            self.token_salt = Some(salt);
            tokens
        }))
    }

    async fn persist(&mut self, tokens: &TokenSet, password: &Secret) -> Result<(), AuthError> {
        let mut stamped = tokens.clone();
        stamped.refreshed_at = Utc::now();
        let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(&stamped).map_err(|e| {
            AuthError::Internal {
                message: format!("failed to serialize token cache: {}", e),
            }
        })?);

        let path = self.config.token_path.clone();
        let vault = self.vault.clone();
        let password = password.clone();
        let salt = self.token_salt;

        let stored = off_runtime(move || {
            let artifact = match &salt {
                Some(salt) => vault.encrypt_with_salt(&plaintext, password.expose_bytes(), salt)?,
                None => vault.encrypt(&plaintext, password.expose_bytes())?,
            };

            match CredentialVault::store(&path, &artifact) {
                Ok(()) => {
                    tracing::info!("Saved token cache to {}", path.display());
                    Ok(Some(*artifact.salt()))
                }
                Err(e) => {
                    // The session is still usable; the next process start refreshes again.
                    tracing::warn!("Failed to persist token cache: {}", e);
                    Ok(None)
                }
            }
        })
        .await?;

        if stored.is_some() {
            self.token_salt = stored;
        }
        Ok(())
    }

    /// Delete the persisted token cache after the provider revoked it.
    async fn discard_token_cache(&mut self) {
        self.token_salt = None;
        let path = self.config.token_path.clone();
        let removed = off_runtime(move || CredentialVault::remove(&path).map_err(AuthError::from)).await;

        match removed {
            Ok(()) => tracing::warn!(
                "Discarded revoked token cache at {}; consent runs on the next attempt after reset",
                self.config.token_path.display()
            ),
            Err(e) => tracing::error!("Failed to discard revoked token cache: {}", e),
        }
    }
}

/// Run key derivation or artifact I/O on the blocking pool.
async fn off_runtime<T, F>(work: F) -> Result<T, AuthError>
where
    F: FnOnce() -> Result<T, AuthError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AuthError::Internal {
            message: format!("blocking task failed: {}", e),
        })?
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("state", &self.state())
            .field("generation", &self.generation)
            .field("credentials_path", &self.config.credentials_path)
            .field("token_path", &self.config.token_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::PasswordPrompt;
    use crate::provider::MailRequest;
    use crate::token::Token;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const ITERATIONS: u32 = 16;

    struct NoPrompt;

    #[async_trait]
    impl PasswordPrompt for NoPrompt {
        async fn prompt(&self, _message: &str) -> Result<Secret, PropagationError> {
            Err(PropagationError::PromptFailed {
                message: "not a terminal".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct StubProvider {
        consents: AtomicUsize,
        refreshes: AtomicUsize,
        reject_refresh: bool,
    }

    #[async_trait]
    impl MailProvider for StubProvider {
        async fn consent(&self, _client: &ClientSecret) -> Result<TokenSet, ProviderError> {
            let n = self.consents.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TokenSet::new(
                Token::new(format!("consent-{}", n)).with_expiry(Utc::now() + Duration::hours(1)),
            )
            .with_refresh_token("refresh-1"))
        }

        async fn refresh(&self, _client: &ClientSecret, _tokens: &TokenSet) -> Result<TokenSet, ProviderError> {
            if self.reject_refresh {
                return Err(ProviderError::Rejected {
                    message: "invalid_grant".to_string(),
                });
            }
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TokenSet::new(
                Token::new(format!("refreshed-{}", n)).with_expiry(Utc::now() + Duration::hours(1)),
            ))
        }

        async fn call(&self, _session: &Session, _request: &MailRequest) -> Result<serde_json::Value, ProviderError> {
            Ok(serde_json::Value::Null)
        }
    }

    struct Fixture {
        dir: TempDir,
        env_var: String,
    }

    impl Fixture {
        fn new(name: &str, password: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let vault = CredentialVault::with_iterations(ITERATIONS);
            let client = br#"{"installed":{"client_id":"id","client_secret":"secret"}}"#;
            let artifact = vault.encrypt(client, password.as_bytes()).unwrap();
            CredentialVault::store(&dir.path().join("credentials.encrypted"), &artifact).unwrap();

            let env_var = format!("MAILGATE_TEST_SESSION_{}", name);
            // SAFETY: every test uses its own variable name.
            unsafe { std::env::set_var(&env_var, password) };
            Self { dir, env_var }
        }

        fn session(&self, provider: Arc<dyn MailProvider>) -> AuthSession {
            let config = AuthConfig {
                credentials_path: self.dir.path().join("credentials.encrypted"),
                token_path: self.dir.path().join("token.encrypted"),
                kdf_iterations: ITERATIONS,
                password_env: self.env_var.clone(),
                ..AuthConfig::default()
            };
            let passwords = PasswordSource::with_prompt(self.env_var.clone(), NoPrompt);
            AuthSession::with_password_source(config, provider, passwords)
        }

        fn token_path(&self) -> std::path::PathBuf {
            self.dir.path().join("token.encrypted")
        }
    }

    #[tokio::test]
    async fn test_first_run_consents_and_persists_tokens() {
        let fixture = Fixture::new("FIRST_RUN", "correct");
        let provider = Arc::new(StubProvider::default());
        let mut session = fixture.session(provider.clone());

        assert_eq!(session.state(), AuthState::Unauthenticated);
        let handle = session.authenticate().await.unwrap();
        assert_eq!(handle.access_token().expose(), "consent-1");
        assert_eq!(handle.generation(), 1);
        assert_eq!(session.state(), AuthState::Authenticated);
        assert!(fixture.token_path().exists());

        // A new process start reuses the persisted tokens.
        let mut restarted = fixture.session(provider.clone());
        let handle = restarted.authenticate().await.unwrap();
        assert_eq!(handle.access_token().expose(), "consent-1");
        assert_eq!(provider.consents.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh_and_keeps_refresh_token() {
        let fixture = Fixture::new("INVALIDATE", "correct");
        let provider = Arc::new(StubProvider::default());
        let mut session = fixture.session(provider.clone());
        session.authenticate().await.unwrap();
        let salt_before = *CredentialVault::load(&fixture.token_path()).unwrap().salt();

        session.invalidate();
        assert_eq!(session.state(), AuthState::Unauthenticated);

        let handle = session.authenticate().await.unwrap();
        assert_eq!(handle.access_token().expose(), "refreshed-1");
        assert_eq!(handle.generation(), 2);

        let artifact = CredentialVault::load(&fixture.token_path()).unwrap();
        assert_eq!(artifact.salt(), &salt_before);
        let plaintext = CredentialVault::with_iterations(ITERATIONS)
            .decrypt(&artifact, b"correct")
            .unwrap();
        let stored: TokenSet = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(stored.refresh_token.unwrap().expose(), "refresh-1");
    }

    #[tokio::test]
    async fn test_wrong_password_clears_cache_and_writes_nothing() {
        let fixture = Fixture::new("WRONG_PASSWORD", "correct");
        // SAFETY: variable is unique to this test.
        unsafe { std::env::set_var(&fixture.env_var, "wrong") };
        let provider = Arc::new(StubProvider::default());
        let mut session = fixture.session(provider.clone());

        assert_eq!(session.authenticate().await.unwrap_err(), AuthError::DecryptionFailed);
        assert_eq!(session.state(), AuthState::Unauthenticated);
        assert!(!fixture.token_path().exists());
        assert_eq!(provider.consents.load(Ordering::SeqCst), 0);

        // The cached password was dropped, so a corrected value is picked up.
        // SAFETY: as above.
        unsafe { std::env::set_var(&fixture.env_var, "correct") };
        assert!(session.authenticate().await.is_ok());
    }

    #[tokio::test]
    async fn test_rejection_is_sticky_until_reset() {
        let fixture = Fixture::new("REJECTED", "correct");
        let good = Arc::new(StubProvider::default());
        fixture.session(good).authenticate().await.unwrap();

        let provider = Arc::new(StubProvider {
            reject_refresh: true,
            ..StubProvider::default()
        });
        let mut session = fixture.session(provider.clone());
        session.authenticate().await.unwrap();
        session.invalidate();

        let err = session.authenticate().await.unwrap_err();
        assert!(matches!(err, AuthError::ProviderRejected { .. }));
        assert_eq!(session.state(), AuthState::Failed);
        assert_eq!(session.authenticate().await.unwrap_err(), err);

        session.reset();
        assert_eq!(session.state(), AuthState::Unauthenticated);
        assert!(session.failure().is_none());
    }

    #[tokio::test]
    async fn test_rejected_refresh_discards_token_cache_and_reruns_consent() {
        let fixture = Fixture::new("REVOKED", "correct");
        fixture.session(Arc::new(StubProvider::default())).authenticate().await.unwrap();
        assert!(fixture.token_path().exists());

        let provider = Arc::new(StubProvider {
            reject_refresh: true,
            ..StubProvider::default()
        });
        let mut session = fixture.session(provider.clone());
        session.authenticate().await.unwrap();
        session.invalidate();

        assert!(matches!(
            session.authenticate().await,
            Err(AuthError::ProviderRejected { .. })
        ));
        assert!(!fixture.token_path().exists());

        session.reset();
        let handle = session.authenticate().await.unwrap();
        assert_eq!(handle.access_token().expose(), "consent-1");
        assert_eq!(provider.consents.load(Ordering::SeqCst), 1);
        assert!(fixture.token_path().exists());
    }

    #[tokio::test]
    async fn test_missing_client_secret_is_configuration_error() {
        let fixture = Fixture::new("MISSING", "correct");
        std::fs::remove_file(fixture.dir.path().join("credentials.encrypted")).unwrap();
        let mut session = fixture.session(Arc::new(StubProvider::default()));

        assert!(matches!(
            session.authenticate().await,
            Err(AuthError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_password_without_terminal() {
        let fixture = Fixture::new("NO_PASSWORD", "correct");
        // SAFETY: variable is unique to this test.
        unsafe { std::env::remove_var(&fixture.env_var) };
        let mut session = fixture.session(Arc::new(StubProvider::default()));

        assert!(matches!(
            session.authenticate().await,
            Err(AuthError::PasswordUnavailable { .. })
        ));
    }

    #[test]
    fn test_errors_do_not_leak_secrets() {
        let err = AuthError::from(VaultError::WrongPasswordOrCorruptData);
        assert_eq!(err, AuthError::DecryptionFailed);
        assert!(!err.to_string().contains("correct"));
    }
}

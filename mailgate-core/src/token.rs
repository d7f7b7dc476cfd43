//! OAuth credential material and the authenticated session handle.
//!
//! This module provides:
//! - [`ClientSecret`] - The OAuth application credentials decrypted from the vault
//! - [`Token`] - A single access token with metadata
//! - [`TokenSet`] - The token cache persisted between process starts
//! - [`Session`] - The handle passed to every provider call

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::secret::Secret;

/// OAuth application credentials (client id/secret and endpoints).
///
/// Parsed from the provider's downloaded credentials JSON, which nests the
/// fields under `"installed"` (desktop apps) or `"web"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,

    pub client_secret: Secret,

    /// Authorization endpoint.
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,

    /// Token endpoint.
    #[serde(default = "default_token_uri")]
    pub token_uri: String,

    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

fn default_auth_uri() -> String {
    "https://accounts.google.com/o/oauth2/auth".to_string()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Deserialize)]
struct CredentialsFile {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

impl ClientSecret {
    /// Parse a downloaded credentials document.
    ///
    /// Accepts the `{"installed": {...}}` and `{"web": {...}}` wrappers as well
    /// as a bare object.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        if value.get("installed").is_some() || value.get("web").is_some() {
            let file = CredentialsFile::deserialize(&value)?;
            if let Some(client) = file.installed.or(file.web) {
                return Ok(client);
            }
        }
        serde_json::from_value(value)
    }

    /// The client id shortened for display.
    pub fn masked_client_id(&self) -> String {
        let prefix: String = self.client_id.chars().take(20).collect();
        if prefix.len() < self.client_id.len() {
            format!("{}...", prefix)
        } else {
            prefix
        }
    }
}

/// A single token with its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// The access token value.
    pub access_token: Secret,

    /// Token type (usually "Bearer").
    pub token_type: String,

    /// When this token expires (None if unknown or non-expiring).
    pub expires_at: Option<DateTime<Utc>>,

    /// OAuth scopes associated with this token.
    pub scopes: Vec<String>,
}

impl Token {
    /// Create a new token.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token),
            token_type: "Bearer".to_string(),
            expires_at: None,
            scopes: Vec::new(),
        }
    }

    /// Create a token with an expiration time.
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Create a token with scopes.
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Check if this token has expired.
    ///
    /// Returns `false` if no expiration is set.
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|exp| exp < Utc::now()).unwrap_or(false)
    }

    /// Check if this token will expire within the given duration.
    pub fn expires_within(&self, duration: Duration) -> bool {
        self.expires_at
            .map(|exp| exp < Utc::now() + duration)
            .unwrap_or(false)
    }
}

/// The decrypted token cache: access token plus optional refresh token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    /// The current access token.
    pub access_token: Token,

    /// The refresh token (if available).
    pub refresh_token: Option<Secret>,

    /// When this token set was last refreshed.
    pub refreshed_at: DateTime<Utc>,
}

impl TokenSet {
    /// Create a new token set with just an access token.
    pub fn new(access_token: Token) -> Self {
        Self {
            access_token,
            refresh_token: None,
            refreshed_at: Utc::now(),
        }
    }

    /// Create a token set with both access and refresh tokens.
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(Secret::new(refresh_token));
        self
    }
}

/// An authenticated handle for issuing provider calls.
///
/// Cheap to clone. A re-authentication produces a new `Session` with a
/// higher `generation`; existing handles are never mutated.
#[derive(Debug, Clone)]
pub struct Session {
    generation: u64,
    access_token: Secret,
    expires_at: Option<DateTime<Utc>>,
    scopes: Vec<String>,
}

impl Session {
    pub fn new(generation: u64, token: &Token) -> Self {
        Self {
            generation,
            access_token: token.access_token.clone(),
            expires_at: token.expires_at,
            scopes: token.scopes.clone(),
        }
    }

    /// Monotonic per-process authentication counter.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bearer token for the `Authorization` header.
    pub fn access_token(&self) -> &Secret {
        &self.access_token
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Check if the session's token will expire within `buffer`.
    pub fn expires_within(&self, buffer: Duration) -> bool {
        self.expires_at
            .map(|exp| exp < Utc::now() + buffer)
            .unwrap_or(false)
    }
}

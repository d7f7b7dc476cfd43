//! Google OAuth and Gmail implementation of [`MailProvider`].
//!
//! This module provides:
//! - [`create_oauth_client`] - An `oauth2` client built from the decrypted [`ClientSecret`]
//! - [`pkce`] - Authorization-code consent with PKCE and a loopback redirect
//! - [`gmail`] - [`GmailProvider`] and its REST operations
//!
//! # Features
//!
//! This module is only available when the `google` feature is enabled.
//!
//! [`MailProvider`]: crate::provider::MailProvider

pub mod gmail;
pub mod pkce;

pub use gmail::{GmailOperation, GmailProvider};

use oauth2::basic::{BasicClient, BasicErrorResponseType};
use oauth2::{AuthUrl, ClientId, RedirectUrl, RequestTokenError, TokenResponse, TokenUrl};

use crate::provider::ProviderError;
use crate::token::{ClientSecret, Token, TokenSet};

/// Scopes requested during consent.
pub const GMAIL_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.send",
    "https://www.googleapis.com/auth/gmail.modify",
];

/// Create an OAuth2 client from decrypted application credentials.
pub fn create_oauth_client(
    client: &ClientSecret,
    redirect_uri: Option<&str>,
) -> Result<BasicClient, ProviderError> {
    let auth_url = AuthUrl::new(client.auth_uri.clone()).map_err(|e| ProviderError::Fatal {
        message: format!("invalid auth URL: {}", e),
    })?;

    let token_url = TokenUrl::new(client.token_uri.clone()).map_err(|e| ProviderError::Fatal {
        message: format!("invalid token URL: {}", e),
    })?;

    let mut oauth = BasicClient::new(
        ClientId::new(client.client_id.clone()),
        Some(oauth2::ClientSecret::new(
            client.client_secret.expose().to_string(),
        )),
        auth_url,
        Some(token_url),
    );

    if let Some(redirect) = redirect_uri {
        let redirect_url = RedirectUrl::new(redirect.to_string()).map_err(|e| ProviderError::Fatal {
            message: format!("invalid redirect URL: {}", e),
        })?;
        oauth = oauth.set_redirect_uri(redirect_url);
    }

    Ok(oauth)
}

/// Classify a failed token endpoint request.
///
/// `invalid_grant` means the refresh token or authorization code is no longer
/// accepted; transport failures are transient.
pub(crate) fn classify_token_error<RE>(
    err: RequestTokenError<RE, oauth2::StandardErrorResponse<BasicErrorResponseType>>,
) -> ProviderError
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => match response.error() {
            BasicErrorResponseType::InvalidGrant | BasicErrorResponseType::UnauthorizedClient => {
                ProviderError::Rejected {
                    message: response.error().to_string(),
                }
            }
            BasicErrorResponseType::InvalidClient => ProviderError::Rejected {
                message: "invalid_client".to_string(),
            },
            other => ProviderError::Fatal {
                message: format!("token endpoint returned {}", other),
            },
        },
        RequestTokenError::Request(e) => ProviderError::Transient {
            message: format!("token request failed: {}", e),
        },
        RequestTokenError::Parse(e, _) => ProviderError::Fatal {
            message: format!("unparseable token response: {}", e),
        },
        RequestTokenError::Other(message) => ProviderError::Fatal { message },
    }
}

/// Convert an `oauth2` token response into a [`TokenSet`].
pub(crate) fn token_set_from_response<TR, TT>(response: &TR) -> Result<TokenSet, ProviderError>
where
    TR: TokenResponse<TT>,
    TT: oauth2::TokenType,
{
    let scopes = response
        .scopes()
        .map(|s| s.iter().map(|scope| scope.to_string()).collect())
        .unwrap_or_default();

    let mut token = Token::new(response.access_token().secret().to_string()).with_scopes(scopes);

    if let Some(duration) = response.expires_in() {
        let expires_at = chrono::Utc::now()
            + chrono::Duration::from_std(duration).map_err(|e| ProviderError::Fatal {
                message: format!("invalid expiration duration: {}", e),
            })?;
        token = token.with_expiry(expires_at);
    }

    let mut token_set = TokenSet::new(token);
    if let Some(refresh_token) = response.refresh_token() {
        token_set = token_set.with_refresh_token(refresh_token.secret());
    }
    Ok(token_set)
}

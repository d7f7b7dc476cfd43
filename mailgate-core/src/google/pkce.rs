//! Authorization Code flow with PKCE and a one-shot loopback redirect.
//!
//! # Flow Overview
//!
//! 1. Bind a listener on `127.0.0.1` with an ephemeral port
//! 2. Build the authorization URL with state and PKCE challenge
//! 3. The operator authorizes in a browser
//! 4. Receive the authorization code on the loopback redirect
//! 5. Exchange the code for tokens using the PKCE verifier

use oauth2::reqwest::async_http_client;
use oauth2::{AuthorizationCode, CsrfToken, PkceCodeChallenge, PkceCodeVerifier, Scope};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use super::{classify_token_error, create_oauth_client, token_set_from_response};
use crate::provider::ProviderError;
use crate::token::{ClientSecret, TokenSet};

/// A consent flow in progress.
pub struct PkceFlow {
    client: ClientSecret,
    listener: TcpListener,
    redirect_uri: String,
    verifier: Option<PkceCodeVerifier>,
    state: Option<CsrfToken>,
}

impl PkceFlow {
    /// Bind the loopback redirect listener.
    pub async fn bind(client: ClientSecret) -> Result<Self, ProviderError> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| ProviderError::Fatal {
                message: format!("failed to bind redirect listener: {}", e),
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| ProviderError::Fatal {
                message: format!("failed to read listener address: {}", e),
            })?
            .port();

        Ok(Self {
            client,
            listener,
            redirect_uri: format!("http://127.0.0.1:{}/", port),
            verifier: None,
            state: None,
        })
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Build the URL the operator must visit.
    pub fn authorization_url(&mut self, scopes: &[&str]) -> Result<String, ProviderError> {
        let oauth = create_oauth_client(&self.client, Some(self.redirect_uri.as_str()))?;
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();

        let mut request = oauth
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(challenge)
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent");
        for scope in scopes {
            request = request.add_scope(Scope::new(scope.to_string()));
        }

        let (url, state) = request.url();
        self.verifier = Some(verifier);
        self.state = Some(state);
        Ok(url.to_string())
    }

    /// Wait for the redirect and return the authorization code.
    pub async fn receive_code(&self) -> Result<String, ProviderError> {
        let expected = self
            .state
            .as_ref()
            .ok_or_else(|| ProviderError::Fatal {
                message: "authorization URL was not built".to_string(),
            })?
            .secret()
            .clone();

        loop {
            let (mut socket, _) = self.listener.accept().await.map_err(|e| ProviderError::Fatal {
                message: format!("failed to accept redirect: {}", e),
            })?;

            let mut buffer = [0; 4096];
            let n = socket.read(&mut buffer).await.map_err(|e| ProviderError::Fatal {
                message: format!("failed to read redirect: {}", e),
            })?;

            match parse_redirect(&String::from_utf8_lossy(&buffer[..n]), &expected) {
                Some(Ok(code)) => {
                    let _ = socket.write_all(PAGE_SUCCESS).await;
                    return Ok(code);
                }
                Some(Err(err)) => {
                    let _ = socket.write_all(PAGE_FAILED).await;
                    return Err(err);
                }
                // Favicon requests and similar noise.
                None => {
                    let _ = socket.write_all(PAGE_BAD_REQUEST).await;
                }
            }
        }
    }

    /// Exchange the authorization code for tokens.
    pub async fn exchange_code(&mut self, code: String) -> Result<TokenSet, ProviderError> {
        let verifier = self.verifier.take().ok_or_else(|| ProviderError::Fatal {
            message: "PKCE verifier not found; build the authorization URL first".to_string(),
        })?;

        let oauth = create_oauth_client(&self.client, Some(self.redirect_uri.as_str()))?;
        let response = oauth
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(verifier)
            .request_async(async_http_client)
            .await
            .map_err(classify_token_error)?;

        token_set_from_response(&response)
    }
}

const PAGE_SUCCESS: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n\
    <html><body><h1>Authentication complete</h1>\
    <p>You can close this window.</p></body></html>";

const PAGE_FAILED: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n\
    <html><body><h1>Authentication failed</h1></body></html>";

const PAGE_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";

/// Extract the authorization code from a raw redirect request.
///
/// Returns `None` when the request carries neither a code nor an error.
fn parse_redirect(request: &str, expected_state: &str) -> Option<Result<String, ProviderError>> {
    let target = request.lines().next()?.split_whitespace().nth(1)?;
    let url = url::Url::parse(&format!("http://127.0.0.1{}", target)).ok()?;

    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(error) = error {
        return Some(Err(ProviderError::Rejected {
            message: format!("consent denied: {}", error),
        }));
    }

    let code = code?;
    if state.as_deref() != Some(expected_state) {
        return Some(Err(ProviderError::Fatal {
            message: "state parameter mismatch".to_string(),
        }));
    }
    Some(Ok(code))
}

//! Gmail REST client.
//!
//! Operations arrive as a name plus JSON arguments and are decoded into
//! [`GmailOperation`]:
//!
//! | operation | args |
//! |---|---|
//! | `list_messages` | `query` (default `""`), `max_results` (default 10) |
//! | `get_message` | `id` |
//! | `send_message` | `to`, `subject`, `body`, optional `html` |
//! | `modify_labels` | `id`, `add`, `remove` |
//! | `trash_message` | `id` |
//! | `star_message` | `id`, `starred` (default true) |
//! | `mark_as_read` / `mark_as_unread` | `id` |
//! | `mark_as_spam` | `id` |
//! | `list_labels` | none |
//! | `bulk_modify_labels` | `message_ids`, `add`, `remove` |
//! | `bulk_mark_as_read` / `bulk_mark_as_spam` | `message_ids` |
//! | `bulk_move_to_trash` / `bulk_add_star` | `message_ids` |
//!
//! `message_ids` is a list or a comma-separated string. Bulk operations
//! modify each message in turn and report per-message outcomes; they fail as
//! a whole only when no message could be modified or the session expired.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use oauth2::reqwest::async_http_client;
use oauth2::RefreshToken;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use super::pkce::PkceFlow;
use super::{GMAIL_SCOPES, classify_token_error, create_oauth_client, token_set_from_response};
use crate::provider::{FailureKind, MailProvider, MailRequest, ProviderError};
use crate::token::{ClientSecret, Session, TokenSet};

/// Default Gmail API base URL.
pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

fn default_max_results() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

/// Non-empty list of message ids.
///
/// Deserializes from `["a", "b"]` or `"a, b"`; blank entries are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "MessageIdList")]
pub struct MessageIds(Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum MessageIdList {
    Joined(String),
    Items(Vec<String>),
}

impl TryFrom<MessageIdList> for MessageIds {
    type Error = String;

    fn try_from(list: MessageIdList) -> Result<Self, Self::Error> {
        let raw: Vec<String> = match list {
            MessageIdList::Joined(joined) => joined.split(',').map(str::to_string).collect(),
            MessageIdList::Items(items) => items,
        };
        let ids: Vec<String> = raw
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Err("no valid message ids provided".to_string());
        }
        Ok(Self(ids))
    }
}

impl MessageIds {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// A decoded Gmail operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "operation", content = "args", rename_all = "snake_case")]
pub enum GmailOperation {
    ListMessages {
        #[serde(default)]
        query: String,
        #[serde(default = "default_max_results")]
        max_results: u32,
    },
    GetMessage {
        id: String,
    },
    SendMessage {
        to: String,
        subject: String,
        body: String,
        #[serde(default)]
        html: Option<String>,
    },
    ModifyLabels {
        id: String,
        #[serde(default)]
        add: Vec<String>,
        #[serde(default)]
        remove: Vec<String>,
    },
    TrashMessage {
        id: String,
    },
    StarMessage {
        id: String,
        #[serde(default = "default_true")]
        starred: bool,
    },
    MarkAsRead {
        id: String,
    },
    MarkAsUnread {
        id: String,
    },
    MarkAsSpam {
        id: String,
    },
    ListLabels {},
    BulkModifyLabels {
        message_ids: MessageIds,
        #[serde(default)]
        add: Vec<String>,
        #[serde(default)]
        remove: Vec<String>,
    },
    BulkMarkAsRead {
        message_ids: MessageIds,
    },
    BulkMarkAsSpam {
        message_ids: MessageIds,
    },
    BulkMoveToTrash {
        message_ids: MessageIds,
    },
    BulkAddStar {
        message_ids: MessageIds,
    },
}

impl GmailOperation {
    /// Decode a generic request.
    pub fn from_request(request: &MailRequest) -> Result<Self, ProviderError> {
        let args = if request.args.is_null() {
            json!({})
        } else {
            request.args.clone()
        };
        serde_json::from_value(json!({ "operation": request.operation, "args": args })).map_err(|e| {
            ProviderError::InvalidRequest {
                operation: request.operation.clone(),
                message: e.to_string(),
            }
        })
    }
}

/// [`MailProvider`] backed by Google OAuth and the Gmail REST API.
#[derive(Debug, Clone)]
pub struct GmailProvider {
    http: reqwest::Client,
    api_base: String,
}

impl GmailProvider {
    pub fn new() -> Self {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    /// Use a different API root (e.g. a local mock server).
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{}", self.api_base, path)
    }

    async fn get(&self, session: &Session, path: &str, query: &[(&str, String)]) -> Result<Value, ProviderError> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(session.access_token().expose())
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        read_json(response).await
    }

    async fn post(&self, session: &Session, path: &str, body: &Value) -> Result<Value, ProviderError> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(session.access_token().expose())
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        read_json(response).await
    }

    async fn list_messages(&self, session: &Session, query: &str, max_results: u32) -> Result<Value, ProviderError> {
        let listing = self
            .get(
                session,
                "messages",
                &[("q", query.to_string()), ("maxResults", max_results.to_string())],
            )
            .await?;

        let ids: Vec<String> = listing
            .get("messages")
            .and_then(Value::as_array)
            .map(|messages| {
                messages
                    .iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        tracing::debug!("Found {} messages", ids.len());

        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            let message = self
                .get(
                    session,
                    &format!("messages/{}", id),
                    &[
                        ("format", "metadata".to_string()),
                        ("metadataHeaders", "From".to_string()),
                        ("metadataHeaders", "To".to_string()),
                        ("metadataHeaders", "Subject".to_string()),
                        ("metadataHeaders", "Date".to_string()),
                    ],
                )
                .await?;
            summaries.push(summarize(&message));
        }
        Ok(Value::Array(summaries))
    }

    async fn modify(&self, session: &Session, id: &str, add: &[String], remove: &[String]) -> Result<Value, ProviderError> {
        self.post(
            session,
            &format!("messages/{}/modify", id),
            &json!({ "addLabelIds": add, "removeLabelIds": remove }),
        )
        .await
    }

    /// Apply the same label change to every message.
    ///
    /// Per-message failures are collected; an expired session aborts the
    /// batch so the caller can re-authenticate and resubmit it.
    async fn bulk_modify(
        &self,
        session: &Session,
        ids: &MessageIds,
        add: &[String],
        remove: &[String],
    ) -> Result<Value, ProviderError> {
        tracing::info!(
            "Bulk modifying labels for {} messages (add={:?}, remove={:?})",
            ids.as_slice().len(),
            add,
            remove
        );

        let mut results = Vec::with_capacity(ids.as_slice().len());
        let mut succeeded = 0usize;
        let mut first_failure = None;

        for id in ids.as_slice() {
            match self.modify(session, id, add, remove).await {
                Ok(message) => {
                    succeeded += 1;
                    results.push(json!({
                        "id": id,
                        "ok": true,
                        "label_ids": message.get("labelIds").cloned().unwrap_or_else(|| json!([])),
                    }));
                }
                Err(err) if matches!(err.kind(), FailureKind::AuthExpired | FailureKind::Rejected) => {
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!("Failed to modify message {}: {}", id, err);
                    results.push(json!({ "id": id, "ok": false, "error": err.to_string() }));
                    first_failure.get_or_insert(err);
                }
            }
        }

        let total = results.len();
        tracing::info!("Bulk operation completed: {}/{} succeeded", succeeded, total);
        if succeeded == 0 {
            if let Some(err) = first_failure {
                return Err(err);
            }
        }

        Ok(json!({
            "total": total,
            "succeeded": succeeded,
            "failed": total - succeeded,
            "results": results,
        }))
    }
}

impl Default for GmailProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    async fn consent(&self, client: &ClientSecret) -> Result<TokenSet, ProviderError> {
        let mut flow = PkceFlow::bind(client.clone()).await?;
        let url = flow.authorization_url(GMAIL_SCOPES)?;

        tracing::info!("Waiting for OAuth consent on {}", flow.redirect_uri());
        eprintln!("Open this URL in a browser to authorize access:\n\n{}\n", url);

        let code = flow.receive_code().await?;
        flow.exchange_code(code).await
    }

    async fn refresh(&self, client: &ClientSecret, tokens: &TokenSet) -> Result<TokenSet, ProviderError> {
        let refresh_token = tokens.refresh_token.as_ref().ok_or_else(|| ProviderError::Rejected {
            message: "no refresh token available".to_string(),
        })?;

        let oauth = create_oauth_client(client, None)?;
        let response = oauth
            .exchange_refresh_token(&RefreshToken::new(refresh_token.expose().to_string()))
            .request_async(async_http_client)
            .await
            .map_err(classify_token_error)?;

        let mut refreshed = token_set_from_response(&response)?;
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = Some(refresh_token.clone());
        }
        tracing::debug!("Refreshed access token");
        Ok(refreshed)
    }

    async fn call(&self, session: &Session, request: &MailRequest) -> Result<Value, ProviderError> {
        match GmailOperation::from_request(request)? {
            GmailOperation::ListMessages { query, max_results } => {
                self.list_messages(session, &query, max_results).await
            }
            GmailOperation::GetMessage { id } => self.get(session, &format!("messages/{}", id), &[]).await,
            GmailOperation::SendMessage { to, subject, body, html } => {
                let raw = build_raw_message(&to, &subject, &body, html.as_deref()).map_err(|message| {
                    ProviderError::InvalidRequest {
                        operation: request.operation.clone(),
                        message,
                    }
                })?;
                self.post(session, "messages/send", &json!({ "raw": raw })).await
            }
            GmailOperation::ModifyLabels { id, add, remove } => self.modify(session, &id, &add, &remove).await,
            GmailOperation::TrashMessage { id } => {
                self.modify(session, &id, &["TRASH".to_string()], &[]).await
            }
            GmailOperation::StarMessage { id, starred } => {
                let label = ["STARRED".to_string()];
                if starred {
                    self.modify(session, &id, &label, &[]).await
                } else {
                    self.modify(session, &id, &[], &label).await
                }
            }
            GmailOperation::MarkAsRead { id } => self.modify(session, &id, &[], &labels(&["UNREAD"])).await,
            GmailOperation::MarkAsUnread { id } => self.modify(session, &id, &labels(&["UNREAD"]), &[]).await,
            GmailOperation::MarkAsSpam { id } => {
                self.modify(session, &id, &labels(&["SPAM"]), &labels(&["INBOX"])).await
            }
            GmailOperation::ListLabels {} => self.get(session, "labels", &[]).await,
            GmailOperation::BulkModifyLabels { message_ids, add, remove } => {
                if add.is_empty() && remove.is_empty() {
                    return Err(ProviderError::InvalidRequest {
                        operation: request.operation.clone(),
                        message: "no labels specified to add or remove".to_string(),
                    });
                }
                self.bulk_modify(session, &message_ids, &add, &remove).await
            }
            GmailOperation::BulkMarkAsRead { message_ids } => {
                self.bulk_modify(session, &message_ids, &[], &labels(&["UNREAD"])).await
            }
            GmailOperation::BulkMarkAsSpam { message_ids } => {
                self.bulk_modify(session, &message_ids, &labels(&["SPAM"]), &labels(&["INBOX"]))
                    .await
            }
            GmailOperation::BulkMoveToTrash { message_ids } => {
                self.bulk_modify(session, &message_ids, &labels(&["TRASH"]), &[]).await
            }
            GmailOperation::BulkAddStar { message_ids } => {
                self.bulk_modify(session, &message_ids, &labels(&["STARRED"]), &[]).await
            }
        }
    }
}

fn labels(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    ProviderError::Transient {
        message: format!("request failed: {}", err),
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.map_err(|e| ProviderError::Fatal {
            message: format!("invalid response body: {}", e),
        });
    }

    let detail = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
    let message = format!("HTTP {}: {}", status.as_u16(), detail);

    Err(match status {
        StatusCode::UNAUTHORIZED => ProviderError::AuthExpired { message },
        StatusCode::TOO_MANY_REQUESTS => ProviderError::Transient { message },
        s if s.is_server_error() => ProviderError::Transient { message },
        _ => ProviderError::Fatal { message },
    })
}

fn summarize(message: &Value) -> Value {
    let header = |name: &str| -> Value {
        message
            .pointer("/payload/headers")
            .and_then(Value::as_array)
            .and_then(|headers| {
                headers
                    .iter()
                    .find(|h| h.get("name").and_then(Value::as_str) == Some(name))
            })
            .and_then(|h| h.get("value").cloned())
            .unwrap_or(Value::Null)
    };

    json!({
        "id": message.get("id").cloned().unwrap_or(Value::Null),
        "thread_id": message.get("threadId").cloned().unwrap_or(Value::Null),
        "from": header("From"),
        "to": header("To"),
        "subject": header("Subject"),
        "date": header("Date"),
        "snippet": message.get("snippet").cloned().unwrap_or(Value::Null),
        "label_ids": message.get("labelIds").cloned().unwrap_or_else(|| json!([])),
    })
}

/// Build a base64url-encoded RFC 2822 message.
fn build_raw_message(to: &str, subject: &str, body: &str, html: Option<&str>) -> Result<String, String> {
    if to.contains(['\r', '\n']) || subject.contains(['\r', '\n']) {
        return Err("header values must not contain line breaks".to_string());
    }
    if to.trim().is_empty() {
        return Err("recipient must not be empty".to_string());
    }

    let mut message = format!("To: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\n", to, subject);
    match html {
        None => {
            message.push_str("Content-Type: text/plain; charset=\"UTF-8\"\r\n\r\n");
            message.push_str(body);
        }
        Some(html) => {
            let boundary = format!("mailgate-{}", uuid::Uuid::new_v4().simple());
            message.push_str(&format!(
                "Content-Type: multipart/alternative; boundary=\"{b}\"\r\n\r\n\
                 --{b}\r\nContent-Type: text/plain; charset=\"UTF-8\"\r\n\r\n{text}\r\n\
                 --{b}\r\nContent-Type: text/html; charset=\"UTF-8\"\r\n\r\n{html}\r\n\
                 --{b}--\r\n",
                b = boundary,
                text = body,
                html = html,
            ));
        }
    }
    Ok(URL_SAFE.encode(message.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_operations() {
        let op = GmailOperation::from_request(&MailRequest::new("list_messages", json!({"query": "is:unread"})))
            .unwrap();
        assert_eq!(
            op,
            GmailOperation::ListMessages {
                query: "is:unread".to_string(),
                max_results: 10
            }
        );

        let op = GmailOperation::from_request(&MailRequest::new("list_labels", Value::Null)).unwrap();
        assert_eq!(op, GmailOperation::ListLabels {});

        let op = GmailOperation::from_request(&MailRequest::new("star_message", json!({"id": "m1"}))).unwrap();
        assert_eq!(
            op,
            GmailOperation::StarMessage {
                id: "m1".to_string(),
                starred: true
            }
        );
    }

    #[test]
    fn test_decode_rejects_unknown_and_malformed() {
        let err = GmailOperation::from_request(&MailRequest::new("delete_everything", Value::Null)).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest { .. }));

        let err = GmailOperation::from_request(&MailRequest::new("get_message", json!({}))).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest { .. }));
    }

    #[test]
    fn test_decode_message_ids_from_list_or_joined_string() {
        let op = GmailOperation::from_request(&MailRequest::new(
            "bulk_mark_as_read",
            json!({"message_ids": " m1, m2 ,,m3 "}),
        ))
        .unwrap();
        let GmailOperation::BulkMarkAsRead { message_ids } = op else {
            panic!("unexpected operation {:?}", op);
        };
        assert_eq!(message_ids.as_slice(), ["m1", "m2", "m3"]);

        let op = GmailOperation::from_request(&MailRequest::new(
            "bulk_modify_labels",
            json!({"message_ids": ["a", " ", "b"], "add": ["Label_1"]}),
        ))
        .unwrap();
        assert_eq!(
            op,
            GmailOperation::BulkModifyLabels {
                message_ids: MessageIds(vec!["a".to_string(), "b".to_string()]),
                add: vec!["Label_1".to_string()],
                remove: vec![],
            }
        );
    }

    #[test]
    fn test_decode_rejects_empty_message_ids() {
        for ids in [json!(""), json!(" , ,"), json!([]), json!([" "]), json!(42)] {
            let request = MailRequest::new("bulk_move_to_trash", json!({ "message_ids": ids }));
            let err = GmailOperation::from_request(&request).unwrap_err();
            assert!(matches!(err, ProviderError::InvalidRequest { .. }), "{:?}", ids);
        }
    }

    #[test]
    fn test_raw_message_plain_and_html() {
        let raw = build_raw_message("a@example.com", "Hi", "hello", None).unwrap();
        let decoded = String::from_utf8(URL_SAFE.decode(raw).unwrap()).unwrap();
        assert!(decoded.starts_with("To: a@example.com\r\nSubject: Hi\r\n"));
        assert!(decoded.ends_with("\r\n\r\nhello"));

        let raw = build_raw_message("a@example.com", "Hi", "hello", Some("<b>hello</b>")).unwrap();
        let decoded = String::from_utf8(URL_SAFE.decode(raw).unwrap()).unwrap();
        assert!(decoded.contains("multipart/alternative"));
        assert!(decoded.contains("<b>hello</b>"));
    }

    #[test]
    fn test_raw_message_rejects_header_injection() {
        assert!(build_raw_message("a@example.com\r\nBcc: b@example.com", "Hi", "x", None).is_err());
        assert!(build_raw_message("", "Hi", "x", None).is_err());
    }
}

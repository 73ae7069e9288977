//! Microsoft Graph client
//!
//! Mail operations against Graph v1.0 for the signed-in user. Every request
//! carries a bearer token from the configured [`TokenProvider`] and a fresh
//! `client-request-id`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tsubame_mailr::auth::StaticToken;
//! use tsubame_mailr::config::GraphConfig;
//! use tsubame_mailr::graph::GraphClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = GraphClient::new(&GraphConfig::default(), Arc::new(StaticToken::new("token")))?;
//! let me = client.me().await?;
//! println!("Hello, {:?}", me.display_name);
//! # Ok(())
//! # }
//! ```
//!
//! # Tracing
//!
//! | Operation | Span Name | Request |
//! |-----------|-----------|---------|
//! | `me` | `graph.me` | `GET /me` |
//! | `inbox` | `graph.inbox` | `GET /me/mailFolders/inbox/messages` |
//! | `send_mail` | `graph.send_mail` | `POST /me/sendMail` |
//! | `create_draft` | `graph.create_draft` | `POST /me/messages` |
//! | `create_upload_session` | `graph.create_upload_session` | `POST /me/messages/{id}/attachments/createUploadSession` |
//! | `send_draft` | `graph.send_draft` | `POST /me/messages/{id}/send` |

pub mod types;

use crate::auth::{AuthError, TokenProvider};
use crate::config::GraphConfig;
use crate::metrics;
use crate::upload::uploader::parse_range_start;
use crate::upload::UploadSession;
use crate::workflow::MailComposer;
use async_trait::async_trait;
use lazy_static::lazy_static;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use types::{
    AttachmentItem, CreateUploadSessionRequest, CreatedMessage, GraphErrorBody, Message,
    MessageCollection, SendMailRequest, UploadSessionResponse,
};

pub use types::{DraftMessage, Importance, MessageSummary, User};

lazy_static! {
    static ref ATTACHMENT_SESSION_ID: regex_lite::Regex =
        regex_lite::Regex::new(r"(?i)AttachmentSessions\('([^']+)'\)")
            .expect("attachment session pattern is valid");
}

/// Characters escaped when a Graph id is placed in a path segment
const ID_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Graph client errors
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),

    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Graph returned HTTP {status} ({code}): {message}")]
    Status {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Response error: {0}")]
    ResponseError(String),
}

impl GraphError {
    /// Build from a non-success status and the raw body
    fn from_response(status: u16, body: &str) -> Self {
        match serde_json::from_str::<GraphErrorBody>(body) {
            Ok(parsed) => Self::Status {
                status,
                code: parsed.error.code,
                message: parsed.error.message,
            },
            Err(_) => Self::Status {
                status,
                code: String::new(),
                message: body.chars().take(200).collect(),
            },
        }
    }
}

/// Microsoft Graph mail client
pub struct GraphClient {
    base_url: String,
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

impl GraphClient {
    /// Create a new Graph client
    pub fn new(config: &GraphConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self, GraphError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| GraphError::ConfigError(e.to_string()))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
            tokens,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, GraphError> {
        let token = self.tokens.token().await?;
        Ok(self
            .http
            .request(method, self.url(path))
            .bearer_auth(token)
            .header("client-request-id", uuid::Uuid::new_v4().to_string()))
    }

    async fn send(&self, request: RequestBuilder) -> Result<String, GraphError> {
        let response = request.send().await?;
        let status = response.status();
        tracing::Span::current().record("http.status_code", status.as_u16());

        let body = response.text().await?;
        if !status.is_success() {
            return Err(GraphError::from_response(status.as_u16(), &body));
        }
        Ok(body)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GraphError> {
        let body = self.send(request).await?;
        serde_json::from_str(&body).map_err(|e| GraphError::ResponseError(e.to_string()))
    }

    /// Get the signed-in user's profile
    #[tracing::instrument(
        name = "graph.me",
        skip(self),
        fields(http.method = "GET", http.status_code = tracing::field::Empty),
        err
    )]
    pub async fn me(&self) -> Result<User, GraphError> {
        let request = self
            .request(Method::GET, "me")
            .await?
            .query(&[("$select", "displayName,mail,userPrincipalName")]);
        self.send_json(request).await
    }

    /// List the newest `top` inbox messages
    #[tracing::instrument(
        name = "graph.inbox",
        skip(self),
        fields(http.method = "GET", http.status_code = tracing::field::Empty),
        err
    )]
    pub async fn inbox(&self, top: u32) -> Result<Vec<MessageSummary>, GraphError> {
        let top = top.to_string();
        let request = self
            .request(Method::GET, "me/mailFolders/inbox/messages")
            .await?
            .query(&[
                ("$select", "from,isRead,receivedDateTime,subject"),
                ("$top", top.as_str()),
                ("$orderby", "receivedDateTime DESC"),
            ]);
        let collection: MessageCollection = self.send_json(request).await?;
        Ok(collection.value)
    }

    /// Send a text message in one request, without attachments
    #[tracing::instrument(
        name = "graph.send_mail",
        skip(self, body),
        fields(http.method = "POST", http.status_code = tracing::field::Empty),
        err
    )]
    pub async fn send_mail(&self, subject: &str, body: &str, recipient: &str) -> Result<(), GraphError> {
        let message: Message = DraftMessage::new(subject, body, vec![recipient.to_string()])
            .with_importance(Importance::Normal)
            .to_message();
        let request = self
            .request(Method::POST, "me/sendMail")
            .await?
            .json(&SendMailRequest {
                message: &message,
                save_to_sent_items: true,
            });
        self.send(request).await?;
        metrics::record_message_sent(false);
        tracing::info!(recipient = recipient, "Message sent");
        Ok(())
    }

    /// Create a draft in the user's mailbox and return its id
    #[tracing::instrument(
        name = "graph.create_draft",
        skip(self, draft),
        fields(
            http.method = "POST",
            graph.message_id = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    pub async fn create_draft(&self, draft: &DraftMessage) -> Result<String, GraphError> {
        let request = self
            .request(Method::POST, "me/messages")
            .await?
            .json(&draft.to_message());
        let created: CreatedMessage = self.send_json(request).await?;

        tracing::Span::current().record("graph.message_id", created.id.as_str());
        tracing::info!(message_id = %created.id, "Draft message created");
        Ok(created.id)
    }

    /// Open a resumable upload session for an attachment of `message_id`
    #[tracing::instrument(
        name = "graph.create_upload_session",
        skip(self),
        fields(
            http.method = "POST",
            upload.session_id = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    pub async fn create_upload_session(
        &self,
        message_id: &str,
        file_name: &str,
        size: u64,
    ) -> Result<UploadSession, GraphError> {
        let path = format!(
            "me/messages/{}/attachments/createUploadSession",
            utf8_percent_encode(message_id, ID_SEGMENT)
        );
        let request = self
            .request(Method::POST, &path)
            .await?
            .json(&CreateUploadSessionRequest {
                attachment_item: AttachmentItem {
                    attachment_type: "file",
                    name: file_name,
                    size,
                },
            });
        let response: UploadSessionResponse = self.send_json(request).await?;
        let session = session_from_response(response, size)?;

        tracing::Span::current().record("upload.session_id", session.id());
        tracing::info!(
            session_id = %session.id(),
            expires_at = %session.expires_at(),
            "Upload session opened"
        );
        Ok(session)
    }

    /// Send an existing draft
    #[tracing::instrument(
        name = "graph.send_draft",
        skip(self),
        fields(http.method = "POST", http.status_code = tracing::field::Empty),
        err
    )]
    pub async fn send_draft(&self, message_id: &str) -> Result<(), GraphError> {
        let path = format!(
            "me/messages/{}/send",
            utf8_percent_encode(message_id, ID_SEGMENT)
        );
        let request = self.request(Method::POST, &path).await?;
        self.send(request).await?;
        tracing::info!(message_id = message_id, "Draft message sent");
        Ok(())
    }
}

#[async_trait]
impl MailComposer for GraphClient {
    async fn create_draft_message(&self, draft: &DraftMessage) -> Result<String, GraphError> {
        self.create_draft(draft).await
    }

    async fn open_upload_session(
        &self,
        message_id: &str,
        file_name: &str,
        size: u64,
    ) -> Result<UploadSession, GraphError> {
        self.create_upload_session(message_id, file_name, size).await
    }

    async fn send_message(&self, message_id: &str) -> Result<(), GraphError> {
        self.send_draft(message_id).await
    }
}

/// Turn a `createUploadSession` response into session state.
///
/// Graph does not return a session id; the one embedded in the upload URL
/// (`AttachmentSessions('<id>')`) is used, else the URL itself.
fn session_from_response(response: UploadSessionResponse, size: u64) -> Result<UploadSession, GraphError> {
    if response.upload_url.is_empty() {
        return Err(GraphError::ResponseError("upload session has no uploadUrl".into()));
    }

    let id = response
        .id
        .clone()
        .or_else(|| session_id_from_url(&response.upload_url))
        .unwrap_or_else(|| response.upload_url.clone());

    let start = match response.next_expected_ranges.first() {
        Some(range) => parse_range_start(range).ok_or_else(|| {
            GraphError::ResponseError(format!("malformed nextExpectedRanges entry '{}'", range))
        })?,
        None => 0,
    };
    if start > size {
        return Err(GraphError::ResponseError(format!(
            "nextExpectedRanges start {} is beyond attachment size {}",
            start, size
        )));
    }

    Ok(
        UploadSession::new(id, response.upload_url, response.expiration_date_time, size)
            .with_next_expected_offset(start),
    )
}

fn session_id_from_url(url: &str) -> Option<String> {
    ATTACHMENT_SESSION_ID
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

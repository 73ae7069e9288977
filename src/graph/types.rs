//! Microsoft Graph wire types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message importance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
}

/// Body content type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    #[default]
    Text,
    Html,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemBody {
    pub content_type: BodyType,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub email_address: EmailAddress,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            email_address: EmailAddress {
                name: None,
                address: address.into(),
            },
        }
    }
}

/// Outgoing message as posted to Graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub subject: String,
    pub importance: Importance,
    pub body: ItemBody,
    pub to_recipients: Vec<Recipient>,
}

/// What a caller wants in a new message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftMessage {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
    pub importance: Importance,
}

impl DraftMessage {
    /// Text message at low importance, the way large-attachment mail is sent
    pub fn new(subject: impl Into<String>, body: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            recipients,
            importance: Importance::Low,
        }
    }

    pub fn with_importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    pub fn to_message(&self) -> Message {
        Message {
            subject: self.subject.clone(),
            importance: self.importance,
            body: ItemBody {
                content_type: BodyType::Text,
                content: self.body.clone(),
            },
            to_recipients: self.recipients.iter().map(Recipient::new).collect(),
        }
    }
}

/// `POST /me/sendMail` body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SendMailRequest<'a> {
    pub message: &'a Message,
    pub save_to_sent_items: bool,
}

/// Message returned on creation; only the id is needed
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CreatedMessage {
    pub id: String,
}

/// `createUploadSession` request body
#[derive(Debug, Serialize)]
pub(crate) struct CreateUploadSessionRequest<'a> {
    #[serde(rename = "AttachmentItem")]
    pub attachment_item: AttachmentItem<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AttachmentItem<'a> {
    pub attachment_type: &'static str,
    pub name: &'a str,
    pub size: u64,
}

/// `createUploadSession` response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionResponse {
    #[serde(default)]
    pub id: Option<String>,
    pub upload_url: String,
    pub expiration_date_time: DateTime<Utc>,
    #[serde(default)]
    pub next_expected_ranges: Vec<String>,
}

/// Signed-in user profile
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub mail: Option<String>,
    #[serde(default)]
    pub user_principal_name: Option<String>,
}

impl User {
    /// Mail address, falling back to the principal name for accounts without one
    pub fn address(&self) -> Option<&str> {
        self.mail
            .as_deref()
            .or(self.user_principal_name.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    pub email_address: EmailAddress,
}

/// Inbox listing entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub from: Option<Sender>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub received_date_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageCollection {
    #[serde(default)]
    pub value: Vec<MessageSummary>,
}

/// Graph error envelope: `{"error": {"code", "message"}}`
#[derive(Debug, Deserialize)]
pub(crate) struct GraphErrorBody {
    pub error: GraphErrorDetail,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphErrorDetail {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

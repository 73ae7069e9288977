//! Large-attachment mail workflow
//!
//! Composes a draft, streams the attachment through a resumable upload
//! session, and sends the draft only once the upload completed.

use crate::graph::types::DraftMessage;
use crate::graph::GraphError;
use crate::metrics;
use crate::upload::{
    AttachmentSource, ChunkUploader, Clock, ResumableUploadEngine, SystemClock, UploadError,
    UploadOutcome, UploadProgress, UploadSession, UploadSettings,
};
use async_trait::async_trait;
use std::io::{Read, Seek};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Mail-composition service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailComposer: Send + Sync {
    /// Create a draft and return its message id
    async fn create_draft_message(&self, draft: &DraftMessage) -> Result<String, GraphError>;

    /// Open an upload session for an attachment of `message_id`
    async fn open_upload_session(
        &self,
        message_id: &str,
        file_name: &str,
        size: u64,
    ) -> Result<UploadSession, GraphError>;

    /// Send a previously created draft
    async fn send_message(&self, message_id: &str) -> Result<(), GraphError>;
}

/// Workflow errors
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Mail service error: {0}")]
    Compose(#[from] GraphError),

    /// The upload ended without completing. The draft is left in place and
    /// `session` holds the last known server offset.
    #[error("Attachment upload for message {message_id} failed: {source}")]
    Upload {
        message_id: String,
        session: Box<UploadSession>,
        source: UploadError,
    },
}

impl WorkflowError {
    /// Whether the failed upload can be continued with `resume`
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Upload { source, .. } if source.is_resumable())
    }
}

/// A message sent with its attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: String,
    pub attachment_id: String,
}

type SharedProgress = Arc<dyn Fn(&UploadProgress) + Send + Sync>;

/// Sends mail with one large attachment
pub struct AttachmentWorkflow<C, U> {
    composer: C,
    uploader: U,
    settings: UploadSettings,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    on_progress: Option<SharedProgress>,
}

impl<C: MailComposer, U: ChunkUploader> AttachmentWorkflow<C, U> {
    pub fn new(composer: C, uploader: U, settings: UploadSettings) -> Self {
        Self {
            composer,
            uploader,
            settings,
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
            on_progress: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(&UploadProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Create a draft, upload `source` as `file_name` and send the draft.
    #[tracing::instrument(
        name = "workflow.send_with_attachment",
        skip(self, draft, source),
        fields(attachment.size = source.len(), mail.message_id = tracing::field::Empty)
    )]
    pub async fn send_with_attachment<R: Read + Seek>(
        &self,
        draft: &DraftMessage,
        file_name: &str,
        mut source: AttachmentSource<R>,
    ) -> Result<SentMessage, WorkflowError> {
        self.settings
            .validate()
            .map_err(|e| WorkflowError::Configuration(e.to_string()))?;
        if draft.recipients.is_empty() {
            return Err(WorkflowError::Configuration(
                "at least one recipient is required".into(),
            ));
        }

        let message_id = self.composer.create_draft_message(draft).await?;
        tracing::Span::current().record("mail.message_id", message_id.as_str());

        let session = self
            .composer
            .open_upload_session(&message_id, file_name, source.len())
            .await?;

        self.upload_and_send(message_id, session, &mut source).await
    }

    /// Continue a checkpointed upload for an existing draft, then send it.
    #[tracing::instrument(
        name = "workflow.resume",
        skip(self, session, source),
        fields(upload.session_id = %session.id(), upload.offset = session.next_expected_offset())
    )]
    pub async fn resume<R: Read + Seek>(
        &self,
        message_id: &str,
        session: UploadSession,
        mut source: AttachmentSource<R>,
    ) -> Result<SentMessage, WorkflowError> {
        self.settings
            .validate()
            .map_err(|e| WorkflowError::Configuration(e.to_string()))?;

        self.upload_and_send(message_id.to_string(), session, &mut source)
            .await
    }

    async fn upload_and_send<R: Read + Seek>(
        &self,
        message_id: String,
        mut session: UploadSession,
        source: &mut AttachmentSource<R>,
    ) -> Result<SentMessage, WorkflowError> {
        let mut engine = ResumableUploadEngine::new(&self.uploader, self.settings.clone())
            .with_clock(self.clock.clone())
            .with_cancellation(self.cancel.clone());
        if let Some(callback) = &self.on_progress {
            let callback = callback.clone();
            engine = engine.on_progress(move |p| callback(p));
        }

        match engine.run(&mut session, source).await {
            UploadOutcome::Completed(attachment_id) => {
                self.composer.send_message(&message_id).await?;
                metrics::record_message_sent(true);
                tracing::info!(
                    message_id = %message_id,
                    attachment_id = %attachment_id,
                    "Message with attachment sent"
                );
                Ok(SentMessage {
                    message_id,
                    attachment_id,
                })
            }
            UploadOutcome::Failed(source) => Err(WorkflowError::Upload {
                message_id,
                session: Box::new(session),
                source,
            }),
        }
    }
}

//! Tsubame Mailr Library
//!
//! Send mail with large attachments over Microsoft Graph using resumable,
//! chunked upload sessions.
//!
//! # Features
//!
//! - **Resumable**: Uploads continue from the server's last accepted offset
//! - **Aligned Chunks**: Chunk sizes are multiples of 320 KiB
//! - **Retry With Backoff**: Transient faults re-send the same chunk, honoring `Retry-After`
//! - **Cancellable**: Ctrl-C stops the upload and leaves a checkpoint behind
//!
//! # Example
//!
//! ```no_run
//! use tsubame_mailr::auth::provider_from_config;
//! use tsubame_mailr::graph::{DraftMessage, GraphClient};
//! use tsubame_mailr::upload::{AttachmentSource, HttpChunkUploader};
//! use tsubame_mailr::workflow::AttachmentWorkflow;
//! use tsubame_mailr::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let client = GraphClient::new(&config.graph, provider_from_config(&config.auth))?;
//!     let uploader = HttpChunkUploader::new(Some(config.upload.request_timeout()))?;
//!     let workflow = AttachmentWorkflow::new(client, uploader, config.upload.to_settings());
//!
//!     let draft = DraftMessage::new("Report", "See attached", vec!["a@example.com".into()]);
//!     let sent = workflow
//!         .send_with_attachment(&draft, "report.pdf", AttachmentSource::open("report.pdf")?)
//!         .await?;
//!     println!("sent {}", sent.message_id);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod graph;
pub mod logging;
pub mod metrics;
pub mod upload;
pub mod workflow;

// Re-export commonly used types
pub use config::Config;
pub use graph::GraphClient;
pub use upload::{UploadError, UploadOutcome, UploadSession};
pub use workflow::{AttachmentWorkflow, WorkflowError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

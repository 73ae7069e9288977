//! Tsubame Mailr - Microsoft Graph mail with resumable large attachments

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tsubame_mailr::auth::provider_from_config;
use tsubame_mailr::graph::{DraftMessage, GraphClient};
use tsubame_mailr::upload::{AttachmentSource, HttpChunkUploader, UploadSession};
use tsubame_mailr::workflow::{AttachmentWorkflow, SentMessage, WorkflowError};
use tsubame_mailr::Config;

/// Tsubame Mailr - Send mail with large attachments over Microsoft Graph
#[derive(Parser, Debug)]
#[command(name = "tsubame-mailr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Write Prometheus metrics to this file when the command finishes
    #[arg(long, global = true, value_name = "PATH")]
    metrics_out: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the signed-in user
    Whoami,

    /// List the newest inbox messages
    Inbox {
        #[arg(long, default_value_t = 25)]
        top: u32,
    },

    /// Send a text message without attachments
    Send {
        #[arg(long)]
        to: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
    },

    /// Send a message with a large file attached
    SendLarge {
        #[arg(long)]
        to: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
        /// File to attach
        #[arg(long)]
        file: PathBuf,
        /// Where to write the session if the upload stops early
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Continue an interrupted upload and send its draft
    Resume {
        #[arg(long)]
        message_id: String,
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    tsubame_mailr::logging::init_logging(&config.logging)?;
    info!("Starting Tsubame Mailr v{}", tsubame_mailr::VERSION);

    let result = run(args.command, &config).await;

    if let Some(path) = &args.metrics_out {
        std::fs::write(path, tsubame_mailr::metrics::gather_text())
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
    }

    result
}

async fn run(command: Command, config: &Config) -> anyhow::Result<()> {
    let client = GraphClient::new(&config.graph, provider_from_config(&config.auth))?;

    match command {
        Command::Whoami => {
            let user = client.me().await?;
            println!(
                "{} <{}>",
                user.display_name.as_deref().unwrap_or("(no display name)"),
                user.address().unwrap_or("(no address)")
            );
        }
        Command::Inbox { top } => {
            for message in client.inbox(top).await? {
                let from = message
                    .from
                    .as_ref()
                    .map(|s| s.email_address.address.as_str())
                    .unwrap_or("-");
                let received = message
                    .received_date_time
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "{} {:16} {:32} {}",
                    if message.is_read { " " } else { "*" },
                    received,
                    from,
                    message.subject.as_deref().unwrap_or("")
                );
            }
        }
        Command::Send { to, subject, body } => {
            client.send_mail(&subject, &body, &to).await?;
            println!("Sent.");
        }
        Command::SendLarge {
            to,
            subject,
            body,
            file,
            checkpoint,
        } => {
            let checkpoint = checkpoint.unwrap_or_else(|| default_checkpoint(&file));
            let file_name = file
                .file_name()
                .and_then(|n| n.to_str())
                .context("attachment path has no file name")?
                .to_string();
            let source = AttachmentSource::open(&file)
                .with_context(|| format!("failed to open {}", file.display()))?;

            let cancel = CancellationToken::new();
            let signals = spawn_signal_handler(cancel.clone());
            let workflow = build_workflow(client, config, cancel)?;

            let draft = DraftMessage::new(subject, body, vec![to]);
            let result = workflow
                .send_with_attachment(&draft, &file_name, source)
                .await;
            signals.abort();

            report(result, &checkpoint, &file)?;
        }
        Command::Resume {
            message_id,
            checkpoint,
            file,
        } => {
            let session = UploadSession::load(&checkpoint)
                .with_context(|| format!("failed to read checkpoint {}", checkpoint.display()))?;
            let source = AttachmentSource::open(&file)
                .with_context(|| format!("failed to open {}", file.display()))?;

            let cancel = CancellationToken::new();
            let signals = spawn_signal_handler(cancel.clone());
            let workflow = build_workflow(client, config, cancel)?;

            let result = workflow.resume(&message_id, session, source).await;
            signals.abort();

            if result.is_ok() {
                let _ = std::fs::remove_file(&checkpoint);
            }
            report(result, &checkpoint, &file)?;
        }
    }

    Ok(())
}

fn build_workflow(
    client: GraphClient,
    config: &Config,
    cancel: CancellationToken,
) -> anyhow::Result<AttachmentWorkflow<GraphClient, HttpChunkUploader>> {
    let uploader = HttpChunkUploader::new(Some(config.upload.request_timeout()))?;
    Ok(
        AttachmentWorkflow::new(client, uploader, config.upload.to_settings())
            .with_cancellation(cancel)
            .on_progress(|p| {
                eprint!(
                    "\r  {:>6.1}%  {}/{} bytes",
                    p.percent(),
                    p.bytes_uploaded,
                    p.total_bytes
                );
            }),
    )
}

/// Print the result; on a resumable failure write the session checkpoint
fn report(
    result: Result<SentMessage, WorkflowError>,
    checkpoint: &Path,
    file: &Path,
) -> anyhow::Result<()> {
    eprintln!();
    match result {
        Ok(sent) => {
            println!(
                "Sent message {} with attachment {}",
                sent.message_id, sent.attachment_id
            );
            Ok(())
        }
        Err(err) => {
            if let WorkflowError::Upload {
                message_id,
                session,
                source,
            } = &err
            {
                if source.is_resumable() {
                    session.save(checkpoint).with_context(|| {
                        format!("failed to write checkpoint {}", checkpoint.display())
                    })?;
                    eprintln!(
                        "Upload stopped at byte {} of {}. Continue with:\n  tsubame-mailr resume --message-id '{}' --checkpoint '{}' --file '{}'",
                        session.next_expected_offset(),
                        session.total_size(),
                        message_id,
                        checkpoint.display(),
                        file.display()
                    );
                } else {
                    eprintln!("Draft {} was left in place.", message_id);
                }
            }
            Err(err.into())
        }
    }
}

fn default_checkpoint(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(".upload.json");
    PathBuf::from(name)
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            return tokio::select! {
                result = tokio::signal::ctrl_c() => result,
                _ = sigterm.recv() => Ok(()),
            };
        }
    }
    tokio::signal::ctrl_c().await
}

/// First signal cancels the upload; a second one exits immediately
fn spawn_signal_handler(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if wait_for_signal().await.is_err() {
            return;
        }
        eprintln!("\nCancelling upload... (press Ctrl+C again to force quit)");
        cancel.cancel();

        if wait_for_signal().await.is_ok() {
            eprintln!("\nForce quit.");
            std::process::exit(130);
        }
    })
}

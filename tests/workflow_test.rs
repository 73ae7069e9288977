//! Attachment Workflow Tests
//!
//! End to end: draft, upload session, chunked PUTs and send, all against one
//! mock server standing in for both Graph and the upload endpoint.

#[cfg(test)]
mod tests {
    use serde_json::json;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio_test::{assert_err, assert_ok};
    use tsubame_mailr::auth::StaticToken;
    use tsubame_mailr::config::GraphConfig;
    use tsubame_mailr::graph::{DraftMessage, GraphClient};
    use tsubame_mailr::upload::{
        AttachmentSource, HttpChunkUploader, RetryPolicy, UploadError, UploadSession,
        UploadSettings,
    };
    use tsubame_mailr::workflow::{AttachmentWorkflow, WorkflowError};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SIZE: usize = 700_000;

    fn attachment() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let bytes: Vec<u8> = (0..SIZE).map(|i| (i % 256) as u8).collect();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        file
    }

    fn workflow(server: &MockServer) -> AttachmentWorkflow<GraphClient, HttpChunkUploader> {
        let config = GraphConfig {
            base_url: server.uri(),
            timeout_seconds: 5,
        };
        let client = GraphClient::new(&config, Arc::new(StaticToken::new("test-token"))).unwrap();
        let uploader = HttpChunkUploader::new(Some(Duration::from_secs(5))).unwrap();
        let settings = UploadSettings {
            max_chunk_size: 327_680,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        };
        AttachmentWorkflow::new(client, uploader, settings)
    }

    fn draft() -> DraftMessage {
        DraftMessage::new("Quarterly report", "Attached.", vec!["boss@example.com".into()])
    }

    async fn mount_compose(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/me/messages"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "msg-1"})))
            .expect(1)
            .mount(server)
            .await;

        Mock::given(method("POST"))
            .and(path("/me/messages/msg-1/attachments/createUploadSession"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "uploadUrl": format!("{}/upload/AttachmentSessions('s1')", server.uri()),
                "expirationDateTime": "2099-01-01T00:00:00Z",
                "nextExpectedRanges": ["0-"]
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    async fn mount_chunk(server: &MockServer, range: &str, response: ResponseTemplate) {
        Mock::given(method("PUT"))
            .and(header("Content-Range", range))
            .respond_with(response)
            .expect(1)
            .mount(server)
            .await;
    }

    fn accepted(next: &str) -> ResponseTemplate {
        ResponseTemplate::new(202).set_body_json(json!({
            "expirationDateTime": "2099-01-01T00:00:00Z",
            "nextExpectedRanges": [next]
        }))
    }

    #[tokio::test]
    async fn test_send_with_large_attachment() {
        let mock_server = MockServer::start().await;
        let file = attachment();

        mount_compose(&mock_server).await;
        mount_chunk(&mock_server, "bytes 0-327679/700000", accepted("327680-")).await;
        mount_chunk(&mock_server, "bytes 327680-655359/700000", accepted("655360-")).await;
        mount_chunk(
            &mock_server,
            "bytes 655360-699999/700000",
            ResponseTemplate::new(201).set_body_json(json!({"id": "att-1"})),
        )
        .await;
        Mock::given(method("POST"))
            .and(path("/me/messages/msg-1/send"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&mock_server)
            .await;

        let source = AttachmentSource::open(file.path()).unwrap();
        let sent = assert_ok!(
            workflow(&mock_server)
                .send_with_attachment(&draft(), "report.bin", source)
                .await
        );

        assert_eq!(sent.message_id, "msg-1");
        assert_eq!(sent.attachment_id, "att-1");
    }

    #[tokio::test]
    async fn test_permanent_rejection_leaves_draft_unsent() {
        let mock_server = MockServer::start().await;
        let file = attachment();

        mount_compose(&mock_server).await;
        mount_chunk(&mock_server, "bytes 0-327679/700000", ResponseTemplate::new(404)).await;
        Mock::given(method("POST"))
            .and(path("/me/messages/msg-1/send"))
            .respond_with(ResponseTemplate::new(202))
            .expect(0)
            .mount(&mock_server)
            .await;

        let source = AttachmentSource::open(file.path()).unwrap();
        let err = assert_err!(
            workflow(&mock_server)
                .send_with_attachment(&draft(), "report.bin", source)
                .await
        );

        assert!(!err.is_resumable());
        assert!(matches!(
            err,
            WorkflowError::Upload {
                source: UploadError::Fatal(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_ok_on_first_chunk_never_sends() {
        let mock_server = MockServer::start().await;
        let file = attachment();

        mount_compose(&mock_server).await;
        mount_chunk(&mock_server, "bytes 0-327679/700000", ResponseTemplate::new(200)).await;
        Mock::given(method("POST"))
            .and(path("/me/messages/msg-1/send"))
            .respond_with(ResponseTemplate::new(202))
            .expect(0)
            .mount(&mock_server)
            .await;

        let source = AttachmentSource::open(file.path()).unwrap();
        let err = assert_err!(
            workflow(&mock_server)
                .send_with_attachment(&draft(), "report.bin", source)
                .await
        );

        match err {
            WorkflowError::Upload {
                session, source, ..
            } => {
                assert!(matches!(source, UploadError::Fatal(_)));
                assert_eq!(session.next_expected_offset(), 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_checkpoint_and_resume_after_outage() {
        let mock_server = MockServer::start().await;
        let file = attachment();
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("session.json");

        // First run: one chunk lands, then the service goes away
        mount_compose(&mock_server).await;
        mount_chunk(&mock_server, "bytes 0-327679/700000", accepted("327680-")).await;
        Mock::given(method("PUT"))
            .and(header("Content-Range", "bytes 327680-655359/700000"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&mock_server)
            .await;

        let source = AttachmentSource::open(file.path()).unwrap();
        let err = assert_err!(
            workflow(&mock_server)
                .send_with_attachment(&draft(), "report.bin", source)
                .await
        );
        assert!(err.is_resumable());

        let WorkflowError::Upload {
            message_id,
            session,
            ..
        } = err
        else {
            panic!("expected an upload failure");
        };
        assert_eq!(session.next_expected_offset(), 327_680);
        session.save(&checkpoint).unwrap();

        mock_server.verify().await;
        mock_server.reset().await;

        // Second run: resume from the checkpoint
        mount_chunk(&mock_server, "bytes 327680-655359/700000", accepted("655360-")).await;
        mount_chunk(
            &mock_server,
            "bytes 655360-699999/700000",
            ResponseTemplate::new(201).set_body_json(json!({"id": "att-1"})),
        )
        .await;
        Mock::given(method("POST"))
            .and(path("/me/messages/msg-1/send"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&mock_server)
            .await;

        let session = UploadSession::load(&checkpoint).unwrap();
        let source = AttachmentSource::open(file.path()).unwrap();
        let sent = assert_ok!(workflow(&mock_server).resume(&message_id, session, source).await);

        assert_eq!(sent.attachment_id, "att-1");
    }
}

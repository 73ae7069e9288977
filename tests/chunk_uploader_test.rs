//! HTTP Chunk Uploader Tests
//!
//! Verifies the PUT exchange and response classification against a mock
//! upload endpoint.

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tsubame_mailr::upload::{Chunk, ChunkResult, ChunkUploader, HttpChunkUploader, UploadSession};
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn uploader() -> HttpChunkUploader {
        HttpChunkUploader::new(Some(Duration::from_secs(5))).unwrap()
    }

    fn session(server: &MockServer, total: u64) -> UploadSession {
        UploadSession::new(
            "session-1",
            format!("{}/upload/session-1", server.uri()),
            Utc::now() + ChronoDuration::hours(1),
            total,
        )
    }

    fn first_half() -> (Chunk, Bytes) {
        (
            Chunk {
                offset: 0,
                length: 10,
            },
            Bytes::from_static(b"0123456789"),
        )
    }

    fn second_half() -> (Chunk, Bytes) {
        (
            Chunk {
                offset: 10,
                length: 10,
            },
            Bytes::from_static(b"abcdefghij"),
        )
    }

    #[tokio::test]
    async fn test_accepted_chunk_reports_next_offset() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/upload/session-1"))
            .and(header("Content-Range", "bytes 0-9/20"))
            .and(header("Content-Type", "application/octet-stream"))
            .respond_with(
                ResponseTemplate::new(202).set_body_json(json!({
                    "expirationDateTime": "2030-01-01T00:00:00Z",
                    "nextExpectedRanges": ["10-"]
                })),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let (chunk, data) = first_half();
        let result = uploader()
            .upload(&session(&mock_server, 20), chunk, data)
            .await;

        assert_eq!(result, ChunkResult::Progress(10));
    }

    #[tokio::test]
    async fn test_upload_request_carries_no_bearer_token() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(header_exists("Authorization"))
            .respond_with(ResponseTemplate::new(401))
            .expect(0)
            .mount(&mock_server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"nextExpectedRanges": ["10-"]})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let (chunk, data) = first_half();
        let result = uploader()
            .upload(&session(&mock_server, 20), chunk, data)
            .await;

        assert_eq!(result, ChunkResult::Progress(10));
    }

    #[tokio::test]
    async fn test_accepted_without_ranges_assumes_whole_chunk() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&mock_server)
            .await;

        let (chunk, data) = first_half();
        let result = uploader()
            .upload(&session(&mock_server, 20), chunk, data)
            .await;

        assert_eq!(result, ChunkResult::Progress(10));
    }

    #[tokio::test]
    async fn test_final_chunk_completes_with_body_id() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(header("Content-Range", "bytes 10-19/20"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "attachment-1"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let (chunk, data) = second_half();
        let result = uploader()
            .upload(&session(&mock_server, 20), chunk, data)
            .await;

        assert_eq!(result, ChunkResult::Completed("attachment-1".into()));
    }

    #[tokio::test]
    async fn test_final_chunk_completes_with_location_id() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201).insert_header(
                "Location",
                "https://outlook.office.com/api/v2.0/Users('u')/Messages('m')/Attachments('AAMkADI5=')",
            ))
            .mount(&mock_server)
            .await;

        let (chunk, data) = second_half();
        let result = uploader()
            .upload(&session(&mock_server, 20), chunk, data)
            .await;

        assert_eq!(result, ChunkResult::Completed("AAMkADI5=".into()));
    }

    #[tokio::test]
    async fn test_final_chunk_without_id_falls_back_to_session() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(header("Content-Range", "bytes 10-19/20"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let (chunk, data) = second_half();
        let session = session(&mock_server, 20);
        assert_eq!(chunk.end(), session.total_size());

        let result = uploader().upload(&session, chunk, data).await;

        assert_eq!(result, ChunkResult::Completed("session-1".into()));
    }

    #[tokio::test]
    async fn test_intermediate_chunk_without_completion_data_is_fatal() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(header("Content-Range", "bytes 0-9/20"))
            .respond_with(ResponseTemplate::new(200).insert_header(
                "Location",
                "https://outlook.office.com/api/v2.0/Users('u')/Messages('m')/Attachments('AAMkADI5=')",
            ))
            .expect(1)
            .mount(&mock_server)
            .await;

        let (chunk, data) = first_half();
        let result = uploader()
            .upload(&session(&mock_server, 20), chunk, data)
            .await;

        assert!(matches!(result, ChunkResult::Fatal(ref m) if m.contains("no completion data")));
    }

    #[tokio::test]
    async fn test_intermediate_chunk_with_body_id_completes() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "attachment-1"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let (chunk, data) = first_half();
        let result = uploader()
            .upload(&session(&mock_server, 20), chunk, data)
            .await;

        assert_eq!(result, ChunkResult::Completed("attachment-1".into()));
    }

    #[tokio::test]
    async fn test_truncated_response_body_is_retryable() {
        const TOTAL: u64 = 1_000_000;
        const LENGTH: u32 = 327_680;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Reads the whole request, promises 60 body bytes, sends 10 and hangs up
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                if let Some(end) = received.windows(4).position(|w| w == b"\r\n\r\n") {
                    if received.len() >= end + 4 + LENGTH as usize {
                        break;
                    }
                }
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 60\r\n\r\n{\"id\": \"ab")
                .await
                .unwrap();
            socket.flush().await.unwrap();
            String::from_utf8_lossy(&received).into_owned()
        });

        let session = UploadSession::new(
            "session-1",
            format!("http://{}/upload/session-1", addr),
            Utc::now() + ChronoDuration::hours(1),
            TOTAL,
        );
        let chunk = Chunk {
            offset: 0,
            length: LENGTH,
        };
        let data = Bytes::from(vec![7u8; LENGTH as usize]);

        let result = uploader().upload(&session, chunk, data).await;
        let request = server.await.unwrap();

        assert!(request.starts_with("PUT /upload/session-1"));
        assert!(request.to_ascii_lowercase().contains("content-range: bytes 0-327679/1000000"));
        assert!(
            matches!(result, ChunkResult::Retryable { .. }),
            "unexpected result: {result:?}"
        );
    }

    #[tokio::test]
    async fn test_empty_attachment_uses_star_range() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(header("Content-Range", "bytes */0"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "empty"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = uploader()
            .upload(
                &session(&mock_server, 0),
                Chunk {
                    offset: 0,
                    length: 0,
                },
                Bytes::new(),
            )
            .await;

        assert_eq!(result, ChunkResult::Completed("empty".into()));
    }

    #[tokio::test]
    async fn test_throttled_is_retryable_with_retry_after() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
            .mount(&mock_server)
            .await;

        let (chunk, data) = first_half();
        let result = uploader()
            .upload(&session(&mock_server, 20), chunk, data)
            .await;

        assert_eq!(
            result,
            ChunkResult::Retryable {
                reason: "HTTP 429".into(),
                retry_after: Some(Duration::from_secs(3)),
            }
        );
    }

    #[tokio::test]
    async fn test_server_errors_are_retryable() {
        for status in [500u16, 502, 503, 504] {
            let mock_server = MockServer::start().await;
            Mock::given(method("PUT"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&mock_server)
                .await;

            let (chunk, data) = first_half();
            let result = uploader()
                .upload(&session(&mock_server, 20), chunk, data)
                .await;

            assert!(
                matches!(result, ChunkResult::Retryable { .. }),
                "status {status}: {result:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_missing_session_is_fatal() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let (chunk, data) = first_half();
        let result = uploader()
            .upload(&session(&mock_server, 20), chunk, data)
            .await;

        assert!(matches!(result, ChunkResult::Fatal(_)));
    }

    #[tokio::test]
    async fn test_rejected_range_is_fatal_with_graph_message() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(416).set_body_json(json!({
                "error": {"code": "InvalidRange", "message": "The requested range is invalid"}
            })))
            .mount(&mock_server)
            .await;

        let (chunk, data) = first_half();
        let result = uploader()
            .upload(&session(&mock_server, 20), chunk, data)
            .await;

        match result {
            ChunkResult::Fatal(reason) => {
                assert!(reason.contains("416"));
                assert!(reason.contains("The requested range is invalid"));
            }
            other => panic!("expected fatal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_fatal() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(202).set_body_string("{not json"))
            .mount(&mock_server)
            .await;

        let (chunk, data) = first_half();
        let result = uploader()
            .upload(&session(&mock_server, 20), chunk, data)
            .await;

        assert!(matches!(result, ChunkResult::Fatal(_)));
    }

    #[tokio::test]
    async fn test_length_mismatch_is_fatal_without_request() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(202))
            .expect(0)
            .mount(&mock_server)
            .await;

        let result = uploader()
            .upload(
                &session(&mock_server, 20),
                Chunk {
                    offset: 0,
                    length: 10,
                },
                Bytes::from_static(b"short"),
            )
            .await;

        assert!(matches!(result, ChunkResult::Fatal(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let session = UploadSession::new(
            "session-1",
            "http://127.0.0.1:1/upload/session-1",
            Utc::now() + ChronoDuration::hours(1),
            20,
        );

        let (chunk, data) = first_half();
        let result = uploader().upload(&session, chunk, data).await;

        assert!(matches!(result, ChunkResult::Retryable { .. }));
    }
}

//! Collector upload client.
//!
//! Posts one spooled reading at a time to the collector's `/stats`
//! endpoint as a multipart form. Success is strictly HTTP 201; anything
//! else, 2xx included, is a failure carrying the status and response body
//! for diagnostics. Retry is not this module's job: a failed entry simply
//! stays on disk for the next sweep.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use thiserror::Error;

/// Default bound on one upload request.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Header carrying the shared secret.
const PASSWORD_HEADER: &str = "Server-Password";

/// Errors from a single upload attempt.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Connection failure, timeout, or other transport-level error.
    #[error("collector request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Collector answered with something other than 201.
    #[error("collector returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// HTTP client for the collector.
pub struct Uploader {
    client: Client,
    endpoint: String,
    password: String,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Uploader {
    /// Build an uploader for `http://{host}:{port}/stats` with a bounded
    /// per-request timeout.
    ///
    /// # Errors
    /// Returns `UploadError::Transport` if the HTTP client cannot be built.
    pub fn new(
        host: impl AsRef<str>,
        port: u16,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, UploadError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("http://{}:{}/stats", host.as_ref(), port),
            password: password.into(),
        })
    }

    /// Upload one spooled reading.
    ///
    /// The body is a multipart form with the file content under `file`
    /// (filename = entry name) and the entry name under `name`. The caller
    /// removes the spool file on `Ok` and must leave it in place on `Err`.
    pub async fn upload(&self, name: &str, content: Vec<u8>) -> Result<(), UploadError> {
        let form = Form::new()
            .part("file", Part::bytes(content).file_name(name.to_string()))
            .text("name", name.to_string());

        let response = self
            .client
            .post(&self.endpoint)
            .header(PASSWORD_HEADER, &self.password)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::extract::{Multipart, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use tokio::net::TcpListener;

    #[derive(Debug, Clone, Default)]
    struct Received {
        password: Option<String>,
        file_name: Option<String>,
        file_bytes: Vec<u8>,
        name_field: Option<String>,
    }

    #[derive(Clone)]
    struct CollectorState {
        uploads: Arc<Mutex<Vec<Received>>>,
        respond: StatusCode,
    }

    async fn stats_handler(
        State(state): State<CollectorState>,
        headers: HeaderMap,
        mut multipart: Multipart,
    ) -> (StatusCode, String) {
        let mut received = Received {
            password: headers
                .get("Server-Password")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            ..Default::default()
        };

        while let Some(field) = multipart.next_field().await.unwrap() {
            match field.name() {
                Some("file") => {
                    received.file_name = field.file_name().map(str::to_string);
                    received.file_bytes = field.bytes().await.unwrap().to_vec();
                }
                Some("name") => {
                    received.name_field = Some(field.text().await.unwrap());
                }
                _ => {}
            }
        }

        let respond = state.respond;
        state.uploads.lock().unwrap().push(received);
        if respond == StatusCode::CREATED {
            (respond, String::new())
        } else {
            (respond, "spool rejected".to_string())
        }
    }

    /// Spin up a collector double on a random port.
    async fn mock_collector(
        respond: StatusCode,
    ) -> Option<(std::net::SocketAddr, Arc<Mutex<Vec<Received>>>)> {
        let uploads = Arc::new(Mutex::new(Vec::new()));
        let state = CollectorState {
            uploads: Arc::clone(&uploads),
            respond,
        };
        let router = Router::new()
            .route("/stats", post(stats_handler))
            .with_state(state);

        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(l) => l,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => return None,
            Err(e) => panic!("Failed to bind test listener: {e}"),
        };
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Some((addr, uploads))
    }

    #[tokio::test]
    async fn test_upload_success_on_201() {
        let Some((addr, uploads)) = mock_collector(StatusCode::CREATED).await else {
            return;
        };
        let uploader = Uploader::new(
            addr.ip().to_string(),
            addr.port(),
            "s3cret",
            Duration::from_secs(5),
        )
        .unwrap();

        uploader
            .upload("rig1_1000", b"{\"when\":1000}".to_vec())
            .await
            .unwrap();

        let uploads = uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].password.as_deref(), Some("s3cret"));
        assert_eq!(uploads[0].file_name.as_deref(), Some("rig1_1000"));
        assert_eq!(uploads[0].file_bytes, b"{\"when\":1000}");
        assert_eq!(uploads[0].name_field.as_deref(), Some("rig1_1000"));
    }

    #[tokio::test]
    async fn test_upload_rejects_non_201() {
        // 200 OK is still a failure; only 201 confirms durable storage.
        let Some((addr, _uploads)) = mock_collector(StatusCode::OK).await else {
            return;
        };
        let uploader = Uploader::new(
            addr.ip().to_string(),
            addr.port(),
            "s3cret",
            Duration::from_secs(5),
        )
        .unwrap();

        let err = uploader.upload("rig1_1000", Vec::new()).await.unwrap_err();
        match err {
            UploadError::Status { status, .. } => assert_eq!(status, 200),
            other => panic!("expected Status error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_upload_surfaces_error_body() {
        let Some((addr, _uploads)) = mock_collector(StatusCode::INTERNAL_SERVER_ERROR).await
        else {
            return;
        };
        let uploader = Uploader::new(
            addr.ip().to_string(),
            addr.port(),
            "s3cret",
            Duration::from_secs(5),
        )
        .unwrap();

        let err = uploader.upload("rig1_1000", Vec::new()).await.unwrap_err();
        match err {
            UploadError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "spool rejected");
            }
            other => panic!("expected Status error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_upload_transport_failure() {
        // Port very likely unused.
        let uploader =
            Uploader::new("127.0.0.1", 59997, "s3cret", Duration::from_millis(500)).unwrap();
        let err = uploader.upload("rig1_1000", Vec::new()).await.unwrap_err();
        assert!(matches!(err, UploadError::Transport(_)));
    }
}

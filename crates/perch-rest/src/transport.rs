//! HTTP transport seam
//!
//! The bucket executes requests through [`HttpTransport`] so the outbound
//! agent can be swapped; [`ReqwestTransport`] is the default.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use thiserror::Error;

/// A file attached to a multipart request.
#[derive(Debug, Clone)]
pub struct AttachedFile {
    /// File name reported to the server.
    pub name: String,
    /// Raw content.
    pub content: Vec<u8>,
    /// Form field key; defaults to `files[n]` when absent.
    pub key: Option<String>,
}

impl AttachedFile {
    pub fn new(name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content,
            key: None,
        }
    }
}

/// Body of an outbound request.
#[derive(Debug, Clone)]
pub enum RequestBody {
    None,
    /// JSON bytes, sent with `Content-Type: application/json`.
    Json(Vec<u8>),
    /// Multipart form; the JSON payload travels as a `payload_json` field
    /// rather than a raw body.
    Multipart {
        files: Vec<AttachedFile>,
        payload_json: Option<Vec<u8>>,
    },
}

/// A fully resolved outbound request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

/// What came back from the wire.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Low-level failure before any HTTP status was produced.
#[derive(Debug, Error)]
pub enum TransportFailure {
    /// The configured timeout elapsed or the request was aborted.
    #[error("request timed out")]
    TimedOut,
    #[error("connection error: {0}")]
    Connection(String),
}

/// Executes one HTTP exchange. Implementations must be safe to call
/// concurrently from independent buckets.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(
        &self,
        request: TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportFailure>;
}

/// Default transport backed by a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Build a client with the given per-request timeout.
    pub fn new(timeout: std::time::Duration) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::RestError::Config(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an already configured client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        request: TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportFailure> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);

        builder = match request.body {
            RequestBody::None => builder,
            RequestBody::Json(bytes) => builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(bytes),
            RequestBody::Multipart {
                files,
                payload_json,
            } => {
                let mut form = reqwest::multipart::Form::new();
                for (index, file) in files.into_iter().enumerate() {
                    let key = file
                        .key
                        .clone()
                        .unwrap_or_else(|| format!("files[{}]", index));
                    let part =
                        reqwest::multipart::Part::bytes(file.content).file_name(file.name);
                    form = form.part(key, part);
                }
                if let Some(payload) = payload_json {
                    let part = reqwest::multipart::Part::bytes(payload)
                        .mime_str("application/json")
                        .map_err(|e| TransportFailure::Connection(e.to_string()))?;
                    form = form.part("payload_json", part);
                }
                builder.multipart(form)
            }
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportFailure::TimedOut
            } else {
                TransportFailure::Connection(e.to_string())
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportFailure::Connection(e.to_string()))?
            .to_vec();

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

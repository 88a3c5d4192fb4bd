//! HTTP implementations of the remote seams.
//!
//! The actual HTTP client is abstracted via [`HttpClient`] so that the REST
//! mapping in [`HttpRemote`] and the stream opening in [`HttpEventSource`]
//! can be tested without a network. [`ReqwestClient`] is the production
//! client.

use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::remote::{HttpMethod, RemoteAck, RemoteRequest, RemoteService};
use crate::stream::{ByteStream, EventSource};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::time::Duration;
use tracing::debug;

/// Longest response body quoted in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Status and body of one HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to plug in another HTTP library.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends one request with an optional JSON body.
    async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        bearer: Option<&str>,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse, RemoteError>;

    /// Opens a long-lived streaming GET.
    async fn open_stream(&self, url: &str, bearer: Option<&str>) -> SyncResult<ByteStream>;
}

/// [`RemoteService`] over REST.
#[derive(Debug, Clone)]
pub struct HttpRemote<C: HttpClient> {
    base_url: String,
    credentials: Option<String>,
    client: C,
}

impl<C: HttpClient> HttpRemote<C> {
    /// Creates a remote for the given API base URL.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into(),
            credentials: None,
            client,
        }
    }

    /// Creates a remote from the API URL and credentials of `config`.
    pub fn from_config(config: &SyncConfig, client: C) -> Self {
        Self {
            base_url: config.api_base_url.clone(),
            credentials: config.credentials.clone(),
            client,
        }
    }

    /// Sets the bearer token.
    pub fn with_credentials(mut self, token: impl Into<String>) -> Self {
        self.credentials = Some(token.into());
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl<C: HttpClient> RemoteService for HttpRemote<C> {
    async fn send(&self, request: RemoteRequest) -> Result<RemoteAck, RemoteError> {
        let body = request
            .body
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| RemoteError::InvalidRequest(e.to_string()))?;
        let url = self.url(&request.path);
        debug!(route = %request.route(), "sending request");

        let response = self
            .client
            .request(request.method, &url, self.credentials.as_deref(), body)
            .await?;
        if !response.is_success() {
            return Err(RemoteError::from_status(
                response.status,
                error_message(&response.body),
            ));
        }
        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(RemoteAck::default());
        }
        serde_json::from_slice(&response.body)
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }
}

fn error_message(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.char_indices().nth(MAX_ERROR_BODY) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

/// [`EventSource`] over a streaming HTTP GET with bearer credentials.
#[derive(Debug, Clone)]
pub struct HttpEventSource<C: HttpClient> {
    url: Option<String>,
    credentials: Option<String>,
    client: C,
}

impl<C: HttpClient> HttpEventSource<C> {
    /// Creates a source. It is configured only if both parts are present.
    pub fn new(url: Option<String>, credentials: Option<String>, client: C) -> Self {
        Self {
            url,
            credentials,
            client,
        }
    }

    /// Creates a source from the stream URL and credentials of `config`.
    pub fn from_config(config: &SyncConfig, client: C) -> Self {
        Self::new(config.stream_url.clone(), config.credentials.clone(), client)
    }
}

#[async_trait]
impl<C: HttpClient> EventSource for HttpEventSource<C> {
    fn is_configured(&self) -> bool {
        self.url.is_some() && self.credentials.is_some()
    }

    async fn open(&self) -> SyncResult<ByteStream> {
        let (Some(url), Some(token)) = (&self.url, &self.credentials) else {
            return Err(SyncError::NotConfigured(
                "stream URL and credentials are required".into(),
            ));
        };
        self.client.open_stream(url, Some(token.as_str())).await
    }
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestClient {
    /// Creates a client whose requests time out after `timeout`.
    ///
    /// Streams are not subject to the timeout.
    pub fn new(timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::transport_fatal(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    /// Creates a client using the request timeout of `config`.
    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        Self::new(config.request_timeout)
    }
}

fn reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

fn classify(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else if err.is_builder() {
        RemoteError::InvalidRequest(err.to_string())
    } else {
        RemoteError::Network(err.to_string())
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        bearer: Option<&str>,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse, RemoteError> {
        let mut builder = self
            .client
            .request(reqwest_method(method), url)
            .timeout(self.timeout)
            .header(ACCEPT, "application/json");
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(classify)?;
        Ok(HttpResponse::new(status, body.to_vec()))
    }

    async fn open_stream(&self, url: &str, bearer: Option<&str>) -> SyncResult<ByteStream> {
        let mut builder = self
            .client
            .get(url)
            .header(ACCEPT, "application/x-ndjson");
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| SyncError::transport_retryable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::transport_retryable(format!(
                "stream endpoint answered {status}"
            )));
        }
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| SyncError::transport_retryable(e.to_string())))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use parking_lot::Mutex;
    use serde_json::json;
    use shelfsync_protocol::EntityId;

    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        method: HttpMethod,
        url: String,
        bearer: Option<String>,
        body: Option<serde_json::Value>,
    }

    #[derive(Default)]
    struct TestClient {
        response: Mutex<Option<Result<HttpResponse, RemoteError>>>,
        calls: Mutex<Vec<Call>>,
    }

    impl TestClient {
        fn answering(response: Result<HttpResponse, RemoteError>) -> Self {
            Self {
                response: Mutex::new(Some(response)),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpClient for TestClient {
        async fn request(
            &self,
            method: HttpMethod,
            url: &str,
            bearer: Option<&str>,
            body: Option<Vec<u8>>,
        ) -> Result<HttpResponse, RemoteError> {
            self.calls.lock().push(Call {
                method,
                url: url.to_string(),
                bearer: bearer.map(str::to_string),
                body: body.map(|b| serde_json::from_slice(&b).unwrap()),
            });
            self.response
                .lock()
                .clone()
                .unwrap_or_else(|| Ok(HttpResponse::new(204, Vec::new())))
        }

        async fn open_stream(&self, url: &str, bearer: Option<&str>) -> SyncResult<ByteStream> {
            self.calls.lock().push(Call {
                method: HttpMethod::Get,
                url: url.to_string(),
                bearer: bearer.map(str::to_string),
                body: None,
            });
            Ok(stream::iter([Ok(Bytes::from_static(b"{\"type\":\"heartbeat\"}\n"))]).boxed())
        }
    }

    fn patch() -> RemoteRequest {
        RemoteRequest::new(
            HttpMethod::Patch,
            "/books/b1",
            Some(json!({ "fields": { "title": "B" } })),
        )
    }

    #[tokio::test]
    async fn sends_json_with_bearer() {
        let client = TestClient::answering(Ok(HttpResponse::new(
            200,
            br#"{"version": 7, "id": "b1"}"#.to_vec(),
        )));
        let remote = HttpRemote::new("https://api.example.com/v1/", client).with_credentials("tok");

        let ack = remote.send(patch()).await.unwrap();
        assert_eq!(ack.version, Some(7));
        assert_eq!(ack.id, Some(EntityId::new("b1")));

        let calls = remote.client().calls.lock().clone();
        assert_eq!(
            calls,
            vec![Call {
                method: HttpMethod::Patch,
                url: "https://api.example.com/v1/books/b1".into(),
                bearer: Some("tok".into()),
                body: Some(json!({ "fields": { "title": "B" } })),
            }]
        );
    }

    #[tokio::test]
    async fn empty_body_is_a_default_ack() {
        let remote = HttpRemote::new("https://api.example.com", TestClient::default());
        assert_eq!(remote.send(patch()).await.unwrap(), RemoteAck::default());
    }

    #[tokio::test]
    async fn statuses_are_classified() {
        let remote = HttpRemote::new(
            "https://api.example.com",
            TestClient::answering(Ok(HttpResponse::new(503, b"maintenance".to_vec()))),
        );
        let err = remote.send(patch()).await.unwrap_err();
        assert_eq!(err, RemoteError::from_status(503, "maintenance"));
        assert!(err.is_retryable());

        let remote = HttpRemote::new(
            "https://api.example.com",
            TestClient::answering(Ok(HttpResponse::new(422, b"title too long".to_vec()))),
        );
        let err = remote.send(patch()).await.unwrap_err();
        assert!(!err.is_retryable());

        let remote = HttpRemote::new(
            "https://api.example.com",
            TestClient::answering(Ok(HttpResponse::new(200, b"<html>".to_vec()))),
        );
        assert!(matches!(
            remote.send(patch()).await,
            Err(RemoteError::InvalidResponse(_))
        ));
    }

    #[test]
    fn long_error_bodies_are_cut() {
        let body = "x".repeat(MAX_ERROR_BODY * 2);
        let message = error_message(body.as_bytes());
        assert_eq!(message.chars().count(), MAX_ERROR_BODY + 1);
    }

    #[tokio::test]
    async fn event_source_requires_url_and_credentials() {
        let config = SyncConfig::new("https://api.example.com")
            .with_stream_url("https://api.example.com/events");
        let source = HttpEventSource::from_config(&config, TestClient::default());
        assert!(!source.is_configured());
        assert!(matches!(
            source.open().await,
            Err(SyncError::NotConfigured(_))
        ));

        let source =
            HttpEventSource::from_config(&config.with_credentials("tok"), TestClient::default());
        assert!(source.is_configured());
        let mut stream = source.open().await.unwrap();
        assert!(stream.next().await.unwrap().is_ok());
    }
}

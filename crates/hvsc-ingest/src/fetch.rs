//! HTTP fetch primitive
//!
//! The pipeline only needs three operations from the network: a HEAD
//! request for the content length, a streaming GET for archives and a text
//! GET for the release index. [`HttpFetch`] abstracts them so tests can
//! script responses chunk by chunk.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client, ClientBuilder};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::config::IngestConfig;
use crate::error::{IngestError, Result};

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Successful streaming response.
pub struct FetchResponse {
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait HttpFetch: Send + Sync {
    /// Declared content length, `None` when the server does not say.
    async fn head(&self, url: &str) -> Result<Option<u64>>;

    /// Start a GET and stream the body. Non-success statuses are errors.
    async fn get_stream(&self, url: &str) -> Result<FetchResponse>;

    async fn get_text(&self, url: &str) -> Result<String>;
}

/// [`HttpFetch`] over a shared `reqwest` client.
#[derive(Clone)]
pub struct ReqwestFetch {
    client: Client,
}

impl ReqwestFetch {
    pub fn new(config: &IngestConfig) -> Result<Self> {
        let client = ClientBuilder::new()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| IngestError::config(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl fmt::Debug for ReqwestFetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestFetch").finish_non_exhaustive()
    }
}

fn check_status(url: &str, response: &reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(IngestError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetch {
    async fn head(&self, url: &str) -> Result<Option<u64>> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| IngestError::network(url, e))?;
        check_status(url, &response)?;

        // `content_length()` reports the (empty) body for HEAD, so read the header
        let content_length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        debug!(url, ?content_length, "HEAD");
        Ok(content_length)
    }

    async fn get_stream(&self, url: &str) -> Result<FetchResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| IngestError::network(url, e))?;
        check_status(url, &response)?;

        let content_length = response.content_length();
        let owned_url = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| IngestError::network(owned_url.clone(), e)))
            .boxed();

        Ok(FetchResponse {
            content_length,
            body,
        })
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| IngestError::network(url, e))?;
        check_status(url, &response)?;
        response
            .text()
            .await
            .map_err(|e| IngestError::network(url, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetch() -> ReqwestFetch {
        let _ = rustls::crypto::ring::default_provider().install_default();
        ReqwestFetch::new(&IngestConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_head_reads_content_length_header() {
        let mock_server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/HVSC/HVSC_Update_81.7z"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 1234]))
            .mount(&mock_server)
            .await;

        let url = format!("{}/HVSC/HVSC_Update_81.7z", mock_server.uri());
        assert_eq!(fetch().head(&url).await.unwrap(), Some(1234));
    }

    #[tokio::test]
    async fn test_get_stream_collects_body() {
        let mock_server = MockServer::start().await;
        let body = vec![b'x'; 4096];
        Mock::given(method("GET"))
            .and(path("/a.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&mock_server)
            .await;

        let response = fetch()
            .get_stream(&format!("{}/a.zip", mock_server.uri()))
            .await
            .unwrap();
        assert_eq!(response.content_length, Some(4096));

        let mut collected = Vec::new();
        let mut stream = response.body;
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, body);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.7z"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let err = fetch()
            .get_stream(&format!("{}/missing.7z", mock_server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_connection_failure_is_network_error() {
        let err = fetch()
            .get_text("http://127.0.0.1:1/index.html")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Network { .. }));
    }
}

//! Retrying HTTP transport built on reqwest.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use tracing::{debug, warn};

use super::{EsRequest, EsResponse, Transport};
use crate::errors::TransportError;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(20);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// reqwest-backed transport that retries connection failures and 5xx responses.
///
/// Requests whose path appears in the no-retry list are attempted exactly once.
pub struct RetryTransport {
    client: Client,
    max_retries: u32,
    backoff: Duration,
    paths_with_no_retries: RwLock<Vec<String>>,
}

impl RetryTransport {
    /// Create a transport with the default timeout and backoff.
    pub fn new(max_retries: u32) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::network(e.to_string()))?;
        Ok(Self::with_client(client, max_retries))
    }

    /// Wrap an existing reqwest client.
    pub fn with_client(client: Client, max_retries: u32) -> Self {
        Self {
            client,
            max_retries,
            backoff: DEFAULT_BACKOFF,
            paths_with_no_retries: RwLock::new(Vec::new()),
        }
    }

    /// Set the delay before the first retry; it doubles on every subsequent attempt.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Retries after the first attempt for paths not in the no-retry list.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Paths that are attempted exactly once.
    pub fn paths_with_no_retries(&self) -> Vec<String> {
        self.paths_with_no_retries.read().clone()
    }

    /// Replace the no-retry list.
    pub fn set_paths_with_no_retries(&self, paths: Vec<String>) {
        *self.paths_with_no_retries.write() = paths;
    }

    fn retries_for(&self, path: &str) -> u32 {
        if self.paths_with_no_retries.read().iter().any(|p| p == path) {
            0
        } else {
            self.max_retries
        }
    }

    async fn attempt(&self, request: &EsRequest) -> Result<EsResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.as_str())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::network(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::network(e.to_string()))?;

        Ok(EsResponse::new(status, body.to_vec()))
    }
}

impl Default for RetryTransport {
    fn default() -> Self {
        Self::with_client(Client::new(), DEFAULT_MAX_RETRIES)
    }
}

#[async_trait]
impl Transport for RetryTransport {
    async fn execute(&self, request: EsRequest) -> Result<EsResponse, TransportError> {
        let retries = self.retries_for(request.url.path());
        let mut delay = self.backoff;
        let mut attempt = 0;

        loop {
            let result = self.attempt(&request).await;
            let retryable = match &result {
                Ok(response) => response.status >= 500,
                Err(TransportError::Network(_)) => true,
                Err(_) => false,
            };

            if !retryable || attempt >= retries {
                return result;
            }

            attempt += 1;
            warn!(
                url = %request.url,
                method = %request.method,
                attempt,
                max_retries = retries,
                "request failed, retrying"
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
            debug!(url = %request.url, "retrying request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn get(server: &MockServer, p: &str) -> EsRequest {
        let url = Url::parse(&server.uri()).unwrap().join(p).unwrap();
        EsRequest::new(Method::GET, url)
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/docs"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let transport = RetryTransport::with_client(Client::new(), 2)
            .with_backoff(Duration::from_millis(1));
        let response = transport.execute(get(&server, "/docs")).await.unwrap();

        assert_eq!(response.status, 503);
    }

    #[tokio::test]
    async fn test_no_retry_paths_are_attempted_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_cluster/health"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let transport = RetryTransport::with_client(Client::new(), 5)
            .with_backoff(Duration::from_millis(1));
        transport.set_paths_with_no_retries(vec!["/_cluster/health".to_string()]);

        let response = transport
            .execute(get(&server, "/_cluster/health"))
            .await
            .unwrap();
        assert_eq!(response.status, 500);
    }

    #[tokio::test]
    async fn test_success_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = RetryTransport::with_client(Client::new(), 3);
        let response = transport.execute(get(&server, "/ok")).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"{\"ok\":true}".to_vec());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let transport = RetryTransport::with_client(Client::new(), 0);
        let request = EsRequest::new(
            Method::GET,
            Url::parse("http://127.0.0.1:1/_cluster/health").unwrap(),
        );

        let err = transport.execute(request).await.unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));
    }
}

//! HTTP transport abstraction.
//!
//! Everything that talks to the cluster over raw HTTP (the health checker and the
//! legacy client) goes through a [`Transport`]. Retrying, signing and the choice of
//! HTTP stack are properties of the transport, never of its callers.

mod retry;

pub use retry::RetryTransport;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use url::Url;

use crate::errors::TransportError;
use crate::signer::RequestSigner;

/// An HTTP request addressed to the cluster.
#[derive(Debug, Clone)]
pub struct EsRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl EsRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Attach a JSON payload and the matching content type.
    pub fn with_json_body(mut self, body: Vec<u8>) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(body);
        self
    }

    /// Attach a newline-delimited JSON payload (bulk, msearch).
    pub fn with_ndjson_body(mut self, body: Vec<u8>) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"));
        self.body = Some(body);
        self
    }
}

/// A fully read HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl EsResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends requests to the cluster.
///
/// Implementations must be safe to share between tasks; the health checker holds
/// its transport behind an `Arc` and may be called concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: EsRequest) -> Result<EsResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn execute(&self, request: EsRequest) -> Result<EsResponse, TransportError> {
        (**self).execute(request).await
    }
}

/// Signs every request before handing it to the inner transport.
pub struct SignedTransport<T> {
    inner: T,
    signer: Arc<dyn RequestSigner>,
}

impl<T: Transport> SignedTransport<T> {
    pub fn new(inner: T, signer: Arc<dyn RequestSigner>) -> Self {
        Self { inner, signer }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for SignedTransport<T> {
    async fn execute(&self, mut request: EsRequest) -> Result<EsResponse, TransportError> {
        self.signer
            .sign(&mut request)
            .await
            .map_err(|e| TransportError::Signing(e.to_string()))?;
        self.inner.execute(request).await
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Recording transport used by tests across the crate.

    use super::*;
    use parking_lot::Mutex;

    type Handler = dyn Fn(&EsRequest) -> Result<EsResponse, TransportError> + Send + Sync;

    pub struct MockTransport {
        handler: Box<Handler>,
        calls: Mutex<Vec<EsRequest>>,
    }

    impl MockTransport {
        pub fn new<F>(handler: F) -> Self
        where
            F: Fn(&EsRequest) -> Result<EsResponse, TransportError> + Send + Sync + 'static,
        {
            Self {
                handler: Box::new(handler),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<EsRequest> {
            self.calls.lock().clone()
        }

        pub fn paths(&self) -> Vec<String> {
            self.calls
                .lock()
                .iter()
                .map(|r| r.url.path().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn execute(&self, request: EsRequest) -> Result<EsResponse, TransportError> {
            let result = (self.handler)(&request);
            self.calls.lock().push(request);
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;
    use crate::signer::{NoopSigner, SignError};

    struct HeaderSigner;

    #[async_trait]
    impl RequestSigner for HeaderSigner {
        async fn sign(&self, request: &mut EsRequest) -> Result<(), SignError> {
            request
                .headers
                .insert("authorization", HeaderValue::from_static("signed"));
            Ok(())
        }
    }

    struct FailingSigner;

    #[async_trait]
    impl RequestSigner for FailingSigner {
        async fn sign(&self, _request: &mut EsRequest) -> Result<(), SignError> {
            Err(SignError::MissingRegion)
        }
    }

    fn request() -> EsRequest {
        EsRequest::new(
            Method::GET,
            Url::parse("http://localhost:9200/_cluster/health").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_signed_transport_adds_headers() {
        let transport = SignedTransport::new(
            MockTransport::new(|_| Ok(EsResponse::new(200, "{}"))),
            Arc::new(HeaderSigner),
        );

        let response = transport.execute(request()).await.unwrap();
        assert_eq!(response.status, 200);

        let calls = transport.inner().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].headers.get("authorization").unwrap(), "signed");
    }

    #[tokio::test]
    async fn test_signing_failure_skips_request() {
        let transport = SignedTransport::new(
            MockTransport::new(|_| Ok(EsResponse::new(200, "{}"))),
            Arc::new(FailingSigner),
        );

        let err = transport.execute(request()).await.unwrap_err();
        assert!(matches!(err, TransportError::Signing(_)));
        assert!(transport.inner().calls().is_empty());
    }

    #[tokio::test]
    async fn test_noop_signer_leaves_request_untouched() {
        let transport = SignedTransport::new(
            MockTransport::new(|_| Ok(EsResponse::new(200, "{}"))),
            Arc::new(NoopSigner),
        );

        transport.execute(request()).await.unwrap();
        assert!(transport.inner().calls()[0].headers.is_empty());
    }

    #[test]
    fn test_json_body_sets_content_type() {
        let req = request().with_json_body(b"{}".to_vec());
        assert_eq!(req.headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(req.body.as_deref(), Some(&b"{}"[..]));
    }
}

//! Error types for client operations and the HTTP transport.

use thiserror::Error;

/// Errors raised while sending a request to the cluster.
///
/// The display text of a transport error is what the health checker reports as
/// its message when the cluster cannot be reached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection failed or timed out.
    #[error("{0}")]
    Network(String),

    /// The request could not be signed.
    #[error("failed to sign request: {0}")]
    Signing(String),

    /// The request could not be built (bad header, bad url, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}

/// Errors returned by [`SearchClient`](crate::client::SearchClient) operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to specify valid elasticsearch url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The backend answered outside the expected status range.
    #[error("unexpected status code from api")]
    UnexpectedStatusCode { status_code: u16 },

    /// The backend returned an error body.
    #[error("error occurred while trying to {context}: error response from elasticsearch: {body}")]
    Api {
        context: &'static str,
        status_code: u16,
        body: String,
    },

    /// A request or response body was not valid JSON.
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),

    /// The underlying Elasticsearch client failed before a response arrived.
    #[error("elasticsearch client error: {0}")]
    Client(#[from] elasticsearch::Error),

    #[error("function '{operation}' unsupported in the {client} client")]
    Unsupported {
        operation: &'static str,
        client: &'static str,
    },

    #[error("{0}")]
    InvalidRequest(String),

    #[error("bulk indexer client should not be nil")]
    BulkIndexerNotInitialised,

    #[error("{0} client is currently not implemented")]
    UnsupportedLibrary(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// HTTP status code attached to the error, if a response was received.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::UnexpectedStatusCode { status_code } | Self::Api { status_code, .. } => {
                Some(*status_code)
            }
            Self::Client(err) => err.status_code().map(|code| code.as_u16()),
            Self::BulkIndexerNotInitialised => Some(500),
            _ => None,
        }
    }

    pub(crate) fn unsupported(operation: &'static str, client: &'static str) -> Self {
        Self::Unsupported { operation, client }
    }
}

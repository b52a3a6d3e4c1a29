//! Request signing for clusters that require authenticated requests.

mod aws;
mod credentials;

pub use aws::AwsSigner;
pub use credentials::{CredentialsProvider, ResolvedCredentials};

use async_trait::async_trait;
use thiserror::Error;

use crate::transport::EsRequest;

#[derive(Error, Debug)]
pub enum SignError {
    #[error("No AWS region was provided. Cannot sign request.")]
    MissingRegion,

    #[error("No AWS service was provided. Cannot sign request.")]
    MissingService,

    #[error("no AWS credentials available")]
    MissingCredentials,

    #[error("failed to retrieve credentials: {0}")]
    Credentials(String),

    #[error("failed to compute request signature: {0}")]
    Signature(String),
}

/// Adds authentication headers to a request before it is sent.
#[async_trait]
pub trait RequestSigner: Send + Sync {
    async fn sign(&self, request: &mut EsRequest) -> Result<(), SignError>;
}

/// Signer that leaves requests untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSigner;

#[async_trait]
impl RequestSigner for NoopSigner {
    async fn sign(&self, _request: &mut EsRequest) -> Result<(), SignError> {
        Ok(())
    }
}

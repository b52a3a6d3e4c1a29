//! SigV4 request signing for AWS-hosted clusters.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
    sign, SignableBody, SignableRequest, SigningParams, SigningSettings,
};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use reqwest::header::{HeaderName, HeaderValue};
use tracing::debug;

use super::{CredentialsProvider, RequestSigner, SignError};
use crate::transport::EsRequest;

const PROVIDER_NAME: &str = "esprobe";

/// Signs requests with AWS Signature Version 4.
///
/// The signature itself is computed by `aws-sigv4`; this type only resolves
/// credentials and copies the resulting headers onto the request.
pub struct AwsSigner {
    region: String,
    service: String,
    credentials: Arc<CredentialsProvider>,
}

impl AwsSigner {
    pub fn new(
        region: impl Into<String>,
        service: impl Into<String>,
        credentials: Arc<CredentialsProvider>,
    ) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
            credentials,
        }
    }

    fn validate(&self) -> Result<(), SignError> {
        if self.region.is_empty() {
            return Err(SignError::MissingRegion);
        }
        if self.service.is_empty() {
            return Err(SignError::MissingService);
        }
        Ok(())
    }

    /// Sign `request` as of `time`.
    pub async fn sign_at(&self, request: &mut EsRequest, time: SystemTime) -> Result<(), SignError> {
        self.validate()?;

        let creds = self.credentials.retrieve().await?;
        let expiry = creds.expiration.map(SystemTime::from);
        let identity: Identity = Credentials::new(
            creds.access_key_id,
            creds.secret_access_key,
            creds.session_token,
            expiry,
            PROVIDER_NAME,
        )
        .into();

        let params: SigningParams<'_> = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(&self.service)
            .time(time)
            .settings(SigningSettings::default())
            .build()
            .map_err(|e| SignError::Signature(e.to_string()))?
            .into();

        let headers: Vec<(&str, &str)> = request
            .headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
            .collect();
        let body = request.body.as_deref().unwrap_or_default();

        let signable = SignableRequest::new(
            request.method.as_str(),
            request.url.as_str(),
            headers.into_iter(),
            SignableBody::Bytes(body),
        )
        .map_err(|e| SignError::Signature(e.to_string()))?;

        let (instructions, _signature) = sign(signable, &params)
            .map_err(|e| SignError::Signature(e.to_string()))?
            .into_parts();

        let mut signed = Vec::new();
        for (name, value) in instructions.headers() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SignError::Signature(e.to_string()))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| SignError::Signature(e.to_string()))?;
            signed.push((name, value));
        }

        for (name, value) in signed {
            request.headers.insert(name, value);
        }

        debug!(
            url = %request.url,
            method = %request.method,
            service = %self.service,
            region = %self.region,
            "signed request"
        );
        Ok(())
    }
}

#[async_trait]
impl RequestSigner for AwsSigner {
    async fn sign(&self, request: &mut EsRequest) -> Result<(), SignError> {
        self.sign_at(request, SystemTime::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use url::Url;

    fn provider() -> Arc<CredentialsProvider> {
        Arc::new(CredentialsProvider::with_env(|key| match key {
            "AWS_ACCESS_KEY_ID" => Some("AKIDEXAMPLE".to_string()),
            "AWS_SECRET_ACCESS_KEY" => Some("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string()),
            _ => None,
        }))
    }

    fn request() -> EsRequest {
        EsRequest::new(
            Method::GET,
            Url::parse("https://search-domain.eu-west-1.es.amazonaws.com/_cluster/health")
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_sign_adds_authorization_and_date() {
        let signer = AwsSigner::new("eu-west-1", "es", provider());
        let mut req = request();

        signer.sign(&mut req).await.unwrap();

        let auth = req.headers.get("authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(auth.contains("/eu-west-1/es/aws4_request"));
        assert!(req.headers.contains_key("x-amz-date"));
    }

    #[tokio::test]
    async fn test_signature_is_deterministic_for_fixed_time() {
        let signer = AwsSigner::new("eu-west-1", "es", provider());
        let time = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);

        let mut first = request().with_json_body(b"{\"query\":{}}".to_vec());
        let mut second = first.clone();
        signer.sign_at(&mut first, time).await.unwrap();
        signer.sign_at(&mut second, time).await.unwrap();

        assert_eq!(
            first.headers.get("authorization"),
            second.headers.get("authorization")
        );
    }

    #[tokio::test]
    async fn test_missing_region() {
        let signer = AwsSigner::new("", "es", provider());
        let err = signer.sign(&mut request()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "No AWS region was provided. Cannot sign request."
        );
    }

    #[tokio::test]
    async fn test_missing_service() {
        let signer = AwsSigner::new("eu-west-1", "", provider());
        let err = signer.sign(&mut request()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "No AWS service was provided. Cannot sign request."
        );
    }
}

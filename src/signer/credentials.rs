//! AWS credential resolution: environment variables first, then the EC2 instance
//! metadata service.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

use super::SignError;

const ENV_ACCESS_KEY: &str = "AWS_ACCESS_KEY";
const ENV_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
const ENV_SECRET_KEY: &str = "AWS_SECRET_KEY";
const ENV_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const ENV_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";

const METADATA_ENDPOINT: &str = "http://169.254.169.254";
const SECURITY_CREDENTIALS_PATH: &str = "/latest/meta-data/iam/security-credentials/";
const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Role credentials are refreshed this many minutes before they expire. IAM
/// provisions new keys five minutes ahead of expiry.
const EXPIRY_WINDOW_MINUTES: i64 = 4;

type EnvLookup = dyn Fn(&str) -> Option<String> + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    /// Only role credentials expire.
    pub expiration: Option<DateTime<Utc>>,
}

impl ResolvedCredentials {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiration {
            Some(expiration) => {
                expiration - chrono::Duration::minutes(EXPIRY_WINDOW_MINUTES) < now
            }
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
    expiration: Option<DateTime<Utc>>,
}

/// Resolves credentials for request signing.
///
/// Whether the process runs on EC2 is probed at most once per provider; role
/// credentials are cached until they come within four minutes of expiring.
pub struct CredentialsProvider {
    env: Box<EnvLookup>,
    metadata_url: Option<Url>,
    http: Client,
    on_ec2: OnceCell<bool>,
    cached: Mutex<Option<ResolvedCredentials>>,
}

impl CredentialsProvider {
    /// Provider reading the process environment and the standard metadata endpoint.
    pub fn new() -> Result<Self, SignError> {
        let metadata_url =
            Url::parse(METADATA_ENDPOINT).map_err(|e| SignError::Credentials(e.to_string()))?;
        Ok(Self::with_env(|key| std::env::var(key).ok()).with_metadata_endpoint(metadata_url))
    }

    /// Provider using a custom environment lookup.
    pub fn with_env<F>(env: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            env: Box::new(env),
            metadata_url: None,
            http: Client::new(),
            on_ec2: OnceCell::new(),
            cached: Mutex::new(None),
        }
    }

    /// Without an endpoint the provider only reads the environment.
    pub fn with_metadata_endpoint(mut self, url: Url) -> Self {
        self.metadata_url = Some(url);
        self
    }

    /// Resolve credentials, preferring environment variables.
    pub async fn retrieve(&self) -> Result<ResolvedCredentials, SignError> {
        if let Some(creds) = self.from_env() {
            return Ok(creds);
        }

        if !self.is_on_ec2().await {
            return Err(SignError::MissingCredentials);
        }

        let cached = self.cached.lock().clone();
        if let Some(creds) = cached.filter(|c| !c.is_expired()) {
            return Ok(creds);
        }

        let creds = self.fetch_role_credentials().await?;
        *self.cached.lock() = Some(creds.clone());
        Ok(creds)
    }

    fn from_env(&self) -> Option<ResolvedCredentials> {
        let lookup = |primary: &str, fallback: &str| {
            (self.env)(primary)
                .filter(|v| !v.is_empty())
                .or_else(|| (self.env)(fallback).filter(|v| !v.is_empty()))
        };

        let access_key_id = lookup(ENV_ACCESS_KEY_ID, ENV_ACCESS_KEY)?;
        let secret_access_key = lookup(ENV_SECRET_ACCESS_KEY, ENV_SECRET_KEY)?;
        let session_token = (self.env)(ENV_SESSION_TOKEN).filter(|v| !v.is_empty());

        Some(ResolvedCredentials {
            access_key_id,
            secret_access_key,
            session_token,
            expiration: None,
        })
    }

    /// Whether the instance metadata service answers. Memoised per provider.
    pub async fn is_on_ec2(&self) -> bool {
        *self
            .on_ec2
            .get_or_init(|| async {
                let Some(url) = &self.metadata_url else {
                    return false;
                };
                let Some(host) = url.host_str() else {
                    return false;
                };
                let port = url.port_or_known_default().unwrap_or(80);
                let addr = format!("{}:{}", host, port);

                let reachable = matches!(
                    tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await,
                    Ok(Ok(_))
                );
                debug!(addr = %addr, reachable, "probed instance metadata service");
                reachable
            })
            .await
    }

    async fn fetch_role_credentials(&self) -> Result<ResolvedCredentials, SignError> {
        let list_url = self
            .metadata_url
            .as_ref()
            .ok_or(SignError::MissingCredentials)?
            .join(SECURITY_CREDENTIALS_PATH)
            .map_err(|e| SignError::Credentials(e.to_string()))?;

        let roles = self.get_text(&list_url).await?;
        let role = roles
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or(SignError::MissingCredentials)?;

        let role_url = list_url
            .join(role)
            .map_err(|e| SignError::Credentials(e.to_string()))?;
        let body = self.get_text(&role_url).await?;
        let role_creds: RoleCredentials = serde_json::from_str(&body).map_err(|e| {
            warn!(role = %role, error = %e, "invalid role credentials document");
            SignError::Credentials(e.to_string())
        })?;

        info!(role = %role, "loaded credentials from instance metadata");

        Ok(ResolvedCredentials {
            access_key_id: role_creds.access_key_id,
            secret_access_key: role_creds.secret_access_key,
            session_token: role_creds.token.filter(|t| !t.is_empty()),
            expiration: role_creds.expiration,
        })
    }

    async fn get_text(&self, url: &Url) -> Result<String, SignError> {
        let response = self
            .http
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| SignError::Credentials(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SignError::Credentials(format!(
                "metadata service returned {} for {}",
                response.status(),
                url
            )));
        }

        response
            .text()
            .await
            .map_err(|e| SignError::Credentials(e.to_string()))
    }
}

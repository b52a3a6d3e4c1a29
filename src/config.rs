use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use url::Url;

use crate::errors::Error;
use crate::health::HealthCheckerOptions;

/// Backend generation used to talk to the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientLibrary {
    /// Plain HTTP with optional request signing.
    #[default]
    Legacy,
    /// The official `elasticsearch` crate.
    Elasticsearch,
    #[serde(rename = "opensearch")]
    OpenSearch,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub client_lib: ClientLibrary,
    pub address: String,
    pub max_retries: u32,
    /// Indexes that must exist for the cluster to count as healthy.
    pub indexes: Vec<String>,
    pub sign_requests: bool,
    pub aws: Option<AwsConfig>,
    pub health: HealthCheckerOptions,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct AwsConfig {
    pub region: String,
    #[serde(default = "default_service")]
    pub service: String,
}

fn default_service() -> String {
    "es".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_lib: ClientLibrary::default(),
            address: "http://localhost:9200".to_string(),
            max_retries: 3,
            indexes: Vec::new(),
            sign_requests: false,
            aws: None,
            health: HealthCheckerOptions::default(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("Invalid config file")?;
        Ok(config)
    }

    /// Reject settings that cannot produce a working client.
    pub fn validate(&self) -> Result<(), Error> {
        Url::parse(&self.address)?;

        if !self.sign_requests {
            return Ok(());
        }
        if self.client_lib == ClientLibrary::Elasticsearch {
            return Err(Error::Config(
                "request signing is only available with the legacy client".to_string(),
            ));
        }
        let aws = self
            .aws
            .as_ref()
            .ok_or_else(|| Error::Config("signing requires an [aws] section".to_string()))?;
        if aws.region.is_empty() {
            return Err(Error::Config("aws.region must not be empty".to_string()));
        }
        if aws.service.is_empty() {
            return Err(Error::Config("aws.service must not be empty".to_string()));
        }
        Ok(())
    }
}

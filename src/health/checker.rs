//! The health checker.

use std::sync::Arc;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
    CheckState, ClusterHealth, ClusterStatus, Severity, MSG_CLUSTER_AT_RISK, MSG_HEALTHY,
    MSG_INDEX_DOES_NOT_EXIST, PATH_HEALTH,
};
use crate::errors::TransportError;
use crate::transport::{EsRequest, Transport};

/// Status code reported when no response was received.
const STATUS_TRANSPORT_FAILURE: u16 = 500;

/// What to do once an index probe fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexCheckPolicy {
    /// Stop at the first failing index.
    #[default]
    FailFast,
    /// Probe every index, report the first failure and name every missing index.
    ProbeAll,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckerOptions {
    /// Report a yellow cluster as WARNING instead of OK.
    pub treat_yellow_as_warning: bool,
    pub index_check: IndexCheckPolicy,
}

/// Result of a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub severity: Severity,
    pub message: String,
    pub status_code: u16,
}

/// Why a check is critical.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
enum HealthError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unexpected status code from api")]
    UnexpectedStatusCode(u16),

    #[error("error parsing cluster health response body")]
    Parsing(u16),

    #[error("cluster health red. Cluster is unhealthy")]
    ClusterUnhealthy(u16),

    #[error("invalid health status returned")]
    InvalidHealthStatus(u16),

    #[error("{}", index_missing_message(.0))]
    IndexMissing(Vec<String>),
}

fn index_missing_message(indexes: &[String]) -> String {
    if indexes.len() > 1 {
        format!("{}: {}", MSG_INDEX_DOES_NOT_EXIST, indexes.join(", "))
    } else {
        MSG_INDEX_DOES_NOT_EXIST.to_string()
    }
}

impl HealthError {
    fn status_code(&self) -> u16 {
        match self {
            HealthError::Transport(_) => STATUS_TRANSPORT_FAILURE,
            HealthError::IndexMissing(_) => 404,
            HealthError::UnexpectedStatusCode(code)
            | HealthError::Parsing(code)
            | HealthError::ClusterUnhealthy(code)
            | HealthError::InvalidHealthStatus(code) => *code,
        }
    }

    fn into_outcome(self) -> CheckOutcome {
        CheckOutcome {
            severity: Severity::Critical,
            message: self.to_string(),
            status_code: self.status_code(),
        }
    }
}

/// Checks one cluster and a fixed, ordered set of indexes.
///
/// Requests are issued sequentially: the cluster health call first, then one HEAD
/// per index. The checker keeps no state between calls, so it can be shared behind
/// an `Arc` as long as the transport can.
pub struct HealthChecker {
    transport: Arc<dyn Transport>,
    base_url: String,
    indexes: Vec<String>,
    options: HealthCheckerOptions,
}

impl HealthChecker {
    /// Create a checker for the cluster at `base_url`.
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: &str,
        indexes: Vec<String>,
        options: HealthCheckerOptions,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            indexes,
            options,
        }
    }

    /// Indexes that must exist.
    pub fn indexes(&self) -> &[String] {
        &self.indexes
    }

    /// Get the classification options
    pub fn options(&self) -> HealthCheckerOptions {
        self.options
    }

    /// Classify the current state of the cluster.
    pub async fn check(&self) -> CheckOutcome {
        let (status, status_code) = match self.cluster_health().await {
            Ok(health) => health,
            Err(err) => return err.into_outcome(),
        };

        if !self.indexes.is_empty() {
            if let Err(err) = self.index_check().await {
                return err.into_outcome();
            }
        }

        match status {
            ClusterStatus::Yellow => {
                let severity = if self.options.treat_yellow_as_warning {
                    Severity::Warning
                } else {
                    Severity::Ok
                };
                CheckOutcome {
                    severity,
                    message: MSG_CLUSTER_AT_RISK.to_string(),
                    status_code,
                }
            }
            _ => CheckOutcome {
                severity: Severity::Ok,
                message: MSG_HEALTHY.to_string(),
                status_code,
            },
        }
    }

    /// Run a check and record the result in `state`.
    pub async fn checker(&self, state: &mut CheckState) {
        let outcome = self.check().await;
        state.update(outcome.severity, outcome.message, outcome.status_code);
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        let raw = format!("{}{}", self.base_url, path);
        Url::parse(&raw).map_err(|e| {
            error!(url = %raw, error = %e, "failed to create url for elasticsearch healthcheck");
            TransportError::invalid_request(e.to_string())
        })
    }

    /// Only green and yellow come back as `Ok`.
    async fn cluster_health(&self) -> Result<(ClusterStatus, u16), HealthError> {
        let url = self.url(PATH_HEALTH)?;
        let response = self
            .transport
            .execute(EsRequest::new(Method::GET, url.clone()))
            .await
            .map_err(|e| {
                error!(url = %url, method = "GET", error = %e, "failed to call elasticsearch");
                HealthError::from(e)
            })?;

        let code = response.status;
        if !response.is_success() {
            error!(url = %url, http_code = code, "unexpected status code returned in response");
            return Err(HealthError::UnexpectedStatusCode(code));
        }

        let health: ClusterHealth = serde_json::from_slice(&response.body).map_err(|e| {
            error!(url = %url, http_code = code, error = %e, "json unmarshal error");
            HealthError::Parsing(code)
        })?;

        match ClusterStatus::parse(&health.status) {
            Some(ClusterStatus::Green) => {
                debug!(url = %url, http_code = code, cluster_health = "green", "cluster is healthy");
                Ok((ClusterStatus::Green, code))
            }
            Some(ClusterStatus::Yellow) => {
                warn!(url = %url, http_code = code, cluster_health = "yellow", "yellow health status");
                Ok((ClusterStatus::Yellow, code))
            }
            Some(ClusterStatus::Red) => {
                error!(url = %url, http_code = code, cluster_health = "red", "red health status");
                Err(HealthError::ClusterUnhealthy(code))
            }
            None => {
                error!(url = %url, http_code = code, cluster_health = %health.status, "invalid health status");
                Err(HealthError::InvalidHealthStatus(code))
            }
        }
    }

    async fn index_check(&self) -> Result<(), HealthError> {
        let mut first_failure: Option<HealthError> = None;
        let mut missing = Vec::new();

        for index in &self.indexes {
            let result = self.probe_index(index).await;
            let Err(err) = result else {
                continue;
            };

            if matches!(err, HealthError::IndexMissing(_)) {
                missing.push(index.clone());
            }
            if self.options.index_check == IndexCheckPolicy::FailFast {
                return Err(err);
            }
            first_failure.get_or_insert(err);
        }

        match first_failure {
            Some(HealthError::IndexMissing(_)) => Err(HealthError::IndexMissing(missing)),
            Some(err) => Err(err),
            None => {
                info!(indexes = ?self.indexes, "all required indexes exist");
                Ok(())
            }
        }
    }

    async fn probe_index(&self, index: &str) -> Result<(), HealthError> {
        let url = self.url(&format!("/{}", index))?;
        let response = self
            .transport
            .execute(EsRequest::new(Method::HEAD, url.clone()))
            .await
            .map_err(|e| {
                error!(url = %url, method = "HEAD", index, error = %e, "failed to call elasticsearch");
                HealthError::from(e)
            })?;

        match response.status {
            200 => Ok(()),
            404 => {
                error!(url = %url, index, http_code = 404, "index does not exist");
                Err(HealthError::IndexMissing(vec![index.to_string()]))
            }
            code => {
                error!(url = %url, index, http_code = code, "unexpected status code returned in response");
                Err(HealthError::UnexpectedStatusCode(code))
            }
        }
    }
}

//! Cluster health classification.
//!
//! [`HealthChecker`] turns the cluster-health endpoint and the per-index existence
//! probes into a [`Severity`], a message and a status code. Results are written to a
//! caller-owned [`CheckState`], which keeps the success/failure timestamps.

mod checker;

pub use checker::{CheckOutcome, HealthChecker, HealthCheckerOptions, IndexCheckPolicy};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Path of the cluster health API.
pub const PATH_HEALTH: &str = "/_cluster/health";

/// Name reported for checks against the cluster.
pub const SERVICE_NAME: &str = "elasticsearch";

pub const MSG_HEALTHY: &str = "elasticsearch is healthy and the required indexes exist";
pub const MSG_UNEXPECTED_STATUS_CODE: &str = "unexpected status code from api";
pub const MSG_PARSING_BODY: &str = "error parsing cluster health response body";
pub const MSG_CLUSTER_AT_RISK: &str = "elasticsearch cluster state yellow but functional. Data might be at risk, check your replica shards";
pub const MSG_CLUSTER_UNHEALTHY: &str = "cluster health red. Cluster is unhealthy";
pub const MSG_INVALID_HEALTH_STATUS: &str = "invalid health status returned";
pub const MSG_INDEX_DOES_NOT_EXIST: &str = "index does not exist in cluster";

/// Severity reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Ok => "OK",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health status reported by the cluster health API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    Green,
    Yellow,
    Red,
}

impl ClusterStatus {
    /// Parse the `status` field; anything outside green/yellow/red is `None`.
    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "green" => Some(ClusterStatus::Green),
            "yellow" => Some(ClusterStatus::Yellow),
            "red" => Some(ClusterStatus::Red),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Green => "green",
            ClusterStatus::Yellow => "yellow",
            ClusterStatus::Red => "red",
        }
    }
}

/// Body of the cluster health API. Only `status` is read.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterHealth {
    #[serde(default)]
    pub status: String,
}

/// Caller-owned record of the latest check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckState {
    pub name: String,
    pub status: Option<Severity>,
    pub status_code: u16,
    pub message: String,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl CheckState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: None,
            status_code: 0,
            message: String::new(),
            last_checked: None,
            last_success: None,
            last_failure: None,
        }
    }

    /// Record a check result at the current time.
    pub fn update(&mut self, status: Severity, message: impl Into<String>, status_code: u16) {
        self.update_at(status, message, status_code, Utc::now());
    }

    /// Record a check result. OK moves `last_success`, anything else moves
    /// `last_failure`; the other timestamp is kept.
    pub fn update_at(
        &mut self,
        status: Severity,
        message: impl Into<String>,
        status_code: u16,
        now: DateTime<Utc>,
    ) {
        self.status = Some(status);
        self.message = message.into();
        self.status_code = status_code;
        self.last_checked = Some(now);
        match status {
            Severity::Ok => self.last_success = Some(now),
            Severity::Warning | Severity::Critical => self.last_failure = Some(now),
        }
    }

    /// Severity of the latest check, `None` before the first one.
    pub fn status(&self) -> Option<Severity> {
        self.status
    }

    /// Message of the latest check.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Status code of the latest check.
    pub fn status_code(&self) -> u16 {
        self.status_code
    }
}

impl Default for CheckState {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cluster_status() {
        assert_eq!(ClusterStatus::parse("green"), Some(ClusterStatus::Green));
        assert_eq!(ClusterStatus::parse("yellow"), Some(ClusterStatus::Yellow));
        assert_eq!(ClusterStatus::parse("red"), Some(ClusterStatus::Red));
        assert_eq!(ClusterStatus::parse("purple"), None);
        assert_eq!(ClusterStatus::parse("GREEN"), None);
    }

    #[test]
    fn test_missing_status_field_decodes_empty() {
        let health: ClusterHealth =
            serde_json::from_str(r#"{"cluster_name": "testcluster"}"#).unwrap();
        assert_eq!(health.status, "");
    }

    #[test]
    fn test_update_keeps_previous_timestamps() {
        let mut state = CheckState::new(SERVICE_NAME);
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(30);

        state.update_at(Severity::Ok, MSG_HEALTHY, 200, t1);
        assert_eq!(state.last_success, Some(t1));
        assert_eq!(state.last_failure, None);

        state.update_at(Severity::Critical, MSG_CLUSTER_UNHEALTHY, 200, t2);
        assert_eq!(state.status(), Some(Severity::Critical));
        assert_eq!(state.last_checked, Some(t2));
        assert_eq!(state.last_success, Some(t1));
        assert_eq!(state.last_failure, Some(t2));
    }

    #[test]
    fn test_severity_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Severity::Warning).unwrap(), "\"WARNING\"");
        assert_eq!(Severity::Critical.to_string(), "CRITICAL");
    }
}

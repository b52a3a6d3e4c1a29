//! esprobe - Elasticsearch clients with cluster health checking
//!
//! This library provides a common [`client::SearchClient`] interface over a plain
//! HTTP client and the official `elasticsearch` crate, plus the health checker both
//! of them use.

pub mod client;
pub mod config;
pub mod errors;
pub mod health;
pub mod signer;
pub mod transport;

pub use client::{new_client, SearchClient};
pub use config::{ClientLibrary, Config};
pub use errors::Error;
pub use health::{CheckState, HealthChecker, HealthCheckerOptions, Severity};

//! Elasticsearch clients.
//!
//! [`SearchClient`] is the one interface callers program against. There is one
//! implementation per backend generation, chosen by [`ClientLibrary`] when the
//! client is built with [`new_client`].

mod bulk;
mod legacy;
mod sdk;

pub use bulk::{BulkIndexer, BulkIndexerConfig, BulkItem, BulkItemResponse, FailureFn, SuccessFn};
pub use legacy::LegacyClient;
pub use sdk::{SdkClient, SdkTransport};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ClientLibrary, Config};
use crate::errors::Error;
use crate::health::CheckState;
use crate::signer::{AwsSigner, CredentialsProvider, RequestSigner};
use crate::transport::{RetryTransport, SignedTransport, Transport};

/// Multi-search header line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub index: String,
}

/// A query against one index. `query` is the raw JSON request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Search {
    pub header: Header,
    pub query: Vec<u8>,
}

impl Search {
    pub fn new(index: impl Into<String>, query: impl Into<Vec<u8>>) -> Self {
        Self {
            header: Header {
                index: index.into(),
            },
            query: query.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Count {
    pub query: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryParams {
    /// Report `hits.total` as a plain integer.
    pub enable_total_hits_counter: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddDocumentOptions {
    /// Mapping type. Ignored by clusters that no longer have types.
    pub document_type: Option<String>,
    /// Replace the document if it already exists.
    pub upsert: bool,
}

/// Bulk action applied to one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkIndexerAction {
    Create,
    Delete,
    Index,
    Update,
}

impl BulkIndexerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkIndexerAction::Create => "create",
            BulkIndexerAction::Delete => "delete",
            BulkIndexerAction::Index => "index",
            BulkIndexerAction::Update => "update",
        }
    }
}

/// Operations supported by every client generation.
///
/// Byte-returning methods hand back the raw JSON response body.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn add_document(
        &self,
        index: &str,
        document_id: &str,
        document: &[u8],
        options: Option<&AddDocumentOptions>,
    ) -> Result<(), Error>;

    /// Submit a pre-built newline-delimited bulk body. `es_url` overrides the
    /// client address where the client talks HTTP directly.
    async fn bulk_update(&self, index: &str, es_url: &str, payload: &[u8]) -> Result<Vec<u8>, Error>;

    async fn new_bulk_indexer(&self) -> Result<(), Error>;

    async fn bulk_index_add(
        &self,
        action: BulkIndexerAction,
        index: &str,
        document_id: &str,
        document: &[u8],
        on_success: Option<SuccessFn>,
        on_failure: Option<FailureFn>,
    ) -> Result<(), Error>;

    /// Flush pending items and stop the bulk indexer.
    async fn bulk_index_close(&self) -> Result<(), Error>;

    /// Check the cluster and the configured indexes, recording the result in `state`.
    async fn checker(&self, state: &mut CheckState);

    async fn create_index(&self, index: &str, settings: &[u8]) -> Result<(), Error>;

    async fn delete_document(&self, index: &str, document_id: &str) -> Result<(), Error>;

    async fn delete_document_by_query(&self, search: &Search) -> Result<(), Error>;

    async fn delete_index(&self, index: &str) -> Result<(), Error>;

    /// Fails with [`Error::InvalidRequest`] when `indices` is empty.
    async fn delete_indices(&self, indices: &[String]) -> Result<(), Error>;

    async fn get_alias(&self) -> Result<Vec<u8>, Error>;

    /// Fails with [`Error::InvalidRequest`] when `index_patterns` is empty.
    async fn get_indices(&self, index_patterns: &[String]) -> Result<Vec<u8>, Error>;

    async fn update_aliases(
        &self,
        alias: &str,
        remove_indices: &[String],
        add_indices: &[String],
    ) -> Result<(), Error>;

    async fn multi_search(
        &self,
        searches: &[Search],
        params: Option<&QueryParams>,
    ) -> Result<Vec<u8>, Error>;

    async fn search(&self, search: &Search) -> Result<Vec<u8>, Error>;

    async fn count(&self, count: &Count) -> Result<Vec<u8>, Error>;

    async fn count_indices(&self, indices: &[String]) -> Result<Vec<u8>, Error>;

    async fn explain(&self, document_id: &str, search: &Search) -> Result<Vec<u8>, Error>;
}

/// Build the client selected by `config.client_lib`.
pub fn new_client(config: &Config) -> Result<Box<dyn SearchClient>, Error> {
    config.validate()?;

    match config.client_lib {
        ClientLibrary::Legacy => {
            let retry = Arc::new(RetryTransport::new(config.max_retries).map_err(Error::from)?);
            let transport: Arc<dyn Transport> = match signer_for(config)? {
                Some(signer) => Arc::new(SignedTransport::new(retry.clone(), signer)),
                None => retry.clone(),
            };
            let client = LegacyClient::with_transport(
                &config.address,
                transport,
                config.indexes.clone(),
                config.health,
            );
            LegacyClient::disable_health_retries(&retry);

            info!(address = %config.address, "created legacy elasticsearch client");
            Ok(Box::new(client))
        }
        ClientLibrary::Elasticsearch => {
            let client = SdkClient::new(&config.address, config.indexes.clone(), config.health)?;
            info!(address = %config.address, "created elasticsearch sdk client");
            Ok(Box::new(client))
        }
        ClientLibrary::OpenSearch => Err(Error::UnsupportedLibrary("OpenSearch".to_string())),
    }
}

fn signer_for(config: &Config) -> Result<Option<Arc<dyn RequestSigner>>, Error> {
    if !config.sign_requests {
        return Ok(None);
    }
    let aws = config
        .aws
        .as_ref()
        .ok_or_else(|| Error::Config("signing requires an [aws] section".to_string()))?;
    let provider = CredentialsProvider::new().map_err(|e| Error::Config(e.to_string()))?;
    Ok(Some(Arc::new(AwsSigner::new(
        aws.region.clone(),
        aws.service.clone(),
        Arc::new(provider),
    ))))
}

/// Newline-delimited `header\nquery\n` body for the multi-search API.
pub(crate) fn multiline_searches(searches: &[Search]) -> Result<Vec<u8>, Error> {
    let mut body = Vec::new();
    for search in searches {
        serde_json::to_writer(&mut body, &search.header)?;
        body.push(b'\n');
        body.extend_from_slice(&search.query);
        body.push(b'\n');
    }
    Ok(body)
}

/// `update_aliases` request body.
pub(crate) fn alias_actions(alias: &str, remove_indices: &[String], add_indices: &[String]) -> serde_json::Value {
    let mut actions = Vec::new();
    if !remove_indices.is_empty() {
        actions.push(serde_json::json!({
            "remove": { "indices": remove_indices, "alias": alias }
        }));
    }
    if !add_indices.is_empty() {
        actions.push(serde_json::json!({
            "add": { "indices": add_indices, "alias": alias }
        }));
    }
    serde_json::json!({ "actions": actions })
}

//! Bulk indexing operations for Elasticsearch.

use std::sync::Arc;
use std::time::Duration;

use elasticsearch::http::request::JsonBody;
use elasticsearch::{BulkParts, Elasticsearch};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::BulkIndexerAction;
use crate::errors::Error;

const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Called with the item and its result when the cluster accepted it.
pub type SuccessFn = Arc<dyn Fn(&BulkItem, &BulkItemResponse) + Send + Sync>;

/// Called with the item, its result and an error description when it failed.
pub type FailureFn = Arc<dyn Fn(&BulkItem, &BulkItemResponse, Option<&str>) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct BulkIndexerConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for BulkIndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// One queued bulk operation.
pub struct BulkItem {
    pub action: BulkIndexerAction,
    pub index: String,
    pub document_id: String,
    pub document: Vec<u8>,
    pub on_success: Option<SuccessFn>,
    pub on_failure: Option<FailureFn>,
}

impl BulkItem {
    fn succeeded(&self, response: &BulkItemResponse) {
        if let Some(on_success) = &self.on_success {
            on_success(self, response);
        }
    }

    fn failed(&self, response: &BulkItemResponse, err: Option<&str>) {
        if let Some(on_failure) = &self.on_failure {
            on_failure(self, response, err);
        }
    }
}

/// Per-item entry of a bulk response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkItemResponse {
    #[serde(rename = "_index", default)]
    pub index: String,
    #[serde(rename = "_id", default)]
    pub document_id: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub error: Option<Value>,
}

impl BulkItemResponse {
    fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status)
    }
}

struct Inner {
    client: Elasticsearch,
    batch_size: usize,
    buffer: tokio::sync::Mutex<Vec<BulkItem>>,
    stats: Mutex<(usize, usize)>,
}

/// Buffers bulk operations and sends them in batches.
///
/// The buffer is flushed when it reaches the batch size, on every flush interval
/// and on [`close`](BulkIndexer::close). Results are delivered through each
/// item's callbacks.
pub struct BulkIndexer {
    inner: Arc<Inner>,
    flusher: Option<JoinHandle<()>>,
}

impl BulkIndexer {
    /// Create a bulk indexer and start its periodic flush. Must be called from
    /// within a tokio runtime.
    pub fn new(client: Elasticsearch, config: BulkIndexerConfig) -> Self {
        let inner = Arc::new(Inner {
            client,
            batch_size: config.batch_size.max(1),
            buffer: tokio::sync::Mutex::new(Vec::with_capacity(config.batch_size.max(1))),
            stats: Mutex::new((0, 0)),
        });

        let periodic = inner.clone();
        let flush_interval = config.flush_interval.max(Duration::from_millis(1));
        let flusher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = periodic.flush().await {
                    warn!("periodic bulk flush failed: {}", e);
                }
            }
        });

        Self {
            inner,
            flusher: Some(flusher),
        }
    }

    /// Queue an item, flushing if the batch is full.
    pub async fn add(&self, item: BulkItem) -> Result<(), Error> {
        let batch = {
            let mut buffer = self.inner.buffer.lock().await;
            buffer.push(item);
            if buffer.len() < self.inner.batch_size {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };
        self.inner.send(batch).await
    }

    pub async fn flush(&self) -> Result<(), Error> {
        self.inner.flush().await
    }

    /// Stop the periodic flush and send whatever is still buffered.
    pub async fn close(mut self) -> Result<(), Error> {
        if let Some(flusher) = self.flusher.take() {
            flusher.abort();
        }
        self.inner.flush().await
    }

    /// (items indexed, items failed) so far.
    pub fn stats(&self) -> (usize, usize) {
        *self.inner.stats.lock()
    }
}

impl Drop for BulkIndexer {
    fn drop(&mut self) {
        if let Some(flusher) = self.flusher.take() {
            flusher.abort();
        }
    }
}

impl Inner {
    async fn flush(&self) -> Result<(), Error> {
        let batch = std::mem::take(&mut *self.buffer.lock().await);
        self.send(batch).await
    }

    async fn send(&self, items: Vec<BulkItem>) -> Result<(), Error> {
        if items.is_empty() {
            return Ok(());
        }

        let mut body: Vec<JsonBody<Value>> = Vec::with_capacity(items.len() * 2);
        let mut sent = Vec::with_capacity(items.len());

        for item in items {
            let mut meta = json!({ "_index": item.index });
            if !item.document_id.is_empty() {
                meta["_id"] = json!(item.document_id);
            }

            let document = if item.action == BulkIndexerAction::Delete {
                None
            } else {
                match serde_json::from_slice::<Value>(&item.document) {
                    Ok(doc) => Some(doc),
                    Err(e) => {
                        item.failed(&BulkItemResponse::default(), Some(&e.to_string()));
                        self.stats.lock().1 += 1;
                        continue;
                    }
                }
            };

            let mut action_line = serde_json::Map::new();
            action_line.insert(item.action.as_str().to_string(), meta);
            body.push(Value::Object(action_line).into());
            if let Some(document) = document {
                body.push(document.into());
            }
            sent.push(item);
        }

        if sent.is_empty() {
            return Ok(());
        }

        let count = sent.len();
        debug!("Flushing {} bulk items to Elasticsearch", count);

        let result = self.client.bulk(BulkParts::None).body(body).send().await;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let err = e.to_string();
                self.fail_all(&sent, &err);
                return Err(Error::Client(e));
            }
        };

        let status = response.status_code().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            self.fail_all(&sent, &text);
            return Err(Error::Api {
                context: "bulk index documents",
                status_code: status,
                body: text,
            });
        }

        let response_body = response.json::<Value>().await?;
        let results = response_body["items"].as_array().cloned().unwrap_or_default();

        let mut errors = 0;
        for (i, item) in sent.iter().enumerate() {
            let result = results
                .get(i)
                .and_then(|entry| entry.as_object())
                .and_then(|entry| entry.values().next())
                .and_then(|value| serde_json::from_value::<BulkItemResponse>(value.clone()).ok());

            match result {
                Some(result) if result.is_success() => item.succeeded(&result),
                Some(result) => {
                    errors += 1;
                    let reason = result.error.as_ref().map(|e| e.to_string());
                    item.failed(&result, reason.as_deref());
                }
                None => {
                    errors += 1;
                    item.failed(
                        &BulkItemResponse::default(),
                        Some("missing item in bulk response"),
                    );
                }
            }
        }

        if errors > 0 {
            warn!("Bulk request had {} errors out of {} documents", errors, count);
        }

        let mut stats = self.stats.lock();
        stats.0 += count - errors;
        stats.1 += errors;
        Ok(())
    }

    fn fail_all(&self, items: &[BulkItem], err: &str) {
        warn!("Bulk request failed for {} documents: {}", items.len(), err);
        for item in items {
            item.failed(&BulkItemResponse::default(), Some(err));
        }
        self.stats.lock().1 += items.len();
    }
}

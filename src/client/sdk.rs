//! Client backed by the official `elasticsearch` crate.

use std::sync::Arc;

use async_trait::async_trait;
use elasticsearch::http::headers::{HeaderMap, HeaderName, HeaderValue};
use elasticsearch::http::request::JsonBody;
use elasticsearch::http::response::Response;
use elasticsearch::http::transport::{SingleNodeConnectionPool, TransportBuilder};
use elasticsearch::http::Method as EsMethod;
use elasticsearch::indices::{
    IndicesCreateParts, IndicesDeleteParts, IndicesGetAliasParts, IndicesGetParts,
};
use elasticsearch::{
    BulkParts, CountParts, CreateParts, DeleteByQueryParts, DeleteParts, Elasticsearch,
    ExplainParts, IndexParts, MsearchParts, SearchParts,
};
use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    alias_actions, AddDocumentOptions, BulkIndexer, BulkIndexerAction, BulkIndexerConfig,
    BulkItem, Count, FailureFn, QueryParams, Search, SearchClient, SuccessFn,
};
use crate::errors::{Error, TransportError};
use crate::health::{CheckState, HealthChecker, HealthCheckerOptions};
use crate::transport::{EsRequest, EsResponse, Transport};

/// Routes raw requests through an `Elasticsearch` client so the health checker can
/// use the same connection pool as the typed API.
///
/// Requests carry full URLs built from the node address, while the client joins
/// paths onto that address itself, so the address path is stripped before sending.
#[derive(Clone)]
pub struct SdkTransport {
    client: Elasticsearch,
    base_path: String,
}

impl SdkTransport {
    /// Create a transport for a client connected to `base`.
    pub fn new(client: Elasticsearch, base: &Url) -> Self {
        Self {
            client,
            base_path: base.path().trim_end_matches('/').to_string(),
        }
    }

    /// Path relative to the node address.
    fn relative_path<'a>(&self, url: &'a Url) -> &'a str {
        let path = url.path();
        path.strip_prefix(self.base_path.as_str())
            .filter(|rest| rest.starts_with('/'))
            .unwrap_or(path)
    }
}

#[async_trait]
impl Transport for SdkTransport {
    async fn execute(&self, request: EsRequest) -> Result<EsResponse, TransportError> {
        let method = match request.method {
            Method::GET => EsMethod::Get,
            Method::HEAD => EsMethod::Head,
            Method::PUT => EsMethod::Put,
            Method::POST => EsMethod::Post,
            Method::DELETE => EsMethod::Delete,
            other => {
                return Err(TransportError::invalid_request(format!(
                    "unsupported method {}",
                    other
                )))
            }
        };

        let mut headers = HeaderMap::new();
        for (name, value) in request.headers.iter() {
            let name = HeaderName::from_bytes(name.as_str().as_bytes())
                .map_err(|e| TransportError::invalid_request(e.to_string()))?;
            let value = HeaderValue::from_bytes(value.as_bytes())
                .map_err(|e| TransportError::invalid_request(e.to_string()))?;
            headers.insert(name, value);
        }

        let query: Vec<(String, String)> = request.url.query_pairs().into_owned().collect();
        let query = if query.is_empty() { None } else { Some(&query) };

        let response = self
            .client
            .send(
                method,
                self.relative_path(&request.url),
                headers,
                query,
                request.body,
                None,
            )
            .await
            .map_err(|e| TransportError::network(e.to_string()))?;

        let status = response.status_code().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::network(e.to_string()))?;

        Ok(EsResponse::new(status, body.to_vec()))
    }
}

/// Elasticsearch client using the typed `elasticsearch` API.
pub struct SdkClient {
    client: Elasticsearch,
    checker: HealthChecker,
    bulk_config: BulkIndexerConfig,
    bulk_indexer: Mutex<Option<BulkIndexer>>,
}

impl SdkClient {
    /// Create a client for a single node.
    pub fn new(
        address: &str,
        indexes: Vec<String>,
        options: HealthCheckerOptions,
    ) -> Result<Self, Error> {
        let url = Url::parse(address)?;
        let conn_pool = SingleNodeConnectionPool::new(url);
        let transport = TransportBuilder::new(conn_pool)
            .disable_proxy()
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        Self::with_client(Elasticsearch::new(transport), address, indexes, options)
    }

    /// Wrap an existing client connected to `address`.
    pub fn with_client(
        client: Elasticsearch,
        address: &str,
        indexes: Vec<String>,
        options: HealthCheckerOptions,
    ) -> Result<Self, Error> {
        let base = Url::parse(address)?;
        let transport = Arc::new(SdkTransport::new(client.clone(), &base));
        Ok(Self {
            checker: HealthChecker::new(transport, address, indexes, options),
            client,
            bulk_config: BulkIndexerConfig::default(),
            bulk_indexer: Mutex::new(None),
        })
    }

    pub fn with_bulk_config(mut self, config: BulkIndexerConfig) -> Self {
        self.bulk_config = config;
        self
    }

    /// Get the underlying Elasticsearch client
    pub fn client(&self) -> &Elasticsearch {
        &self.client
    }
}

/// Read a response body, turning error statuses into [`Error::Api`].
async fn read_body(
    result: Result<Response, elasticsearch::Error>,
    context: &'static str,
) -> Result<Vec<u8>, Error> {
    let response = result?;
    let status = response.status_code();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!(http_code = status.as_u16(), context, "error response from elasticsearch");
        return Err(Error::Api {
            context,
            status_code: status.as_u16(),
            body,
        });
    }
    Ok(response.bytes().await?.to_vec())
}

fn json_body(raw: &[u8]) -> Result<Value, Error> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    Ok(serde_json::from_slice(raw)?)
}

fn ndjson_lines(raw: &[u8]) -> Result<Vec<JsonBody<Value>>, Error> {
    raw.split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(|line| Ok(serde_json::from_slice::<Value>(line)?.into()))
        .collect()
}

fn as_refs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}

#[async_trait]
impl SearchClient for SdkClient {
    async fn add_document(
        &self,
        index: &str,
        document_id: &str,
        document: &[u8],
        options: Option<&AddDocumentOptions>,
    ) -> Result<(), Error> {
        if let Some(document_type) = options.and_then(|o| o.document_type.as_deref()) {
            debug!(document_type, "document types are not supported, ignoring");
        }
        let body = json_body(document)?;

        let result = if options.map(|o| o.upsert).unwrap_or(false) {
            self.client
                .index(IndexParts::IndexId(index, document_id))
                .body(body)
                .send()
                .await
        } else {
            self.client
                .create(CreateParts::IndexId(index, document_id))
                .body(body)
                .send()
                .await
        };

        read_body(result, "add document").await?;
        Ok(())
    }

    async fn bulk_update(&self, index: &str, _es_url: &str, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let body = ndjson_lines(payload)?;
        let result = self
            .client
            .bulk(BulkParts::Index(index))
            .body(body)
            .send()
            .await;
        read_body(result, "bulk update document").await
    }

    async fn new_bulk_indexer(&self) -> Result<(), Error> {
        let previous = self
            .bulk_indexer
            .lock()
            .await
            .replace(BulkIndexer::new(self.client.clone(), self.bulk_config));

        if let Some(previous) = previous {
            previous.close().await?;
        }
        info!(batch_size = self.bulk_config.batch_size, "created bulk indexer");
        Ok(())
    }

    async fn bulk_index_add(
        &self,
        action: BulkIndexerAction,
        index: &str,
        document_id: &str,
        document: &[u8],
        on_success: Option<SuccessFn>,
        on_failure: Option<FailureFn>,
    ) -> Result<(), Error> {
        let guard = self.bulk_indexer.lock().await;
        let indexer = guard.as_ref().ok_or(Error::BulkIndexerNotInitialised)?;
        indexer
            .add(BulkItem {
                action,
                index: index.to_string(),
                document_id: document_id.to_string(),
                document: document.to_vec(),
                on_success,
                on_failure,
            })
            .await
    }

    async fn bulk_index_close(&self) -> Result<(), Error> {
        let indexer = self
            .bulk_indexer
            .lock()
            .await
            .take()
            .ok_or(Error::BulkIndexerNotInitialised)?;
        indexer.close().await
    }

    async fn checker(&self, state: &mut CheckState) {
        self.checker.checker(state).await;
    }

    async fn create_index(&self, index: &str, settings: &[u8]) -> Result<(), Error> {
        let result = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(index))
            .body(json_body(settings)?)
            .send()
            .await;
        read_body(result, "create index").await?;
        info!(index, "created index");
        Ok(())
    }

    async fn delete_document(&self, index: &str, document_id: &str) -> Result<(), Error> {
        let result = self
            .client
            .delete(DeleteParts::IndexId(index, document_id))
            .send()
            .await;
        read_body(result, "delete document").await?;
        Ok(())
    }

    async fn delete_document_by_query(&self, search: &Search) -> Result<(), Error> {
        let result = self
            .client
            .delete_by_query(DeleteByQueryParts::Index(&[search.header.index.as_str()]))
            .body(json_body(&search.query)?)
            .send()
            .await;
        read_body(result, "delete documents by query").await?;
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<(), Error> {
        self.delete_indices(&[index.to_string()]).await
    }

    async fn delete_indices(&self, indices: &[String]) -> Result<(), Error> {
        if indices.is_empty() {
            return Err(Error::InvalidRequest("no indices to delete".to_string()));
        }
        let refs = as_refs(indices);
        let result = self
            .client
            .indices()
            .delete(IndicesDeleteParts::Index(&refs))
            .send()
            .await;
        read_body(result, "delete index").await?;
        info!(indices = ?indices, "deleted indices");
        Ok(())
    }

    async fn get_alias(&self) -> Result<Vec<u8>, Error> {
        let result = self
            .client
            .indices()
            .get_alias(IndicesGetAliasParts::None)
            .send()
            .await;
        read_body(result, "retrieve aliases").await
    }

    async fn get_indices(&self, index_patterns: &[String]) -> Result<Vec<u8>, Error> {
        if index_patterns.is_empty() {
            return Err(Error::InvalidRequest("no index patterns given".to_string()));
        }
        let refs = as_refs(index_patterns);
        let result = self
            .client
            .indices()
            .get(IndicesGetParts::Index(&refs))
            .send()
            .await;
        read_body(result, "retrieve indices").await
    }

    async fn update_aliases(
        &self,
        alias: &str,
        remove_indices: &[String],
        add_indices: &[String],
    ) -> Result<(), Error> {
        let result = self
            .client
            .indices()
            .update_aliases()
            .body(alias_actions(alias, remove_indices, add_indices))
            .send()
            .await;
        read_body(result, "update aliases").await?;
        Ok(())
    }

    async fn multi_search(
        &self,
        searches: &[Search],
        params: Option<&QueryParams>,
    ) -> Result<Vec<u8>, Error> {
        let mut body: Vec<JsonBody<Value>> = Vec::with_capacity(searches.len() * 2);
        for search in searches {
            body.push(serde_json::to_value(&search.header)?.into());
            body.push(json_body(&search.query)?.into());
        }

        let mut request = self.client.msearch(MsearchParts::None).body(body);
        if let Some(flag) = params.and_then(|p| p.enable_total_hits_counter) {
            request = request.rest_total_hits_as_int(flag);
        }
        read_body(request.send().await, "multi search documents").await
    }

    async fn search(&self, search: &Search) -> Result<Vec<u8>, Error> {
        let result = self
            .client
            .search(SearchParts::Index(&[search.header.index.as_str()]))
            .body(json_body(&search.query)?)
            .send()
            .await;
        read_body(result, "search documents").await
    }

    async fn count(&self, count: &Count) -> Result<Vec<u8>, Error> {
        let result = self
            .client
            .count(CountParts::None)
            .body(json_body(&count.query)?)
            .send()
            .await;
        read_body(result, "count documents").await
    }

    async fn count_indices(&self, indices: &[String]) -> Result<Vec<u8>, Error> {
        let refs = as_refs(indices);
        let result = self.client.count(CountParts::Index(&refs)).send().await;
        read_body(result, "count indices").await
    }

    async fn explain(&self, document_id: &str, search: &Search) -> Result<Vec<u8>, Error> {
        let result = self
            .client
            .explain(ExplainParts::IndexId(&search.header.index, document_id))
            .body(json_body(&search.query)?)
            .send()
            .await;
        read_body(result, "call explain api").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{Severity, MSG_HEALTHY, MSG_INDEX_DOES_NOT_EXIST, SERVICE_NAME};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, indexes: &[&str]) -> SdkClient {
        SdkClient::new(
            &server.uri(),
            indexes.iter().map(|s| s.to_string()).collect(),
            HealthCheckerOptions::default(),
        )
        .unwrap()
    }

    async fn mount_green(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/_cluster/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "cluster_name": "testcluster",
                "status": "green"
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_checker_healthy() {
        let server = MockServer::start().await;
        mount_green(&server).await;
        Mock::given(method("HEAD"))
            .and(path("/one"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut state = CheckState::new(SERVICE_NAME);
        client(&server, &["one"]).checker(&mut state).await;

        assert_eq!(state.status(), Some(Severity::Ok));
        assert_eq!(state.message(), MSG_HEALTHY);
        assert_eq!(state.status_code(), 200);
    }

    #[tokio::test]
    async fn test_checker_missing_index() {
        let server = MockServer::start().await;
        mount_green(&server).await;
        Mock::given(method("HEAD"))
            .and(path("/one"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/two"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut state = CheckState::new(SERVICE_NAME);
        client(&server, &["one", "two"]).checker(&mut state).await;

        assert_eq!(state.status(), Some(Severity::Critical));
        assert_eq!(state.message(), MSG_INDEX_DOES_NOT_EXIST);
        assert_eq!(state.status_code(), 404);
    }

    #[tokio::test]
    async fn test_create_index_error_response() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/one"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"error":{"type":"resource_already_exists_exception"}}"#),
            )
            .mount(&server)
            .await;

        let err = client(&server, &[])
            .create_index("one", br#"{"settings":{}}"#)
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), Some(400));
        assert!(err.to_string().contains("resource_already_exists_exception"));
    }

    #[tokio::test]
    async fn test_search_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/one/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"hits":{"hits":[]}}"#))
            .mount(&server)
            .await;

        let body = client(&server, &[])
            .search(&Search::new("one", r#"{"query":{"match_all":{}}}"#))
            .await
            .unwrap();

        assert_eq!(body, br#"{"hits":{"hits":[]}}"#.to_vec());
    }

    #[tokio::test]
    async fn test_multi_search_total_hits_flag() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_msearch"))
            .and(query_param("rest_total_hits_as_int", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"responses":[]}"#))
            .expect(1)
            .mount(&server)
            .await;

        let params = QueryParams {
            enable_total_hits_counter: Some(true),
        };
        client(&server, &[])
            .multi_search(&[Search::new("one", "{}")], Some(&params))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_add_document_invalid_json() {
        let server = MockServer::start().await;
        let err = client(&server, &[])
            .add_document("one", "1", b"not json", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[tokio::test]
    async fn test_bulk_index_requires_indexer() {
        let server = MockServer::start().await;
        let err = client(&server, &[])
            .bulk_index_add(BulkIndexerAction::Index, "one", "1", b"{}", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BulkIndexerNotInitialised));
        assert_eq!(err.status_code(), Some(500));
    }

    #[tokio::test]
    async fn test_bulk_indexer_lifecycle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": false,
                "items": [ { "index": { "_index": "one", "_id": "1", "status": 201 } } ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, &[]);
        let successes = Arc::new(AtomicUsize::new(0));
        let counter = successes.clone();

        client.new_bulk_indexer().await.unwrap();
        client
            .bulk_index_add(
                BulkIndexerAction::Index,
                "one",
                "1",
                br#"{"title":"doc"}"#,
                Some(Arc::new(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                None,
            )
            .await
            .unwrap();
        client.bulk_index_close().await.unwrap();

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            client.bulk_index_close().await,
            Err(Error::BulkIndexerNotInitialised)
        ));
    }

    #[tokio::test]
    async fn test_checker_with_path_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/es/_cluster/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "green" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/es/one"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = SdkClient::new(
            &format!("{}/es", server.uri()),
            vec!["one".to_string()],
            HealthCheckerOptions::default(),
        )
        .unwrap();
        let mut state = CheckState::new(SERVICE_NAME);
        client.checker(&mut state).await;

        assert_eq!(state.status(), Some(Severity::Ok));
        assert_eq!(state.message(), MSG_HEALTHY);
        assert_eq!(state.status_code(), 200);
    }

    #[tokio::test]
    async fn test_empty_index_lists_rejected() {
        let server = MockServer::start().await;
        Mock::given(wiremock::matchers::any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client(&server, &[]);
        assert!(matches!(
            client.delete_indices(&[]).await,
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            client.get_indices(&[]).await,
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_relative_path_strips_address_path() {
        let client = Elasticsearch::default();
        let transport = SdkTransport::new(client, &Url::parse("http://host:9200/es/").unwrap());

        let url = Url::parse("http://host:9200/es/_cluster/health").unwrap();
        assert_eq!(transport.relative_path(&url), "/_cluster/health");

        let other = Url::parse("http://host:9200/escape").unwrap();
        assert_eq!(transport.relative_path(&other), "/escape");
    }

    #[test]
    fn test_ndjson_lines_skips_blank_lines() {
        let lines = ndjson_lines(b"{\"index\":{}}\n{\"a\":1}\n\n").unwrap();
        assert_eq!(lines.len(), 2);
    }
}

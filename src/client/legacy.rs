//! Client that calls the Elasticsearch REST API directly over HTTP.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use tracing::{debug, error, info};
use url::Url;

use super::{
    alias_actions, multiline_searches, AddDocumentOptions, BulkIndexerAction, Count, FailureFn,
    QueryParams, Search, SearchClient, SuccessFn,
};
use crate::errors::Error;
use crate::health::{CheckState, HealthChecker, HealthCheckerOptions, PATH_HEALTH};
use crate::transport::{EsRequest, RetryTransport, Transport};

const CLIENT_NAME: &str = "legacy";
const DEFAULT_DOCUMENT_TYPE: &str = "_doc";

/// Request payload and how it is encoded.
enum Payload<'a> {
    Json(&'a [u8]),
    NdJson(&'a [u8]),
}

/// Elasticsearch client holding an HTTP transport and the cluster address.
pub struct LegacyClient {
    transport: Arc<dyn Transport>,
    url: String,
    checker: HealthChecker,
}

impl LegacyClient {
    /// Client with a default retrying transport. Health calls are never retried.
    pub fn new(url: &str, max_retries: u32, indexes: Vec<String>) -> Result<Self, Error> {
        let retry = Arc::new(RetryTransport::new(max_retries)?);
        Self::disable_health_retries(&retry);
        Ok(Self::with_transport(
            url,
            retry,
            indexes,
            HealthCheckerOptions::default(),
        ))
    }

    pub fn with_transport(
        url: &str,
        transport: Arc<dyn Transport>,
        indexes: Vec<String>,
        options: HealthCheckerOptions,
    ) -> Self {
        let checker = HealthChecker::new(transport.clone(), url, indexes, options);
        Self {
            transport,
            url: url.trim_end_matches('/').to_string(),
            checker,
        }
    }

    /// Add the cluster health path to the transport's no-retry list, keeping the
    /// paths already there.
    pub fn disable_health_retries(transport: &RetryTransport) {
        let mut paths = transport.paths_with_no_retries();
        if !paths.iter().any(|p| p == PATH_HEALTH) {
            paths.push(PATH_HEALTH.to_string());
        }
        transport.set_paths_with_no_retries(paths);
    }

    pub fn health_checker(&self) -> &HealthChecker {
        &self.checker
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.url, path)
    }

    /// Send a request and return the body and status; non-2xx responses are errors.
    async fn call_elastic(
        &self,
        path: &str,
        method: Method,
        payload: Option<Payload<'_>>,
    ) -> Result<(Vec<u8>, u16), Error> {
        let url = Url::parse(path).map_err(|e| {
            error!(url = %path, method = %method, error = %e, "failed to create url for elastic call");
            e
        })?;

        let mut request = EsRequest::new(method.clone(), url);
        match payload {
            Some(Payload::Json(body)) => request = request.with_json_body(body.to_vec()),
            Some(Payload::NdJson(body)) => request = request.with_ndjson_body(body.to_vec()),
            None => {}
        }

        let response = self.transport.execute(request).await.map_err(|e| {
            error!(url = %path, method = %method, error = %e, "failed to call elastic");
            e
        })?;

        let status = response.status;
        if !response.is_success() {
            error!(
                url = %path,
                method = %method,
                http_code = status,
                json_body = %String::from_utf8_lossy(&response.body),
                "failed as unexpected code"
            );
            return Err(Error::UnexpectedStatusCode {
                status_code: status,
            });
        }

        debug!(url = %path, method = %method, http_code = status, "es response with response status code");
        Ok((response.body, status))
    }
}

#[async_trait]
impl SearchClient for LegacyClient {
    async fn add_document(
        &self,
        index: &str,
        document_id: &str,
        document: &[u8],
        options: Option<&AddDocumentOptions>,
    ) -> Result<(), Error> {
        let document_type = options
            .and_then(|o| o.document_type.as_deref())
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_DOCUMENT_TYPE);
        let upsert = options.map(|o| o.upsert).unwrap_or(false);

        let mut path = self.endpoint(&format!("{}/{}/{}", index, document_type, document_id));
        if !upsert {
            path.push_str("?op_type=create");
        }

        let (body, status) = self
            .call_elastic(&path, Method::PUT, Some(Payload::Json(document)))
            .await?;
        if status == 201 || (upsert && status == 200) {
            return Ok(());
        }
        Err(Error::Api {
            context: "add document",
            status_code: status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    async fn bulk_update(&self, index: &str, es_url: &str, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let base = if es_url.is_empty() {
            self.url.as_str()
        } else {
            es_url.trim_end_matches('/')
        };
        let uri = format!("{}/{}/_bulk", base, index);
        let (body, _) = self
            .call_elastic(&uri, Method::POST, Some(Payload::NdJson(payload)))
            .await?;
        Ok(body)
    }

    async fn new_bulk_indexer(&self) -> Result<(), Error> {
        Err(Error::unsupported("new_bulk_indexer", CLIENT_NAME))
    }

    async fn bulk_index_add(
        &self,
        _action: BulkIndexerAction,
        _index: &str,
        _document_id: &str,
        _document: &[u8],
        _on_success: Option<SuccessFn>,
        _on_failure: Option<FailureFn>,
    ) -> Result<(), Error> {
        Err(Error::unsupported("bulk_index_add", CLIENT_NAME))
    }

    async fn bulk_index_close(&self) -> Result<(), Error> {
        Err(Error::unsupported("bulk_index_close", CLIENT_NAME))
    }

    async fn checker(&self, state: &mut CheckState) {
        self.checker.checker(state).await;
    }

    async fn create_index(&self, index: &str, settings: &[u8]) -> Result<(), Error> {
        let path = self.endpoint(index);
        let (body, status) = self
            .call_elastic(&path, Method::PUT, Some(Payload::Json(settings)))
            .await?;
        if status != 200 {
            return Err(Error::Api {
                context: "create index",
                status_code: status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        info!(index, "created index");
        Ok(())
    }

    async fn delete_document(&self, index: &str, document_id: &str) -> Result<(), Error> {
        let path = self.endpoint(&format!("{}/{}/{}", index, DEFAULT_DOCUMENT_TYPE, document_id));
        self.call_elastic(&path, Method::DELETE, None).await?;
        Ok(())
    }

    async fn delete_document_by_query(&self, search: &Search) -> Result<(), Error> {
        let path = self.endpoint(&format!("{}/_delete_by_query", search.header.index));
        self.call_elastic(&path, Method::POST, Some(Payload::Json(&search.query)))
            .await?;
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<(), Error> {
        self.delete_indices(&[index.to_string()]).await
    }

    async fn delete_indices(&self, indices: &[String]) -> Result<(), Error> {
        if indices.is_empty() {
            return Err(Error::InvalidRequest("no indices to delete".to_string()));
        }
        let path = self.endpoint(&indices.join(","));
        self.call_elastic(&path, Method::DELETE, None).await?;
        info!(indices = ?indices, "deleted indices");
        Ok(())
    }

    async fn get_alias(&self) -> Result<Vec<u8>, Error> {
        let (body, _) = self
            .call_elastic(&self.endpoint("_alias"), Method::GET, None)
            .await?;
        Ok(body)
    }

    async fn get_indices(&self, index_patterns: &[String]) -> Result<Vec<u8>, Error> {
        if index_patterns.is_empty() {
            return Err(Error::InvalidRequest("no index patterns given".to_string()));
        }
        let path = self.endpoint(&index_patterns.join(","));
        let (body, _) = self.call_elastic(&path, Method::GET, None).await?;
        Ok(body)
    }

    async fn update_aliases(
        &self,
        alias: &str,
        remove_indices: &[String],
        add_indices: &[String],
    ) -> Result<(), Error> {
        let payload = serde_json::to_vec(&alias_actions(alias, remove_indices, add_indices))?;
        self.call_elastic(&self.endpoint("_aliases"), Method::POST, Some(Payload::Json(&payload)))
            .await?;
        Ok(())
    }

    async fn multi_search(
        &self,
        searches: &[Search],
        params: Option<&QueryParams>,
    ) -> Result<Vec<u8>, Error> {
        let payload = multiline_searches(searches)?;
        let mut path = self.endpoint("_msearch");
        if let Some(flag) = params.and_then(|p| p.enable_total_hits_counter) {
            path.push_str(&format!("?rest_total_hits_as_int={}", flag));
        }
        let (body, _) = self
            .call_elastic(&path, Method::POST, Some(Payload::NdJson(&payload)))
            .await?;
        Ok(body)
    }

    async fn search(&self, search: &Search) -> Result<Vec<u8>, Error> {
        let path = self.endpoint(&format!("{}/_search", search.header.index));
        let (body, _) = self
            .call_elastic(&path, Method::POST, Some(Payload::Json(&search.query)))
            .await?;
        Ok(body)
    }

    async fn count(&self, count: &Count) -> Result<Vec<u8>, Error> {
        let (body, _) = self
            .call_elastic(&self.endpoint("_count"), Method::POST, Some(Payload::Json(&count.query)))
            .await?;
        Ok(body)
    }

    async fn count_indices(&self, indices: &[String]) -> Result<Vec<u8>, Error> {
        let path = self.endpoint(&format!("{}/_count", indices.join(",")));
        let (body, _) = self.call_elastic(&path, Method::GET, None).await?;
        Ok(body)
    }

    async fn explain(&self, document_id: &str, search: &Search) -> Result<Vec<u8>, Error> {
        let path = self.endpoint(&format!("{}/_explain/{}", search.header.index, document_id));
        let (body, _) = self
            .call_elastic(&path, Method::POST, Some(Payload::Json(&search.query)))
            .await?;
        Ok(body)
    }
}

use crate::config::Settings;
use crate::error::IndexError;
use crate::traits::{ChunkPayload, PayloadFilter, PointId, ScoredPoint, VectorIndex};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

const BACKEND: &str = "qdrant";
const SCROLL_PAGE_SIZE: usize = 256;

pub struct QdrantStore {
    endpoint: String,
    chunk_collection: String,
    document_collection: String,
    client: Client,
    vector_size: usize,
    api_key: Option<String>,
}

impl QdrantStore {
    pub fn new(
        endpoint: impl Into<String>,
        chunk_collection: impl Into<String>,
        document_collection: impl Into<String>,
        vector_size: usize,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            chunk_collection: chunk_collection.into(),
            document_collection: document_collection.into(),
            client: Client::new(),
            vector_size,
            api_key: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, IndexError> {
        let endpoint = settings.qdrant_url()?;
        Self::new(
            endpoint.as_str(),
            &settings.chunk_collection,
            &settings.document_collection,
            settings.vector_size,
        )
        .with_api_key(settings.qdrant_api_key.clone())
        .with_timeout(Duration::from_secs(settings.qdrant_timeout_secs))
    }

    /// Bounds every request, so a hung service surfaces as `IndexError::Unavailable`.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, IndexError> {
        self.client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| IndexError::Unavailable(error.to_string()))?;
        Ok(self)
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.trim().is_empty());
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.endpoint, path));
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.vector_size {
            return Err(IndexError::Dimension {
                expected: self.vector_size,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    async fn ensure_collection(&self, collection: &str) -> Result<(), IndexError> {
        let path = format!("/collections/{collection}");
        let response = self.request(Method::GET, &path).send().await?;

        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(status_error(response).await);
        }

        debug!(collection, vector_size = self.vector_size, "creating qdrant collection");
        let response = self
            .request(Method::PUT, &path)
            .json(&json!({
                "vectors": {
                    "size": self.vector_size,
                    "distance": "Cosine",
                }
            }))
            .send()
            .await?;

        // 409 means a concurrent caller created it first.
        if response.status().is_success() || response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        Err(status_error(response).await)
    }

    async fn upsert_point(
        &self,
        collection: &str,
        id: PointId,
        vector: &[f32],
        payload: Value,
    ) -> Result<PointId, IndexError> {
        self.check_dimension(vector)?;

        let response = self
            .request(
                Method::PUT,
                &format!("/collections/{collection}/points?wait=true"),
            )
            .json(&json!({
                "points": [{
                    "id": id,
                    "vector": vector,
                    "payload": payload,
                }]
            }))
            .send()
            .await?;

        ensure_success(response).await?;
        Ok(id)
    }

    async fn delete_points(&self, collection: &str, selector: Value) -> Result<(), IndexError> {
        let response = self
            .request(
                Method::POST,
                &format!("/collections/{collection}/points/delete?wait=true"),
            )
            .json(&selector)
            .send()
            .await?;

        // A missing collection holds no points, so there is nothing left to delete.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(response).await?;
        Ok(())
    }
}

fn filter_json(filter: &PayloadFilter) -> Value {
    let must = filter
        .must
        .iter()
        .map(|(key, value)| json!({ "key": key, "match": { "value": value } }))
        .collect::<Vec<_>>();
    json!({ "must": must })
}

async fn status_error(response: Response) -> IndexError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        IndexError::Unavailable(format!("{BACKEND} returned {status}: {body}"))
    } else {
        IndexError::BackendResponse {
            backend: BACKEND.to_string(),
            details: format!("{status}: {body}"),
        }
    }
}

async fn ensure_success(response: Response) -> Result<Response, IndexError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(status_error(response).await)
    }
}

fn malformed(details: impl Into<String>) -> IndexError {
    IndexError::BackendResponse {
        backend: BACKEND.to_string(),
        details: details.into(),
    }
}

fn parse_vector(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|item| item.as_f64().map(|number| number as f32))
        .collect()
}

#[async_trait]
impl VectorIndex for QdrantStore {
    async fn ensure_collections(&self) -> Result<(), IndexError> {
        self.ensure_collection(&self.chunk_collection).await?;
        self.ensure_collection(&self.document_collection).await
    }

    async fn upsert_chunk_vector(
        &self,
        chunk_id: u64,
        vector: &[f32],
        payload: &ChunkPayload,
    ) -> Result<PointId, IndexError> {
        self.upsert_point(
            &self.chunk_collection,
            chunk_id,
            vector,
            Value::Object(payload.to_map()),
        )
        .await
    }

    async fn upsert_document_vector(
        &self,
        document_id: u64,
        title: &str,
        mean_vector: &[f32],
    ) -> Result<PointId, IndexError> {
        self.upsert_point(
            &self.document_collection,
            document_id,
            mean_vector,
            json!({ "title": title }),
        )
        .await
    }

    async fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<ScoredPoint>, IndexError> {
        self.check_dimension(query_vector)?;

        let mut body = json!({
            "vector": query_vector,
            "limit": top_k,
            "with_payload": true,
        });
        if !filter.is_empty() {
            body["filter"] = filter_json(filter);
        }

        let response = self
            .request(
                Method::POST,
                &format!("/collections/{}/points/search", self.chunk_collection),
            )
            .json(&body)
            .send()
            .await?;

        // Nothing has been indexed yet.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let parsed: Value = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|error| malformed(error.to_string()))?;

        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .ok_or_else(|| malformed("search response has no result array"))?;

        let mut result = Vec::with_capacity(hits.len());
        for hit in hits {
            let id = hit
                .pointer("/id")
                .and_then(Value::as_u64)
                .ok_or_else(|| malformed(format!("search hit has no numeric id: {hit}")))?;
            let score = hit
                .pointer("/score")
                .and_then(Value::as_f64)
                .ok_or_else(|| malformed(format!("search hit {id} has no score")))?;
            let payload = hit
                .pointer("/payload")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_else(Map::new);

            result.push(ScoredPoint { id, score, payload });
        }

        result.sort_by(|left, right| right.score.total_cmp(&left.score));
        Ok(result)
    }

    async fn delete_by_document(&self, document_id: u64) -> Result<(), IndexError> {
        let filter = PayloadFilter::new().must_match("document_id", document_id);
        self.delete_points(
            &self.chunk_collection,
            json!({ "filter": filter_json(&filter) }),
        )
        .await
    }

    async fn delete_document_vector(&self, document_id: u64) -> Result<(), IndexError> {
        self.delete_points(
            &self.document_collection,
            json!({ "points": [document_id] }),
        )
        .await
    }

    async fn scroll_vectors_for_document(
        &self,
        document_id: u64,
    ) -> Result<Vec<Vec<f32>>, IndexError> {
        let filter = PayloadFilter::new().must_match("document_id", document_id);
        let mut vectors = Vec::new();
        let mut offset: Option<Value> = None;

        loop {
            let mut body = json!({
                "filter": filter_json(&filter),
                "limit": SCROLL_PAGE_SIZE,
                "with_payload": false,
                "with_vector": true,
            });
            if let Some(cursor) = &offset {
                body["offset"] = cursor.clone();
            }

            let response = self
                .request(
                    Method::POST,
                    &format!("/collections/{}/points/scroll", self.chunk_collection),
                )
                .json(&body)
                .send()
                .await?;

            if response.status() == StatusCode::NOT_FOUND {
                return Ok(vectors);
            }
            let parsed: Value = ensure_success(response)
                .await?
                .json()
                .await
                .map_err(|error| malformed(error.to_string()))?;

            let points = parsed
                .pointer("/result/points")
                .and_then(Value::as_array)
                .ok_or_else(|| malformed("scroll response has no points array"))?;
            for point in points {
                let vector = point
                    .pointer("/vector")
                    .and_then(parse_vector)
                    .ok_or_else(|| malformed(format!("scrolled point has no vector: {point}")))?;
                vectors.push(vector);
            }

            let next = parsed
                .pointer("/result/next_page_offset")
                .filter(|value| !value.is_null())
                .cloned();
            match next {
                None => break,
                Some(cursor) if offset.as_ref() == Some(&cursor) => {
                    return Err(malformed(format!("scroll cursor did not advance past {cursor}")));
                }
                Some(cursor) => offset = Some(cursor),
            }
        }

        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> QdrantStore {
        QdrantStore::new(server.uri(), "chunks", "documents", 3)
    }

    fn payload() -> ChunkPayload {
        ChunkPayload {
            owner_id: 7,
            document_id: 11,
            chunk_id: 42,
            title: "Pump manual".to_string(),
        }
    }

    #[tokio::test]
    async fn ensure_collections_only_creates_missing_collections() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/chunks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": {} })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/collections/documents"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/collections/chunks"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/collections/documents"))
            .and(body_partial_json(json!({ "vectors": { "size": 3, "distance": "Cosine" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": true })))
            .expect(1)
            .mount(&server)
            .await;

        store(&server).ensure_collections().await.expect("collections ensured");
    }

    #[tokio::test]
    async fn concurrent_creation_conflict_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        store(&server).ensure_collections().await.expect("conflict tolerated");
    }

    #[tokio::test]
    async fn upsert_sends_api_key_and_returns_point_id() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/collections/chunks/points"))
            .and(header("api-key", "secret"))
            .and(body_partial_json(json!({
                "points": [{ "id": 42, "payload": { "owner_id": 7, "document_id": 11 } }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "ok" })))
            .expect(1)
            .mount(&server)
            .await;

        let store = store(&server).with_api_key(Some("secret".to_string()));
        let id = store
            .upsert_chunk_vector(42, &[0.1, 0.2, 0.3], &payload())
            .await
            .expect("upsert succeeds");
        assert_eq!(id, 42);
    }

    #[tokio::test]
    async fn upsert_server_error_is_unavailable_not_a_fake_id() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = store(&server)
            .upsert_chunk_vector(42, &[0.1, 0.2, 0.3], &payload())
            .await;
        assert!(matches!(result, Err(IndexError::Unavailable(_))));
    }

    #[tokio::test]
    async fn upsert_rejects_wrong_dimension() {
        let server = MockServer::start().await;
        let result = store(&server)
            .upsert_document_vector(1, "doc", &[0.1, 0.2])
            .await;
        assert!(matches!(
            result,
            Err(IndexError::Dimension {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[tokio::test]
    async fn unreachable_service_is_unavailable() {
        let store = QdrantStore::new("http://127.0.0.1:1", "chunks", "documents", 3);
        let result = store.ensure_collections().await;
        assert!(matches!(result, Err(IndexError::Unavailable(_))));
    }

    #[tokio::test]
    async fn search_sends_owner_filter_and_orders_by_score() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/chunks/points/search"))
            .and(body_partial_json(json!({
                "limit": 5,
                "filter": { "must": [{ "key": "owner_id", "match": { "value": 7 } }] }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [
                    { "id": 2, "score": 0.4, "payload": { "chunk_id": 2 } },
                    { "id": 1, "score": 0.9, "payload": { "chunk_id": 1 } }
                ]
            })))
            .mount(&server)
            .await;

        let filter = PayloadFilter::new().must_match("owner_id", 7);
        let hits = store(&server)
            .search(&[0.1, 0.2, 0.3], 5, &filter)
            .await
            .expect("search succeeds");

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, 1);
        assert_eq!(hits[0].payload_u64("chunk_id"), Some(1));
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn search_before_any_collection_exists_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/chunks/points/search"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let hits = store(&server)
            .search(&[1.0, 0.0, 0.0], 5, &PayloadFilter::new())
            .await
            .expect("missing collection has no hits");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn delete_on_missing_collection_is_a_noop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/chunks/points/delete"))
            .and(body_partial_json(json!({
                "filter": { "must": [{ "key": "document_id", "match": { "value": 11 } }] }
            })))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        store(&server)
            .delete_by_document(11)
            .await
            .expect("delete is idempotent");
    }

    #[tokio::test]
    async fn delete_document_vector_targets_the_document_point() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/documents/points/delete"))
            .and(body_partial_json(json!({ "points": [11] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": { "operation_id": 3, "status": "completed" }
            })))
            .expect(2)
            .mount(&server)
            .await;

        let store = store(&server);
        store.delete_document_vector(11).await.expect("delete");
        store.delete_document_vector(11).await.expect("second delete");
    }

    #[tokio::test]
    async fn delete_document_vector_reports_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/documents/points/delete"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = store(&server).delete_document_vector(11).await;
        assert!(matches!(result, Err(IndexError::Unavailable(_))));
    }

    #[tokio::test]
    async fn hung_service_times_out_as_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/collections/chunks/points"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let store = store(&server)
            .with_timeout(Duration::from_millis(100))
            .expect("client builds");
        let result = store.upsert_chunk_vector(42, &[0.1, 0.2, 0.3], &payload()).await;
        assert!(matches!(result, Err(IndexError::Unavailable(_))));
    }

    #[tokio::test]
    async fn scroll_follows_cursor_until_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/chunks/points/scroll"))
            .and(body_partial_json(json!({ "offset": 2 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "points": [{ "id": 2, "vector": [0.0, 1.0, 0.0] }],
                    "next_page_offset": null
                }
            })))
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/collections/chunks/points/scroll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "points": [{ "id": 1, "vector": [1.0, 0.0, 0.0] }],
                    "next_page_offset": 2
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let vectors = store(&server)
            .scroll_vectors_for_document(11)
            .await
            .expect("scroll succeeds");

        assert_eq!(vectors, vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]);
    }

    #[tokio::test]
    async fn scroll_with_stalled_cursor_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/chunks/points/scroll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "points": [{ "id": 1, "vector": [1.0, 0.0, 0.0] }],
                    "next_page_offset": 5
                }
            })))
            .expect(2)
            .mount(&server)
            .await;

        let result = store(&server).scroll_vectors_for_document(11).await;
        assert!(matches!(
            result,
            Err(IndexError::BackendResponse { ref details, .. }) if details.contains("did not advance")
        ));
    }
}

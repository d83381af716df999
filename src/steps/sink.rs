//! Curation sink: forwards records to an Argilla annotation server.
//!
//! Epistemic foundation:
//! - K_i: Argilla's REST API authenticates with the `X-Argilla-Api-Key` header
//! - K_i: Datasets are created as drafts, receive fields/questions, then publish
//! - B_i: The dataset may already exist → reuse it
//! - I^B: Server availability unknowable → errors surface as `CurationError`

use crate::models::{CurationError, PipelineError, Record, Result, SinkConfig, fields};
use crate::steps::{MAX_RATING, MIN_RATING, Step};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

const API_KEY_HEADER: &str = "X-Argilla-Api-Key";

#[derive(Debug, Deserialize)]
struct Items<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Workspace {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DatasetInfo {
    id: String,
    name: String,
    #[serde(default)]
    workspace_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuestionInfo {
    id: String,
    name: String,
}

/// Resolved remote dataset.
#[derive(Debug, Clone)]
pub struct DatasetHandle {
    pub id: String,
    /// Question name -> question id
    pub question_ids: HashMap<String, String>,
}

/// Field and question definitions for `n` generations.
pub fn dataset_settings(n: usize) -> (Vec<Value>, Vec<Value>) {
    let mut field_defs = vec![text_field(fields::INSTRUCTION, "Instruction")];
    let mut questions = Vec::with_capacity(n * 2);

    for i in 1..=n {
        field_defs.push(text_field(&format!("generation-{i}"), &format!("Generation {i}")));

        let options: Vec<Value> = (MIN_RATING..=MAX_RATING)
            .map(|v| json!({ "value": v }))
            .collect();
        questions.push(json!({
            "name": format!("rating-{i}"),
            "title": format!("Rate generation {i} from {MIN_RATING} to {MAX_RATING}"),
            "required": true,
            "settings": { "type": "rating", "options": options },
        }));
        questions.push(json!({
            "name": format!("rationale-{i}"),
            "title": format!("Rationale for generation {i}"),
            "required": false,
            "settings": { "type": "text", "use_markdown": false },
        }));
    }
    (field_defs, questions)
}

fn text_field(name: &str, title: &str) -> Value {
    json!({
        "name": name,
        "title": title,
        "required": true,
        "settings": { "type": "text", "use_markdown": false },
    })
}

/// Build a bulk-upload item for one record.
///
/// Ratings and rationales become suggestions attributed to `model_name`.
/// Suggestions for questions without a known id are skipped.
pub fn record_payload(record: &Record, question_ids: &HashMap<String, String>) -> Value {
    let mut record_fields = serde_json::Map::new();
    if let Some(instruction) = record.get_str(fields::INSTRUCTION) {
        record_fields.insert(fields::INSTRUCTION.to_string(), instruction.into());
    }
    let generations = record.get_str_array(fields::GENERATIONS).unwrap_or_default();
    for (i, text) in generations.iter().enumerate() {
        record_fields.insert(format!("generation-{}", i + 1), (*text).into());
    }

    let agent = record.get_str(fields::MODEL_NAME);
    let column = |key: &str| -> Vec<Value> {
        record
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };
    let ratings = column(fields::RATINGS);
    let rationales = column(fields::RATIONALES);

    let mut suggestions = Vec::new();
    for i in 0..generations.len() {
        let candidates = [
            (format!("rating-{}", i + 1), ratings.get(i)),
            (format!("rationale-{}", i + 1), rationales.get(i)),
        ];
        for (question, value) in candidates {
            let Some(value) = value.filter(|v| !v.is_null()) else {
                continue;
            };
            let Some(question_id) = question_ids.get(&question) else {
                continue;
            };
            let mut suggestion = json!({ "question_id": question_id, "value": value });
            if let Some(agent) = agent {
                suggestion["agent"] = agent.into();
            }
            suggestions.push(suggestion);
        }
    }

    let mut metadata = serde_json::Map::new();
    if let Some(order) = record.get_str_array(fields::ORDER) {
        metadata.insert("order".to_string(), order.join(",").into());
    }

    json!({
        "external_id": Uuid::new_v4().to_string(),
        "fields": record_fields,
        "metadata": metadata,
        "suggestions": suggestions,
    })
}

/// Step that uploads each batch to an Argilla dataset and passes it through.
pub struct ArgillaSink {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    dataset_name: String,
    workspace: String,
    batch_size: usize,
    timeout: Duration,
    dataset: OnceCell<DatasetHandle>,
    forwarded: AtomicUsize,
}

impl ArgillaSink {
    /// Create a sink with an already-resolved API key.
    pub fn new(config: &SinkConfig, api_key: String) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(PipelineError::Network)?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            dataset_name: config.dataset_name.clone(),
            workspace: config.workspace.clone(),
            batch_size: config.batch_size.max(1),
            timeout,
            dataset: OnceCell::new(),
            forwarded: AtomicUsize::new(0),
        })
    }

    /// Create a sink, resolving the API key from config or environment.
    pub fn from_config(config: &SinkConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        Self::new(config, api_key)
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Records uploaded so far.
    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Check the server is reachable and the key is accepted.
    pub async fn health_check(&self) -> Result<()> {
        self.send(Method::GET, "/api/v1/me", None).await.map(|_| ())
    }

    /// Send a request; returns status and parsed body (null when empty).
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, Value)> {
        let mut request = self
            .client
            .request(method, format!("{}{path}", self.api_url))
            .header(API_KEY_HEADER, &self.api_key);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::Timeout(self.timeout)
            } else {
                PipelineError::Network(e)
            }
        })?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let value = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CurationError::Authentication {
                api_url: self.api_url.clone(),
            }
            .into());
        }
        Ok((status, value))
    }

    /// Like `request`, but any non-success status is an error.
    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let (status, value) = self.request(method, path, body).await?;
        if !status.is_success() {
            return Err(api_error(path, status, &value));
        }
        Ok(value)
    }

    async fn workspace_id(&self) -> Result<String> {
        let value = self.send(Method::GET, "/api/v1/me/workspaces", None).await?;
        let workspaces: Items<Workspace> = parse_body("/api/v1/me/workspaces", value)?;
        workspaces
            .items
            .into_iter()
            .find(|w| w.name == self.workspace)
            .map(|w| w.id)
            .ok_or_else(|| CurationError::WorkspaceNotFound(self.workspace.clone()).into())
    }

    /// Create the dataset, or find the existing one with the same name.
    async fn create_or_find_dataset(&self, workspace_id: &str) -> Result<DatasetInfo> {
        let body = json!({
            "name": self.dataset_name,
            "workspace_id": workspace_id,
            "allow_extra_metadata": true,
        });
        let (status, value) = self
            .request(Method::POST, "/api/v1/datasets", Some(&body))
            .await?;

        if status.is_success() {
            return parse_body("/api/v1/datasets", value);
        }
        if status != StatusCode::CONFLICT {
            return Err(api_error("/api/v1/datasets", status, &value));
        }

        debug!(dataset = %self.dataset_name, "Dataset exists, reusing it");
        let value = self.send(Method::GET, "/api/v1/me/datasets", None).await?;
        let datasets: Items<DatasetInfo> = parse_body("/api/v1/me/datasets", value)?;
        datasets
            .items
            .into_iter()
            .find(|d| {
                d.name == self.dataset_name && d.workspace_id.as_deref() == Some(workspace_id)
            })
            .ok_or_else(|| CurationError::DatasetNotResolved(self.dataset_name.clone()).into())
    }

    /// POST a definition, tolerating "already exists".
    async fn declare(&self, path: &str, body: &Value) -> Result<()> {
        let (status, value) = self.request(Method::POST, path, Some(body)).await?;
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                debug!(path, "Definition already present");
                Ok(())
            }
            s => Err(api_error(path, s, &value)),
        }
    }

    /// Resolve workspace and dataset, declaring its schema on first use.
    async fn ensure_dataset(&self, generations: usize) -> Result<DatasetHandle> {
        let workspace_id = self.workspace_id().await?;
        let dataset = self.create_or_find_dataset(&workspace_id).await?;
        let id = dataset.id;

        if dataset.status.as_deref() != Some("ready") {
            let (field_defs, question_defs) = dataset_settings(generations);
            for field in &field_defs {
                self.declare(&format!("/api/v1/datasets/{id}/fields"), field)
                    .await?;
            }
            for question in &question_defs {
                self.declare(&format!("/api/v1/datasets/{id}/questions"), question)
                    .await?;
            }
            self.send(Method::PUT, &format!("/api/v1/datasets/{id}/publish"), None)
                .await?;
            info!(dataset = %self.dataset_name, dataset_id = %id, "Published curation dataset");
        }

        let path = format!("/api/v1/datasets/{id}/questions");
        let value = self.send(Method::GET, &path, None).await?;
        let questions: Items<QuestionInfo> = parse_body(&path, value)?;

        Ok(DatasetHandle {
            id,
            question_ids: questions.items.into_iter().map(|q| (q.name, q.id)).collect(),
        })
    }

    /// Upload records in chunks of the configured size.
    pub async fn upload(&self, records: &[Record]) -> Result<usize> {
        let Some(first) = records.first() else {
            return Ok(0);
        };
        let generations = first
            .get_str_array(fields::GENERATIONS)
            .map_or(0, |g| g.len());
        let dataset = self
            .dataset
            .get_or_try_init(|| self.ensure_dataset(generations))
            .await?;

        let path = format!("/api/v1/datasets/{}/records/bulk", dataset.id);
        for chunk in records.chunks(self.batch_size) {
            let items: Vec<Value> = chunk
                .iter()
                .map(|r| record_payload(r, &dataset.question_ids))
                .collect();
            self.send(Method::POST, &path, Some(&json!({ "items": items })))
                .await?;
            self.forwarded.fetch_add(chunk.len(), Ordering::Relaxed);
            debug!(records = chunk.len(), dataset = %self.dataset_name, "Uploaded records");
        }
        Ok(records.len())
    }
}

fn api_error(endpoint: &str, status: StatusCode, body: &Value) -> PipelineError {
    let message = body
        .get("detail")
        .map(|d| d.to_string())
        .unwrap_or_else(|| body.to_string());
    CurationError::Api {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        message,
    }
    .into()
}

fn parse_body<T: serde::de::DeserializeOwned>(endpoint: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| PipelineError::ParseError(format!("unexpected response from {endpoint}: {e}")))
}

#[async_trait]
impl Step for ArgillaSink {
    fn name(&self) -> &str {
        "to_argilla"
    }

    fn inputs(&self) -> Vec<String> {
        vec![
            fields::INSTRUCTION.to_string(),
            fields::GENERATIONS.to_string(),
        ]
    }

    fn outputs(&self) -> Vec<String> {
        Vec::new()
    }

    async fn process(&self, batch: Vec<Record>, _offset: usize) -> Result<Vec<Record>> {
        self.upload(&batch).await?;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server::{StubResponse, StubServer};

    fn sink_config(api_url: &str, batch_size: usize) -> SinkConfig {
        SinkConfig {
            dataset_name: "prefs".to_string(),
            workspace: "argilla".to_string(),
            api_url: api_url.to_string(),
            api_key: Some("secret".to_string()),
            api_key_env: "ARGILLA_API_KEY".to_string(),
            batch_size,
            timeout_secs: 5,
        }
    }

    fn stub_sink(server: &StubServer, batch_size: usize) -> ArgillaSink {
        ArgillaSink::from_config(&sink_config(server.url(), batch_size)).unwrap()
    }

    fn workspaces(server: &StubServer) {
        server.route(
            "GET",
            "/api/v1/me/workspaces",
            StubResponse::json(
                200,
                json!({"items": [
                    {"id": "ws-other", "name": "other"},
                    {"id": "ws-1", "name": "argilla"}
                ]}),
            ),
        );
    }

    fn questions(server: &StubServer, dataset_id: &str) {
        let items: Vec<Value> = ["rating-1", "rationale-1", "rating-2", "rationale-2"]
            .iter()
            .map(|name| json!({"id": format!("q-{name}"), "name": name}))
            .collect();
        server.route(
            "GET",
            &format!("/api/v1/datasets/{dataset_id}/questions"),
            StubResponse::json(200, json!({ "items": items })),
        );
    }

    fn scored() -> Record {
        Record::try_from(json!({
            "instruction": "What is the capital of Spain?",
            "generations": ["Barcelona", "Madrid"],
            "order": ["rejected", "chosen"],
            "ratings": [1, null],
            "rationales": ["Wrong city.", "Correct."],
            "model_name": "meta-llama/Meta-Llama-3.1-70B-Instruct",
        }))
        .unwrap()
    }

    fn question_ids() -> HashMap<String, String> {
        ["rating-1", "rating-2", "rationale-1", "rationale-2"]
            .iter()
            .map(|name| (name.to_string(), format!("id-{name}")))
            .collect()
    }

    #[test]
    fn test_settings_for_pair() {
        let (fields, questions) = dataset_settings(2);
        let names = |defs: &[Value]| -> Vec<String> {
            defs.iter()
                .map(|d| d["name"].as_str().unwrap().to_string())
                .collect()
        };
        assert_eq!(names(&fields), vec!["instruction", "generation-1", "generation-2"]);
        assert_eq!(
            names(&questions),
            vec!["rating-1", "rationale-1", "rating-2", "rationale-2"]
        );
        assert_eq!(questions[0]["settings"]["options"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn test_record_payload_fields_and_suggestions() {
        let payload = record_payload(&scored(), &question_ids());

        assert_eq!(
            payload["fields"],
            json!({
                "instruction": "What is the capital of Spain?",
                "generation-1": "Barcelona",
                "generation-2": "Madrid",
            })
        );
        assert_eq!(payload["metadata"]["order"], "rejected,chosen");

        let suggestions = payload["suggestions"].as_array().unwrap();
        // rating-2 is null and is skipped.
        assert_eq!(suggestions.len(), 3);
        assert_eq!(suggestions[0]["question_id"], "id-rating-1");
        assert_eq!(suggestions[0]["value"], 1);
        assert_eq!(
            suggestions[0]["agent"],
            "meta-llama/Meta-Llama-3.1-70B-Instruct"
        );
        assert!(Uuid::parse_str(payload["external_id"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_record_payload_without_scores() {
        let mut record = scored();
        record.remove("ratings");
        record.remove("rationales");
        let payload = record_payload(&record, &HashMap::new());
        assert!(payload["suggestions"].as_array().unwrap().is_empty());
        assert_eq!(payload["fields"]["generation-2"], "Madrid");
    }

    #[test]
    fn test_api_error_uses_detail() {
        let err = api_error(
            "/api/v1/datasets",
            StatusCode::BAD_REQUEST,
            &json!({"detail": "bad name"}),
        );
        assert!(err.to_string().contains("bad name"), "{err}");
    }

    #[tokio::test]
    async fn test_upload_declares_publishes_and_chunks() {
        let server = StubServer::start().await;
        workspaces(&server);
        server
            .route(
                "POST",
                "/api/v1/datasets",
                StubResponse::json(
                    201,
                    json!({"id": "ds-1", "name": "prefs", "workspace_id": "ws-1", "status": "draft"}),
                ),
            )
            .route("POST", "/api/v1/datasets/ds-1/fields", StubResponse::json(201, json!({})))
            .route(
                "POST",
                "/api/v1/datasets/ds-1/fields",
                StubResponse::json(422, json!({"detail": "field exists"})),
            )
            .route(
                "POST",
                "/api/v1/datasets/ds-1/questions",
                StubResponse::json(409, json!({"detail": "question exists"})),
            )
            .route("PUT", "/api/v1/datasets/ds-1/publish", StubResponse::json(200, json!({})))
            .route(
                "POST",
                "/api/v1/datasets/ds-1/records/bulk",
                StubResponse::json(200, json!({"items": []})),
            );
        questions(&server, "ds-1");

        let sink = stub_sink(&server, 2);
        let batch = vec![scored(), scored(), scored()];
        assert_eq!(sink.upload(&batch).await.unwrap(), 3);
        assert_eq!(sink.upload(&batch[..1]).await.unwrap(), 1);
        assert_eq!(sink.forwarded(), 4);

        let create = server.hits("POST", "/api/v1/datasets");
        assert_eq!(create.len(), 1);
        assert_eq!(create[0].headers["x-argilla-api-key"], "secret");
        assert_eq!(create[0].json()["workspace_id"], "ws-1");
        assert_eq!(server.hits("GET", "/api/v1/me/workspaces").len(), 1);
        assert_eq!(server.hits("POST", "/api/v1/datasets/ds-1/fields").len(), 3);
        assert_eq!(server.hits("POST", "/api/v1/datasets/ds-1/questions").len(), 4);
        assert_eq!(server.hits("PUT", "/api/v1/datasets/ds-1/publish").len(), 1);

        let uploads = server.hits("POST", "/api/v1/datasets/ds-1/records/bulk");
        let sizes: Vec<usize> = uploads
            .iter()
            .map(|r| r.json()["items"].as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![2, 1, 1]);
        let first = &uploads[0].json()["items"][0];
        assert_eq!(first["fields"]["generation-2"], "Madrid");
        assert_eq!(first["suggestions"][0]["question_id"], "q-rating-1");
    }

    #[tokio::test]
    async fn test_existing_ready_dataset_is_reused() {
        let server = StubServer::start().await;
        workspaces(&server);
        server
            .route(
                "POST",
                "/api/v1/datasets",
                StubResponse::json(409, json!({"detail": "already exists"})),
            )
            .route(
                "GET",
                "/api/v1/me/datasets",
                StubResponse::json(
                    200,
                    json!({"items": [
                        {"id": "ds-elsewhere", "name": "prefs", "workspace_id": "ws-other", "status": "ready"},
                        {"id": "ds-9", "name": "prefs", "workspace_id": "ws-1", "status": "ready"}
                    ]}),
                ),
            )
            .route(
                "POST",
                "/api/v1/datasets/ds-9/records/bulk",
                StubResponse::json(200, json!({"items": []})),
            );
        questions(&server, "ds-9");

        let sink = stub_sink(&server, 10);
        sink.upload(&[scored()]).await.unwrap();

        assert_eq!(server.hits("POST", "/api/v1/datasets/ds-9/records/bulk").len(), 1);
        assert!(server.hits("POST", "/api/v1/datasets/ds-9/fields").is_empty());
        assert!(server.hits("PUT", "/api/v1/datasets/ds-9/publish").is_empty());
    }

    #[tokio::test]
    async fn test_rejected_key_is_authentication_error() {
        let server = StubServer::start().await;
        server.route(
            "GET",
            "/api/v1/me/workspaces",
            StubResponse::json(401, json!({"detail": "invalid key"})),
        );
        server.route("GET", "/api/v1/me", StubResponse::json(401, json!({})));

        let sink = stub_sink(&server, 10);
        let err = sink.upload(&[scored()]).await.unwrap_err();
        assert!(
            matches!(err, PipelineError::Curation(CurationError::Authentication { .. })),
            "{err:?}"
        );
        assert!(sink.health_check().await.is_err());
        assert_eq!(sink.forwarded(), 0);
    }

    #[tokio::test]
    async fn test_unknown_workspace_and_failed_declaration() {
        let server = StubServer::start().await;
        server.route(
            "GET",
            "/api/v1/me/workspaces",
            StubResponse::json(200, json!({"items": [{"id": "ws-other", "name": "other"}]})),
        );
        let err = stub_sink(&server, 10).upload(&[scored()]).await.unwrap_err();
        assert!(
            matches!(&err, PipelineError::Curation(CurationError::WorkspaceNotFound(w)) if w == "argilla"),
            "{err:?}"
        );

        let server = StubServer::start().await;
        workspaces(&server);
        server
            .route(
                "POST",
                "/api/v1/datasets",
                StubResponse::json(201, json!({"id": "ds-1", "name": "prefs", "workspace_id": "ws-1"})),
            )
            .route(
                "POST",
                "/api/v1/datasets/ds-1/fields",
                StubResponse::json(500, json!({"detail": "boom"})),
            );
        let err = stub_sink(&server, 10).upload(&[scored()]).await.unwrap_err();
        match err {
            PipelineError::Curation(CurationError::Api { status, message, .. }) => {
                assert_eq!(status, 500);
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_health_check_pings_me() {
        let server = StubServer::start().await;
        server.route("GET", "/api/v1/me", StubResponse::json(200, json!({"username": "argilla"})));
        stub_sink(&server, 10).health_check().await.unwrap();
        assert_eq!(server.hits("GET", "/api/v1/me").len(), 1);
    }

    #[tokio::test]
    async fn test_upload_of_empty_batch_is_noop() {
        let sink = ArgillaSink::from_config(&sink_config("http://127.0.0.1:9/", 10)).unwrap();
        assert_eq!(sink.api_url(), "http://127.0.0.1:9");
        assert_eq!(sink.upload(&[]).await.unwrap(), 0);
        assert_eq!(sink.forwarded(), 0);
    }
}

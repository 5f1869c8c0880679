// Control plane REST client
// Owns transport, bearer injection and envelope decoding for the dashboard engine

use crate::aggregate;
use crate::bulk::{ActionLabels, RemoteAction};
use crate::config::ControlPlaneConfig;
use crate::errors::ClientError;
use crate::live_view::Fetcher;
use crate::models::{ActionResultWire, Execution, HealthReport, Job, RemoteOutcome};
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Supplies the bearer credential for each request.
///
/// Session handling lives outside the engine; implementations only hand
/// over whatever token is current.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Credential fixed at startup, typically from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn bearer_token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// HTTP client for the job control plane
#[derive(Clone)]
pub struct ControlPlaneClient {
    http: Client,
    base_url: String,
    timeout: Duration,
    credentials: Arc<dyn CredentialProvider>,
}

impl ControlPlaneClient {
    pub fn new(
        config: &ControlPlaneConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ClientError> {
        let timeout = config.request_timeout();
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout,
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.http.request(method, self.url(path));
        match self.credentials.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn classify(&self, err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout(self.timeout)
        } else {
            ClientError::from(err)
        }
    }

    /// Send a request and return the parsed JSON body of a 2xx response
    async fn send(&self, endpoint: &'static str, request: RequestBuilder) -> Result<Value, ClientError> {
        let started = Instant::now();
        let response = request.send().await;
        telemetry::record_remote_request(endpoint, started.elapsed().as_secs_f64());
        let response = response.map_err(|e| self.classify(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.classify(e))?;
        debug!(endpoint = endpoint, status = status.as_u16(), "Control plane response");

        if status == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized(error_detail(&body)));
        }
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body: error_detail(&body),
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn get_list<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        path: &str,
    ) -> Result<Vec<T>, ClientError> {
        let body = self.send(endpoint, self.request(Method::GET, path)).await?;
        decode_list(endpoint, body)
    }

    #[instrument(skip(self))]
    pub async fn list_jobs(&self) -> Result<Vec<Job>, ClientError> {
        self.get_list("list_jobs", "jobs").await
    }

    /// Executions of a job, each with its nested branches re-derived locally
    #[instrument(skip(self))]
    pub async fn list_executions(&self, job_id: i64) -> Result<Vec<Execution>, ClientError> {
        let executions: Vec<Execution> = self
            .get_list("list_executions", &format!("jobs/{}/executions", job_id))
            .await?;
        Ok(executions
            .iter()
            .map(aggregate::normalize_execution)
            .collect())
    }

    /// Flat action results of one execution, as returned by the server
    #[instrument(skip(self))]
    pub async fn list_action_results(
        &self,
        job_id: i64,
        execution_number: u64,
    ) -> Result<Vec<ActionResultWire>, ClientError> {
        self.get_list(
            "list_action_results",
            &format!("jobs/{}/executions/{}/results", job_id, execution_number),
        )
        .await
    }

    /// Start an execution; no target list means all of the job's targets
    #[instrument(skip(self))]
    pub async fn execute_job(
        &self,
        job_id: i64,
        target_ids: Option<&[String]>,
    ) -> Result<Value, ClientError> {
        let body = match target_ids {
            Some(ids) => json!({ "target_ids": ids }),
            None => json!({}),
        };
        let request = self
            .request(Method::POST, &format!("jobs/{}/execute", job_id))
            .json(&body);
        self.send("execute_job", request).await.map(envelope_data)
    }

    #[instrument(skip(self))]
    pub async fn schedule_job(
        &self,
        job_id: i64,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Value, ClientError> {
        let request = self
            .request(Method::POST, &format!("jobs/{}/schedule", job_id))
            .json(&json!({ "scheduled_at": scheduled_at.to_rfc3339() }));
        self.send("schedule_job", request).await.map(envelope_data)
    }

    /// Force-terminate one job by its identifier
    #[instrument(skip(self))]
    pub async fn terminate_job(
        &self,
        identifier: &str,
        reason: &str,
    ) -> Result<RemoteOutcome, ClientError> {
        let body = if reason.trim().is_empty() {
            json!({})
        } else {
            json!({ "reason": reason })
        };
        let request = self
            .request(
                Method::POST,
                &format!("jobs/safety/terminate/{}", identifier),
            )
            .json(&body);
        let body = self.send("terminate_job", request).await?;
        Ok(serde_json::from_value(body)?)
    }

    #[instrument(skip(self))]
    pub async fn cleanup_stale(&self) -> Result<RemoteOutcome, ClientError> {
        let request = self.request(Method::POST, "jobs/safety/cleanup-stale");
        let body = self.send("cleanup_stale", request).await?;
        Ok(serde_json::from_value(body)?)
    }

    #[instrument(skip(self))]
    pub async fn safety_health(&self) -> Result<HealthReport, ClientError> {
        let body = self
            .send("safety_health", self.request(Method::GET, "jobs/safety/health"))
            .await?;
        Ok(serde_json::from_value(envelope_data(body))?)
    }
}

/// Strip a `{ "data": ... }` envelope when present
fn envelope_data(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("data") && !map.contains_key("success") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Decode a list body record by record, skipping malformed records
fn decode_list<T: DeserializeOwned>(endpoint: &str, body: Value) -> Result<Vec<T>, ClientError> {
    let records = match envelope_data(body) {
        Value::Array(records) => records,
        Value::Null => Vec::new(),
        other => {
            return Err(ClientError::Decode(format!(
                "expected a list from {}, got {}",
                endpoint,
                json_kind(&other)
            )))
        }
    };

    let total = records.len();
    let decoded: Vec<T> = records
        .into_iter()
        .enumerate()
        .filter_map(|(index, record)| match serde_json::from_value(record) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(endpoint = endpoint, index = index, error = %e, "Skipping malformed record");
                None
            }
        })
        .collect();

    if decoded.len() < total {
        debug!(
            endpoint = endpoint,
            kept = decoded.len(),
            total = total,
            "Decoded list with skipped records"
        );
    }
    Ok(decoded)
}

/// Human-readable message from an error body: `detail`, `message` or the raw text
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            ["detail", "message", "error"]
                .iter()
                .find_map(|key| value.get(key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Bulk action adapters
// ============================================================================

/// Per-job forced termination
pub struct TerminateJob {
    client: ControlPlaneClient,
}

impl TerminateJob {
    pub fn new(client: ControlPlaneClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteAction for TerminateJob {
    fn labels(&self) -> ActionLabels {
        ActionLabels::TERMINATE
    }

    async fn invoke(&self, item: &str, reason: &str) -> Result<RemoteOutcome, ClientError> {
        self.client.terminate_job(item, reason).await
    }
}

/// Aggregate stale-execution cleanup; the item id is ignored
pub struct CleanupStale {
    client: ControlPlaneClient,
}

impl CleanupStale {
    pub fn new(client: ControlPlaneClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteAction for CleanupStale {
    fn labels(&self) -> ActionLabels {
        ActionLabels::CLEANUP_STALE
    }

    async fn invoke(&self, _item: &str, _reason: &str) -> Result<RemoteOutcome, ClientError> {
        self.client.cleanup_stale().await
    }
}

// ============================================================================
// Live view sources
// ============================================================================

/// All jobs, as shown on the job list
pub struct JobListSource {
    client: ControlPlaneClient,
}

impl JobListSource {
    pub fn new(client: ControlPlaneClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher<Vec<Job>> for JobListSource {
    async fn fetch(&self) -> Result<Vec<Job>, ClientError> {
        self.client.list_jobs().await
    }
}

/// Executions of one job
pub struct ExecutionListSource {
    client: ControlPlaneClient,
    job_id: i64,
}

impl ExecutionListSource {
    pub fn new(client: ControlPlaneClient, job_id: i64) -> Self {
        Self { client, job_id }
    }
}

#[async_trait]
impl Fetcher<Vec<Execution>> for ExecutionListSource {
    async fn fetch(&self) -> Result<Vec<Execution>, ClientError> {
        self.client.list_executions(self.job_id).await
    }
}

/// One execution rebuilt from its flat action results
pub struct ExecutionResultsSource {
    client: ControlPlaneClient,
    recorded: Execution,
}

impl ExecutionResultsSource {
    pub fn new(client: ControlPlaneClient, recorded: Execution) -> Self {
        Self { client, recorded }
    }
}

#[async_trait]
impl Fetcher<Execution> for ExecutionResultsSource {
    async fn fetch(&self) -> Result<Execution, ClientError> {
        let records = self
            .client
            .list_action_results(self.recorded.job_id, self.recorded.execution_number)
            .await?;
        Ok(aggregate::build_execution(&self.recorded, &records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_data_unwraps_lists() {
        let body = json!({ "data": [1, 2] });
        assert_eq!(envelope_data(body), json!([1, 2]));
    }

    #[test]
    fn test_envelope_data_keeps_outcomes() {
        let body = json!({ "success": true, "data": { "killed": 3 } });
        assert_eq!(envelope_data(body.clone()), body);
    }

    #[test]
    fn test_decode_list_skips_malformed_records() {
        let body = json!([
            { "id": 1, "name": "backup", "status": "running" },
            { "name": "no id" },
            { "id": 3, "name": "report", "status": "weird" }
        ]);
        let jobs: Vec<Job> = decode_list("list_jobs", body).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, 1);
        assert_eq!(jobs[1].id, 3);
    }

    #[test]
    fn test_decode_list_rejects_non_list() {
        let result: Result<Vec<Job>, _> = decode_list("list_jobs", json!("nope"));
        assert!(matches!(result, Err(ClientError::Decode(_))));
    }

    #[test]
    fn test_error_detail_prefers_detail_field() {
        assert_eq!(error_detail(r#"{"detail":"Job not found"}"#), "Job not found");
        assert_eq!(error_detail("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn test_static_credentials_ignore_blank_token() {
        assert_eq!(StaticCredentials::new(Some("  ".to_string())).bearer_token(), None);
        assert_eq!(
            StaticCredentials::new(Some("abc".to_string())).bearer_token(),
            Some("abc".to_string())
        );
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        let config = ControlPlaneConfig {
            base_url: "http://localhost:8000/api/".to_string(),
            api_token: None,
            request_timeout_seconds: 5,
        };
        let client =
            ControlPlaneClient::new(&config, Arc::new(StaticCredentials::default())).unwrap();
        assert_eq!(client.url("/jobs"), "http://localhost:8000/api/jobs");
    }
}

use crate::config::ClientConfig;
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use tw_core::api_contracts::{
    AnalysisAccepted, AnalysisRequest, Conclusion, ExecutionAck, ExecutionRequest, HuntScope,
    HuntSession, Hypothesis, JobLogLine, LogDataset,
};
use tw_core::{Credential, EntityId, EntityKind, Snapshot};
use tw_sync::SyncError;
use url::Url;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("credential is missing or a placeholder")]
    MissingCredential,
    #[error("credential rejected by backend (HTTP {0})")]
    Unauthorized(u16),
    #[error("request failed with HTTP {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::MissingCredential | ApiError::Unauthorized(_) => {
                SyncError::Auth(err.to_string())
            }
            other => SyncError::Resync(other.to_string()),
        }
    }
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, kind: EntityKind, id: &EntityId) -> Result<Snapshot, ApiError>;
}

#[async_trait]
pub trait JobApi: Send + Sync {
    async fn list_jobs(&self, limit: u32) -> Result<Vec<Snapshot>, ApiError>;
    async fn job_logs(&self, id: &EntityId) -> Result<Vec<JobLogLine>, ApiError>;
    async fn run_analysis(&self, request: &AnalysisRequest) -> Result<AnalysisAccepted, ApiError>;
}

#[async_trait]
pub trait HuntApi: Send + Sync {
    async fn log_datasets(&self) -> Result<Vec<LogDataset>, ApiError>;
    async fn create_session(&self, scope: &HuntScope) -> Result<HuntSession, ApiError>;
    async fn save_hypothesis(&self, hunt_id: &EntityId, hypothesis: &Hypothesis)
        -> Result<(), ApiError>;
    async fn execute(
        &self,
        hunt_id: &EntityId,
        request: &ExecutionRequest,
    ) -> Result<ExecutionAck, ApiError>;
    async fn pause(&self, hunt_id: &EntityId, execution_id: &str) -> Result<(), ApiError>;
    async fn stop(&self, hunt_id: &EntityId, execution_id: &str) -> Result<(), ApiError>;
    async fn save_conclusion(
        &self,
        hunt_id: &EntityId,
        conclusion: &Conclusion,
    ) -> Result<(), ApiError>;
}

#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    api_base: Url,
    credential: Credential,
}

impl RestClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("tw-watch/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.clone(),
            credential: config.credential.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::Endpoint(self.api_base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn token(&self) -> Result<&str, ApiError> {
        if self.credential.is_usable() {
            Ok(self.credential.expose())
        } else {
            Err(ApiError::MissingCredential)
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        debug!(event = "rest_get", path = url.path());
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token()?)
            .send()
            .await?;
        read_json(response).await
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        url: Url,
        body: Option<&B>,
    ) -> Result<T, ApiError> {
        debug!(event = "rest_post", path = url.path());
        let mut request = self.http.post(url).bearer_auth(self.token()?);
        if let Some(body) = body {
            request = request.json(body);
        }
        read_json(request.send().await?).await
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        warn!(event = "rest_unauthorized", status = status.as_u16());
        return Err(ApiError::Unauthorized(status.as_u16()));
    }
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(ApiError::Status {
            status: status.as_u16(),
            detail: error_detail(&body),
        });
    }
    // Some POST routes answer 204; `null` lets `()` and `Option` targets decode.
    let body: &[u8] = if body.is_empty() { b"null" } else { &body };
    serde_json::from_slice(body).map_err(|err| ApiError::Decode(err.to_string()))
}

fn error_detail(body: &[u8]) -> String {
    let detail = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|value| match value.get("detail") {
            Some(Value::String(text)) => Some(text.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        });
    detail.unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}

#[async_trait]
impl SnapshotSource for RestClient {
    async fn fetch_snapshot(&self, kind: EntityKind, id: &EntityId) -> Result<Snapshot, ApiError> {
        let url = self.endpoint(&kind.snapshot_route(id))?;
        let raw: Value = self.get_json(url).await?;
        Snapshot::from_value(raw, Some(id)).map_err(|err| ApiError::Decode(err.to_string()))
    }
}

#[async_trait]
impl JobApi for RestClient {
    async fn list_jobs(&self, limit: u32) -> Result<Vec<Snapshot>, ApiError> {
        let mut url = self.endpoint(&["ai_analysis", "jobs"])?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());
        self.get_json(url).await
    }

    async fn job_logs(&self, id: &EntityId) -> Result<Vec<JobLogLine>, ApiError> {
        let url = self.endpoint(&["ai_analysis", "jobs", id.as_str(), "logs"])?;
        self.get_json(url).await
    }

    async fn run_analysis(&self, request: &AnalysisRequest) -> Result<AnalysisAccepted, ApiError> {
        let url = self.endpoint(&["ai_analysis", "run-analysis"])?;
        self.post_json(url, Some(request)).await
    }
}

#[async_trait]
impl HuntApi for RestClient {
    async fn log_datasets(&self) -> Result<Vec<LogDataset>, ApiError> {
        let url = self.endpoint(&["threat_hunt", "log_datasets"])?;
        self.get_json(url).await
    }

    async fn create_session(&self, scope: &HuntScope) -> Result<HuntSession, ApiError> {
        let url = self.endpoint(&["threat_hunt", "sessions"])?;
        self.post_json(url, Some(scope)).await
    }

    async fn save_hypothesis(
        &self,
        hunt_id: &EntityId,
        hypothesis: &Hypothesis,
    ) -> Result<(), ApiError> {
        let url = self.endpoint(&["threat_hunt", hunt_id.as_str(), "hypothesis"])?;
        let _: Value = self.post_json(url, Some(hypothesis)).await?;
        Ok(())
    }

    async fn execute(
        &self,
        hunt_id: &EntityId,
        request: &ExecutionRequest,
    ) -> Result<ExecutionAck, ApiError> {
        let url = self.endpoint(&["threat_hunt", hunt_id.as_str(), "execute"])?;
        self.post_json(url, Some(request)).await
    }

    async fn pause(&self, hunt_id: &EntityId, execution_id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&[
            "threat_hunt",
            hunt_id.as_str(),
            "executions",
            execution_id,
            "pause",
        ])?;
        let _: Value = self.post_json::<Value, _>(url, None).await?;
        Ok(())
    }

    async fn stop(&self, hunt_id: &EntityId, execution_id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&[
            "threat_hunt",
            hunt_id.as_str(),
            "executions",
            execution_id,
            "stop",
        ])?;
        let _: Value = self.post_json::<Value, _>(url, None).await?;
        Ok(())
    }

    async fn save_conclusion(
        &self,
        hunt_id: &EntityId,
        conclusion: &Conclusion,
    ) -> Result<(), ApiError> {
        let url = self.endpoint(&["threat_hunt", hunt_id.as_str(), "conclusion"])?;
        let _: Value = self.post_json(url, Some(conclusion)).await?;
        Ok(())
    }
}

//! JSON-over-HTTP client for the remote compute service.
//!
//! | Operation    | Request                                   | Response                      |
//! |--------------|-------------------------------------------|-------------------------------|
//! | submit       | `POST /v1/jobs` with a [`JobSpec`]        | `{"job_id": "..."}`           |
//! | status       | `GET /v1/jobs/{id}`                       | [`RemoteJobStatus`]           |
//! | status batch | `POST /v1/jobs/status` `{"job_ids": [..]}` | `{"jobs": {"<id>": status}}`  |
//! | cancel       | `POST /v1/jobs/{id}/cancel`               | any 2xx                       |

use crate::error::RemoteError;
use crate::remote::{JobSpec, RemoteJobService, RemoteJobStatus};
use ardtrack_core::RemoteJobId;
use ardtrack_core::config::RemoteConfig;
use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use tracing::instrument;

/// Ids per batch status request.
const STATUS_BATCH_SIZE: usize = 100;

const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

#[derive(Serialize)]
struct StatusBatchRequest<'a> {
    job_ids: &'a [RemoteJobId],
}

#[derive(Deserialize)]
struct StatusBatchResponse {
    jobs: HashMap<RemoteJobId, RemoteJobStatus>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: RemoteJobId,
}

#[derive(Clone)]
pub struct HttpJobService {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpJobService {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, RemoteError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| RemoteError::Config(format!("invalid remote base URL: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self, RemoteError> {
        config.validate().map_err(RemoteError::Config)?;
        Self::new(&config.base_url, config.token.clone(), config.request_timeout())
    }

    fn url(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(path)
            .map_err(|e| RemoteError::Config(format!("failed to build API URL: {e}")))
    }

    fn job_url(&self, id: &RemoteJobId, suffix: &str) -> Result<Url, RemoteError> {
        let id = utf8_percent_encode(id.as_str(), PATH_SEGMENT);
        self.url(&format!("v1/jobs/{id}{suffix}"))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<String, RemoteError> {
        let req = match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        let response = req.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }
        // A body cut off mid-read is a transport failure, not a bad payload.
        response.text().await.map_err(transport_error)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, RemoteError> {
        let body = self.send(req).await?;
        serde_json::from_str(&body).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout(err.to_string())
    } else {
        RemoteError::Transient(err.to_string())
    }
}

fn status_error(status: StatusCode, body: String) -> RemoteError {
    let message = format!("{status}: {body}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized(message),
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RemoteError::Timeout(message),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Transient(message),
        s if s.is_server_error() => RemoteError::Transient(message),
        _ => RemoteError::Rejected(message),
    }
}

#[async_trait]
impl RemoteJobService for HttpJobService {
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn submit(&self, spec: &JobSpec) -> Result<RemoteJobId, RemoteError> {
        let url = self.url("v1/jobs")?;
        let response: SubmitResponse = self.send_json(self.http.post(url).json(spec)).await?;
        tracing::debug!(job_id = %response.job_id, "Remote job accepted");
        Ok(response.job_id)
    }

    #[instrument(skip(self))]
    async fn status(&self, id: &RemoteJobId) -> Result<RemoteJobStatus, RemoteError> {
        let url = self.job_url(id, "")?;
        self.send_json(self.http.get(url)).await
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn status_batch(
        &self,
        ids: &[RemoteJobId],
    ) -> Result<HashMap<RemoteJobId, RemoteJobStatus>, RemoteError> {
        let url = self.url("v1/jobs/status")?;
        let mut statuses = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(STATUS_BATCH_SIZE) {
            let request = StatusBatchRequest { job_ids: chunk };
            let response: StatusBatchResponse = self
                .send_json(self.http.post(url.clone()).json(&request))
                .await?;
            statuses.extend(response.jobs);
        }
        Ok(statuses)
    }

    #[instrument(skip(self))]
    async fn cancel(&self, id: &RemoteJobId) -> Result<(), RemoteError> {
        let url = self.job_url(id, "/cancel")?;
        self.send(self.http.post(url)).await.map(|_| ())
    }

    fn service_name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, String::new()),
            RemoteError::Unauthorized(_)
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, String::new()),
            RemoteError::Unauthorized(_)
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, String::new()),
            RemoteError::NotFound(_)
        ));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, String::new()),
            RemoteError::Transient(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, String::new()),
            RemoteError::Transient(_)
        ));
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, "bad band".to_string()),
            RemoteError::Rejected(m) if m.contains("bad band")
        ));
    }

    #[test]
    fn test_job_url_encodes_id() {
        let service = HttpJobService::new(
            "http://127.0.0.1:8080/api",
            None,
            std::time::Duration::from_secs(1),
        )
        .unwrap();
        let url = service
            .job_url(&RemoteJobId::new("projects/p/operations/OP 1"), "/cancel")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8080/api/v1/jobs/projects%2Fp%2Foperations%2FOP%201/cancel"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let err = HttpJobService::new("not a url", None, std::time::Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, RemoteError::Config(_)));
    }
}

// Problem-metadata RPC client
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use judge_common::config::ProblemServiceConfig;
use judge_common::types::ProblemDetail;

#[derive(Debug, Error)]
pub enum ProblemClientError {
    #[error("problem {0} not found")]
    NotFound(i64),
    #[error("problem service refused the request ({0})")]
    Unauthorized(StatusCode),
    #[error("problem service returned {0}")]
    Status(StatusCode),
    #[error("problem service unreachable: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("invalid problem payload: {0}")]
    Decode(#[source] reqwest::Error),
}

impl ProblemClientError {
    /// 404/401/403 and other 4xx are final; 429, 5xx and network trouble are not
    pub fn is_retriable(&self) -> bool {
        match self {
            ProblemClientError::NotFound(_) | ProblemClientError::Unauthorized(_) => false,
            ProblemClientError::Status(status) => is_retriable_status(*status),
            ProblemClientError::Transport(_) | ProblemClientError::Decode(_) => true,
        }
    }
}

fn is_retriable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn classify_status(problem_id: i64, status: StatusCode) -> ProblemClientError {
    match status {
        StatusCode::NOT_FOUND => ProblemClientError::NotFound(problem_id),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProblemClientError::Unauthorized(status),
        other => ProblemClientError::Status(other),
    }
}

/// Delay before retry number `attempt` (0-based), doubling up to the cap
pub fn backoff_delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(31)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

#[derive(Clone)]
pub struct ProblemClient {
    client: Client,
    config: ProblemServiceConfig,
}

impl ProblemClient {
    pub fn new(config: ProblemServiceConfig) -> Result<Self, ProblemClientError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(ProblemClientError::Transport)?;
        Ok(ProblemClient { client, config })
    }

    fn url(&self, problem_id: i64) -> String {
        format!("{}/problems/{}", self.config.base_url.trim_end_matches('/'), problem_id)
    }

    /// Fetch problem metadata, retrying transient failures
    pub async fn get_problem_detail(&self, problem_id: i64) -> Result<ProblemDetail, ProblemClientError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(problem_id).await {
                Ok(detail) => return Ok(detail),
                Err(e) if e.is_retriable() && attempt < self.config.max_retries => {
                    let delay = backoff_delay(self.config.backoff_ms, self.config.max_backoff_ms, attempt);
                    warn!(
                        problem_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Problem service request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, problem_id: i64) -> Result<ProblemDetail, ProblemClientError> {
        let url = self.url(problem_id);
        debug!(%url, "Fetching problem detail");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ProblemClientError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(problem_id, status));
        }

        response.json::<ProblemDetail>().await.map_err(ProblemClientError::Decode)
    }
}

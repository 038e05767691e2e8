use std::time::Duration;

use async_trait::async_trait;
use autosubmit_core::ExecutorConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// What a dispatcher hands to the executor for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub job_id: String,
    pub target: String,
    /// Unique per claim. Executors should treat a repeated token as a
    /// duplicate delivery of the same attempt.
    pub claim_token: String,
    pub attempt: u32,
}

/// Body an executor may return. An empty 2xx body counts as success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    #[serde(default = "bool_true")]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Free-form detail (e.g. a confirmation id) for logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ExecutionReport {
    fn default_ok() -> Self {
        Self {
            ok: true,
            error: None,
            detail: None,
        }
    }
}

fn bool_true() -> bool {
    true
}

/// The component that performs the real-world action a job stands for.
///
/// Delivery is at-least-once: a crash between a successful call and the
/// status write replays the job under a new claim token.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executor name for logging.
    fn name(&self) -> &str;

    /// Perform one attempt. `Ok` means the action succeeded.
    async fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionReport, ExecutorError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("executor unavailable: {0}")]
    Unavailable(String),

    #[error("executor rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("execution failed: {0}")]
    Failed(String),

    #[error("execution timed out after {ms}ms")]
    Timeout { ms: u64 },
}

/// Executor reached over HTTP: `POST {url}` with an [`ExecutionRequest`] body.
///
/// The claim token doubles as the `Idempotency-Key` header.
pub struct HttpExecutor {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpExecutor {
    pub fn new(config: &ExecutorConfig, timeout: Duration) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionReport, ExecutorError> {
        debug!(job_id = %req.job_id, attempt = req.attempt, url = %self.url, "calling executor");

        let mut builder = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .header("idempotency-key", &req.claim_token)
            .json(req);
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                ExecutorError::Unavailable(e.to_string())
            } else {
                ExecutorError::Http(e)
            }
        })?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            warn!(job_id = %req.job_id, status = status.as_u16(), body = %text, "executor error");
            return Err(ExecutorError::Rejected {
                status: status.as_u16(),
                message: text,
            });
        }

        let report = if text.trim().is_empty() {
            ExecutionReport::default_ok()
        } else {
            serde_json::from_str::<ExecutionReport>(&text).map_err(|e| {
                ExecutorError::Failed(format!("unparseable executor response: {e}"))
            })?
        };
        if !report.ok {
            return Err(ExecutorError::Failed(
                report
                    .error
                    .unwrap_or_else(|| "executor reported failure".to_string()),
            ));
        }
        Ok(report)
    }
}

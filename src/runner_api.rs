//! Runner-API HTTP client: the two remote calls the orchestrator makes when
//! a task cannot complete normally.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::{Certificate, Client, StatusCode};
use serde::Serialize;
use thiserror::Error;

use crate::error::sanitize_fail_message;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const USER_AGENT: &str = concat!("run-task-orchestrator/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum RunnerApiError {
    #[error("exhausted all task retries")]
    ExhaustedRetries,

    #[error("request to runner API timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    #[error("failed to resolve runner API host: {0}")]
    Dns(#[source] reqwest::Error),

    #[error("runner API request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("runner API responded with status {status}: {body}")]
    UnsuccessfulResponse { status: StatusCode, body: String },
}

fn classify_transport_error(e: reqwest::Error) -> RunnerApiError {
    if e.is_timeout() {
        return RunnerApiError::Timeout(e);
    }
    if e.is_connect() {
        if let Some(source) = e.source() {
            if source.to_string().contains("dns") {
                return RunnerApiError::Dns(e);
            }
        }
    }
    RunnerApiError::Transport(e)
}

use std::error::Error as _;

pub struct RunnerApiClient {
    http: Client,
    base_url: String,
    token: String,
}

impl RunnerApiClient {
    pub fn new(base_url: String, token: String, extra_ca_certs: Vec<Certificate>) -> anyhow::Result<Self> {
        let mut builder = Client::builder().timeout(DEFAULT_TIMEOUT).user_agent(USER_AGENT);
        for cert in extra_ca_certs {
            builder = builder.add_root_certificate(cert);
        }
        let http = builder.build().map_err(|e| anyhow::anyhow!("build runner API client: {e}"))?;
        Ok(Self { http, base_url, token })
    }

    /// `POST /api/v3/runner/unclaim`. `Ok(())` means the task may be
    /// rescheduled elsewhere; [`RunnerApiError::ExhaustedRetries`] means the
    /// caller must fall through to [`Self::fail_task`].
    pub async fn unclaim_task(&self, task_id: &str, task_token: &str) -> Result<(), RunnerApiError> {
        #[derive(Serialize)]
        struct UnclaimRequest<'a> {
            task_id: &'a str,
            task_token: &'a str,
        }

        let url = format!("{}/api/v3/runner/unclaim", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&UnclaimRequest { task_id, task_token })
            .send()
            .await
            .map_err(classify_transport_error)?;

        if response.status() == StatusCode::CONFLICT {
            return Err(RunnerApiError::ExhaustedRetries);
        }
        ensure_success(response).await
    }

    /// `POST /api/v2/task/event/fail`.
    pub async fn fail_task(&self, allocation: &str, message: &str) -> Result<(), RunnerApiError> {
        #[derive(Serialize)]
        struct FailRequest<'a> {
            allocation: &'a str,
            timestamp: u128,
            message: String,
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        let url = format!("{}/api/v2/task/event/fail", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&FailRequest {
                allocation,
                timestamp,
                message: sanitize_fail_message(message),
            })
            .send()
            .await
            .map_err(classify_transport_error)?;

        ensure_success(response).await
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<(), RunnerApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(RunnerApiError::UnsuccessfulResponse { status, body })
}

//! Client side of the agent protocol.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use fleet_common::protocol::{
    ErrorBody, GetTaskRequest, GetTaskResponse, HeartbeatRequest, HeartbeatResponse,
    RegisterRequest, RegisterResponse, SubmitResultRequest, SubmitResultResponse,
};
use fleet_common::routes;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("session rejected: {0}")]
    Unauthenticated(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("control plane error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// The four protocol operations as seen from the agent.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse, ClientError>;
    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse, ClientError>;
    async fn get_task(&self, req: GetTaskRequest) -> Result<GetTaskResponse, ClientError>;
    async fn submit_result(
        &self,
        req: SubmitResultRequest,
    ) -> Result<SubmitResultResponse, ClientError>;
}

/// JSON-over-HTTP [`ControlPlane`].
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    base_url: String,
    http: reqwest::Client,
}

impl HttpControlPlane {
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: normalize_base_url(base_url),
            http,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<Req: Serialize + Sync, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, ClientError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|b| b.message)
            .unwrap_or(text);
        Err(classify(status, message))
    }
}

fn classify(status: StatusCode, message: String) -> ClientError {
    match status {
        StatusCode::UNAUTHORIZED => ClientError::Unauthenticated(message),
        StatusCode::NOT_FOUND => ClientError::NotFound(message),
        s if s.is_client_error() => ClientError::Rejected {
            status: s.as_u16(),
            message,
        },
        s => ClientError::Server {
            status: s.as_u16(),
            message,
        },
    }
}

/// Accept `host:port` as well as a full URL; strip trailing slashes.
fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse, ClientError> {
        self.post(routes::REGISTER, &req).await
    }

    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse, ClientError> {
        self.post(routes::HEARTBEAT, &req).await
    }

    async fn get_task(&self, req: GetTaskRequest) -> Result<GetTaskResponse, ClientError> {
        self.post(routes::GET_TASK, &req).await
    }

    async fn submit_result(
        &self,
        req: SubmitResultRequest,
    ) -> Result<SubmitResultResponse, ClientError> {
        self.post(routes::SUBMIT_RESULT, &req).await
    }
}

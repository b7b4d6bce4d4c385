//! Request and response bodies for the agent protocol.
//!
//! Every operation is a JSON POST. Apart from `register`, each request
//! carries the `session_token` returned by the most recent registration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{AgentStatus, Task, TaskResult};

/// HTTP paths served by the control plane
pub mod routes {
    pub const REGISTER: &str = "/rpc/v1/register";
    pub const HEARTBEAT: &str = "/rpc/v1/heartbeat";
    pub const GET_TASK: &str = "/rpc/v1/get-task";
    pub const SUBMIT_RESULT: &str = "/rpc/v1/submit-result";

    pub const HEALTH: &str = "/health";
    pub const AGENTS: &str = "/api/v1/agents";
    pub const AGENT: &str = "/api/v1/agents/{id}";
    pub const TASKS: &str = "/api/v1/tasks";
    pub const TASK: &str = "/api/v1/tasks/{id}";
    pub const STATUS: &str = "/api/v1/status";
    pub const DEBUG: &str = "/api/v1/debug";
}

/// Timing constants shared by both sides of the protocol
pub mod timing {
    /// An agent not seen for longer than this is offline and gets no work.
    pub const LIVENESS_THRESHOLD_SECS: u64 = 300;

    /// Period of the agent heartbeat timer.
    pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
}

/// Machine-readable error codes carried in [`ErrorBody::code`]
pub mod codes {
    pub const NOT_FOUND: &str = "not_found";
    pub const UNAUTHENTICATED: &str = "unauthenticated";
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const TASK_NOT_OWNED: &str = "task_not_owned";
    pub const PERSISTENCE_FAILED: &str = "persistence_failed";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub agent_id: String,
    pub agent_name: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: HashMap<String, String>,
    pub hostname: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub session_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    pub session_token: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub metrics: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// At least one task is eligible; the agent should poll `get-task`.
    pub has_task: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTaskRequest {
    pub agent_id: String,
    pub session_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTaskResponse {
    /// `None` when nothing is eligible. This is not an error.
    pub task: Option<TaskAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResultRequest {
    pub agent_id: String,
    pub session_token: String,
    pub task_id: String,
    pub result: TaskResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResultResponse {
    pub accepted: bool,
}

/// The task as handed to an agent.
///
/// Transport-neutral: a push-style stream can carry the same payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskAssignment {
    pub task_id: String,
    pub task_type: String,
    pub command: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Unix seconds.
    pub created_at: i64,
}

impl From<&Task> for TaskAssignment {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            command: task.command.clone(),
            parameters: task.parameters.clone(),
            timeout_seconds: task.timeout_seconds,
            created_at: task.created_at.timestamp(),
        }
    }
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Liveness state an agent reports about itself
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Unknown,
    Idle,
    Busy,
    Offline,
}

/// Lifecycle of a task. Only ever moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Lowercase label, identical to the serialized form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `next` keeps the status monotone.
    ///
    /// Pending → Running → Completed | Failed. A Pending task may also fail
    /// directly; terminal states accept nothing.
    #[must_use]
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Running | TaskStatus::Failed) => true,
            (TaskStatus::Running, TaskStatus::Completed | TaskStatus::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote worker known to the authority
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Agent {
    /// Stable identity, derived from hostname and IP by the agent.
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: HashMap<String, String>,
    pub hostname: String,
    pub ip_address: String,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
    /// Token issued by the most recent successful Register.
    pub session_token: String,
    /// Last reported telemetry snapshot, replaced on every heartbeat.
    #[serde(default)]
    pub metrics: HashMap<String, String>,
}

impl Agent {
    /// Seen within `threshold` of `now`.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now.signed_duration_since(self.last_seen) <= threshold
    }

    /// Live and reporting Idle: the only agents that may receive work.
    #[must_use]
    pub fn is_eligible(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.is_live(now, threshold) && self.status == AgentStatus::Idle
    }
}

/// Outcome of one task execution as reported by the agent.
///
/// Business failures (a command that exited non-zero) are encoded here with
/// `success = false`; they never change the protocol flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub execution_time_ms: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Stamped by the authority when the result is accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One unit of work held in the task table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub command: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: u64,
    pub status: TaskStatus,
    /// Agent id, or empty when any agent may take the task.
    ///
    /// While the task is Pending this is a preference, not a reservation.
    #[serde(default)]
    pub assigned_to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

impl Task {
    /// A fresh Pending task, optionally preferring `assigned_to`.
    #[must_use]
    pub fn pending(
        id: impl Into<String>,
        task_type: impl Into<String>,
        command: impl Into<String>,
        parameters: HashMap<String, String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            command: command.into(),
            parameters,
            timeout_seconds: 0,
            status: TaskStatus::Pending,
            assigned_to: String::new(),
            assigned_at: None,
            created_at,
            result: None,
        }
    }

    #[must_use]
    pub fn is_unassigned(&self) -> bool {
        self.assigned_to.is_empty()
    }

    /// Running past its advisory timeout. Tasks without a timeout never expire.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Running || self.timeout_seconds == 0 {
            return false;
        }
        let Some(assigned_at) = self.assigned_at else {
            return false;
        };
        let timeout = i64::try_from(self.timeout_seconds).unwrap_or(i64::MAX);
        now.signed_duration_since(assigned_at) > Duration::seconds(timeout)
    }
}

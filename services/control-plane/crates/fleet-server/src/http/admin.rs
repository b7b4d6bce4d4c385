//! Operator endpoints. These read and write the ledger directly and never
//! go through the session check.

use std::collections::{BTreeMap, HashMap};

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleet_common::{Agent, AgentStatus, Task, TaskKind, TaskStatus};

use super::extract::{ApiJson, ApiQuery};
use super::{ApiError, AppState, SharedState, run_blocking};

/// Envelope wrapping every successful operator response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> Envelope<T> {
    fn data(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            count: None,
            message: None,
        })
    }
}

impl<T> Envelope<Vec<T>> {
    fn list(items: Vec<T>) -> Json<Self> {
        Json(Self {
            success: true,
            count: Some(items.len()),
            data: Some(items),
            message: None,
        })
    }
}

impl Envelope<()> {
    fn message(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            data: None,
            count: None,
            message: Some(message.into()),
        })
    }
}

/// An agent record as shown to operators. The session token is never exposed.
#[derive(Debug, Serialize, Deserialize)]
pub struct AgentView {
    pub id: String,
    pub name: String,
    pub version: String,
    pub capabilities: HashMap<String, String>,
    pub hostname: String,
    pub ip_address: String,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
    pub metrics: HashMap<String, String>,
    /// Seen within the liveness threshold.
    pub online: bool,
}

impl AgentView {
    fn new(agent: Agent, online: bool) -> Self {
        Self {
            id: agent.id,
            name: agent.name,
            version: agent.version,
            capabilities: agent.capabilities,
            hostname: agent.hostname,
            ip_address: agent.ip_address,
            status: agent.status,
            last_seen: agent.last_seen,
            metrics: agent.metrics,
            online,
        }
    }
}

fn agent_view(state: &AppState, agent: Agent) -> AgentView {
    let online = agent.is_live(state.dispatcher.now(), state.dispatcher.liveness());
    AgentView::new(agent, online)
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ── Agents ────────────────────────────────────────────────────────────────────

pub async fn list_agents(
    State(state): State<SharedState>,
) -> Result<Json<Envelope<Vec<AgentView>>>, ApiError> {
    let agents = run_blocking(&state, |s| {
        Ok::<_, ApiError>(
            s.ledger()
                .list_agents()
                .into_iter()
                .map(|a| agent_view(s, a))
                .collect(),
        )
    })
    .await?;
    Ok(Envelope::list(agents))
}

pub async fn get_agent(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<AgentView>>, ApiError> {
    let view = run_blocking(&state, move |s| {
        s.ledger()
            .get_agent(&id)
            .map(|a| agent_view(s, a))
            .ok_or_else(|| ApiError::not_found(format!("agent '{id}' not found")))
    })
    .await?;
    Ok(Envelope::data(view))
}

pub async fn delete_agent(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<()>>, ApiError> {
    let target = id.clone();
    let removed = run_blocking(&state, move |s| s.ledger().delete_agent(&target)).await?;
    if !removed {
        return Err(ApiError::not_found(format!("agent '{id}' not found")));
    }
    tracing::info!(agent_id = %id, "agent deleted");
    Ok(Envelope::message(format!("agent '{id}' deleted")))
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
}

/// Body of `POST /api/v1/tasks`.
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateTask {
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Sticky preference for one agent; empty lets any agent take it.
    #[serde(default)]
    pub assigned_to: String,
}

impl CreateTask {
    fn validate(&self) -> Result<(), ApiError> {
        if self.task_type.trim().is_empty() {
            return Err(ApiError::validation("task type is required"));
        }
        if self.command.trim().is_empty() {
            return Err(ApiError::validation("task command is required"));
        }
        TaskKind::decode(&self.task_type, &self.parameters)
            .map_err(|e| ApiError::validation(e.to_string()))?;
        Ok(())
    }
}

pub async fn list_tasks(
    State(state): State<SharedState>,
    ApiQuery(filter): ApiQuery<TaskFilter>,
) -> Result<Json<Envelope<Vec<Task>>>, ApiError> {
    let tasks = run_blocking(&state, move |s| {
        Ok::<_, ApiError>(match filter.status {
            Some(TaskStatus::Pending) => s.ledger().pending_tasks(),
            Some(status) => s
                .ledger()
                .list_tasks()
                .into_iter()
                .filter(|t| t.status == status)
                .collect(),
            None => s.ledger().list_tasks(),
        })
    })
    .await?;
    Ok(Envelope::list(tasks))
}

pub async fn create_task(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<CreateTask>,
) -> Result<(StatusCode, Json<Envelope<Task>>), ApiError> {
    req.validate()?;

    let mut task = Task::pending(
        state.next_task_id(),
        req.task_type.trim(),
        req.command.trim(),
        req.parameters,
        state.dispatcher.now(),
    );
    task.timeout_seconds = req.timeout_seconds;
    task.assigned_to = req.assigned_to.trim().to_string();

    let stored = task.clone();
    run_blocking(&state, move |s| s.ledger().save_task(stored)).await?;

    tracing::info!(
        task_id = %task.id,
        task_type = %task.task_type,
        assigned_to = %task.assigned_to,
        "task created",
    );
    Ok((StatusCode::CREATED, Envelope::data(task)))
}

pub async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Task>>, ApiError> {
    run_blocking(&state, move |s| {
        s.ledger()
            .get_task(&id)
            .ok_or_else(|| ApiError::not_found(format!("task '{id}' not found")))
    })
    .await
    .map(Envelope::data)
}

pub async fn delete_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<()>>, ApiError> {
    let target = id.clone();
    let removed = run_blocking(&state, move |s| s.ledger().delete_task(&target)).await?;
    if !removed {
        return Err(ApiError::not_found(format!("task '{id}' not found")));
    }
    tracing::info!(task_id = %id, "task deleted");
    Ok(Envelope::message(format!("task '{id}' deleted")))
}

// ── Counters ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusReport {
    pub total_agents: usize,
    pub online_agents: usize,
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub server_time: DateTime<Utc>,
}

pub async fn status(
    State(state): State<SharedState>,
) -> Result<Json<Envelope<StatusReport>>, ApiError> {
    run_blocking(&state, |s| Ok::<_, ApiError>(status_report(s)))
        .await
        .map(Envelope::data)
}

fn status_report(state: &AppState) -> StatusReport {
    let now = state.dispatcher.now();
    let liveness = state.dispatcher.liveness();
    let agents = state.ledger().list_agents();
    let tasks = state.ledger().list_tasks();

    StatusReport {
        total_agents: agents.len(),
        online_agents: agents.iter().filter(|a| a.is_live(now, liveness)).count(),
        total_tasks: tasks.len(),
        pending_tasks: tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .count(),
        server_time: now,
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DebugReport {
    pub online_agents: usize,
    /// Online and Idle: would receive work right now.
    pub idle_agents: usize,
    pub tasks_by_status: BTreeMap<String, usize>,
    pub agents: Vec<AgentView>,
    pub pending_task_ids: Vec<String>,
    pub server_time: DateTime<Utc>,
}

pub async fn debug(
    State(state): State<SharedState>,
) -> Result<Json<Envelope<DebugReport>>, ApiError> {
    run_blocking(&state, |s| Ok::<_, ApiError>(debug_report(s)))
        .await
        .map(Envelope::data)
}

fn debug_report(state: &AppState) -> DebugReport {
    let now = state.dispatcher.now();
    let liveness = state.dispatcher.liveness();
    let agents = state.ledger().list_agents();
    let tasks = state.ledger().list_tasks();

    let mut tasks_by_status: BTreeMap<String, usize> = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ]
    .iter()
    .map(|s| (s.as_str().to_string(), 0))
    .collect();
    for task in &tasks {
        *tasks_by_status
            .entry(task.status.as_str().to_string())
            .or_default() += 1;
    }

    DebugReport {
        online_agents: agents.iter().filter(|a| a.is_live(now, liveness)).count(),
        idle_agents: agents.iter().filter(|a| a.is_eligible(now, liveness)).count(),
        tasks_by_status,
        pending_task_ids: tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.id.clone())
            .collect(),
        agents: agents.into_iter().map(|a| agent_view(state, a)).collect(),
        server_time: now,
    }
}

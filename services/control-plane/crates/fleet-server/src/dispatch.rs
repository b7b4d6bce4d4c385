//! The four agent-facing protocol operations.
//!
//! Each operation runs as a single [`Ledger::transact`], so the session
//! check, the eligibility check, the task scan and the resulting writes are
//! one critical section. Two concurrent `get_task` calls can therefore never
//! pick the same task.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use fleet_common::protocol::{
    GetTaskRequest, GetTaskResponse, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
    RegisterResponse, SubmitResultRequest, SubmitResultResponse, TaskAssignment,
};
use fleet_common::{Agent, AgentStatus, Task, TaskResult, TaskStatus, timing};

use crate::clock::{Clock, SystemClock};
use crate::error::DispatchError;
use crate::ledger::{Ledger, LedgerTxn};
use crate::session::SessionAuthenticator;

/// Pick the task `agent_id` should run next from `pending`, which must be
/// ordered oldest first.
///
/// A task already preferring this agent wins; otherwise the oldest task
/// with no preference. Tasks preferring another agent are never chosen.
#[must_use]
pub fn select_task<'a>(agent_id: &str, pending: &[&'a Task]) -> Option<&'a Task> {
    let pending = pending.iter().copied().filter(|t| t.status == TaskStatus::Pending);
    pending
        .clone()
        .find(|t| t.assigned_to == agent_id)
        .or_else(|| pending.clone().find(|t| t.is_unassigned()))
}

/// Dispatch protocol handler over a shared [`Ledger`].
pub struct Dispatcher {
    ledger: Arc<Ledger>,
    sessions: SessionAuthenticator,
    clock: Arc<dyn Clock>,
    liveness: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("liveness", &self.liveness)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            sessions: SessionAuthenticator,
            clock: Arc::new(SystemClock),
            liveness: default_liveness(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_liveness(mut self, liveness: std::time::Duration) -> Self {
        self.liveness = Duration::from_std(liveness).unwrap_or_else(|_| default_liveness());
        self
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    #[must_use]
    pub fn liveness(&self) -> Duration {
        self.liveness
    }

    /// Create or fully replace the agent record and issue a new token.
    ///
    /// Any token issued earlier for the same id stops validating.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ValidationFailed`] for an empty agent id.
    pub fn register(&self, req: RegisterRequest) -> Result<RegisterResponse, DispatchError> {
        let agent_id = req.agent_id.trim().to_string();
        if agent_id.is_empty() {
            return Err(DispatchError::ValidationFailed(
                "agent_id must not be empty".to_string(),
            ));
        }

        let agent = Agent {
            session_token: self.sessions.issue(&agent_id),
            id: agent_id,
            name: req.agent_name,
            version: req.version,
            capabilities: req.capabilities,
            hostname: req.hostname,
            ip_address: req.ip_address,
            status: AgentStatus::Idle,
            last_seen: self.now(),
            metrics: HashMap::new(),
        };
        let session_token = agent.session_token.clone();

        tracing::info!(agent_id = %agent.id, name = %agent.name, "agent registered");
        self.ledger
            .transact(|tx| tx.save_agent(agent))
            .log_persist_failure();

        Ok(RegisterResponse { session_token })
    }

    /// Record liveness and telemetry, then report whether work is waiting.
    ///
    /// Never assigns a task itself.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::AgentNotFound`] or
    /// [`DispatchError::Unauthenticated`]; nothing is changed in either case.
    pub fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse, DispatchError> {
        let now = self.now();
        let has_task = self
            .ledger
            .transact(|tx| -> Result<bool, DispatchError> {
                let mut agent = self.authenticate(tx, &req.agent_id, &req.session_token)?.clone();
                agent.last_seen = now;
                agent.status = req.status;
                agent.metrics = req.metrics;

                let has_task = agent.is_eligible(now, self.liveness)
                    && select_task(&agent.id, &tx.pending_tasks()).is_some();
                tx.save_agent(agent);
                Ok(has_task)
            })
            .log_persist_failure()?;

        if has_task {
            tracing::debug!(agent_id = %req.agent_id, "pending task available");
        }
        Ok(HeartbeatResponse { has_task })
    }

    /// Hand the caller at most one task, moving it Pending → Running.
    ///
    /// Returns `task: None` when the agent is not eligible or nothing is
    /// waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::AgentNotFound`] or
    /// [`DispatchError::Unauthenticated`].
    pub fn get_task(&self, req: &GetTaskRequest) -> Result<GetTaskResponse, DispatchError> {
        let now = self.now();
        let assigned = self
            .ledger
            .transact(|tx| -> Result<Option<TaskAssignment>, DispatchError> {
                let agent = self.authenticate(tx, &req.agent_id, &req.session_token)?;
                if !agent.is_eligible(now, self.liveness) {
                    tracing::debug!(
                        agent_id = %req.agent_id,
                        status = ?agent.status,
                        "agent not eligible for work",
                    );
                    return Ok(None);
                }

                let Some(task) = select_task(&agent.id, &tx.pending_tasks()) else {
                    return Ok(None);
                };
                let mut task = task.clone();
                task.status = TaskStatus::Running;
                task.assigned_to.clone_from(&req.agent_id);
                task.assigned_at = Some(now);
                let wire = TaskAssignment::from(&task);
                // Pending → Running is always a forward move.
                if let Err(e) = tx.save_task(task) {
                    tracing::error!(error = %e, "task assignment rejected by ledger");
                    return Ok(None);
                }
                Ok(Some(wire))
            })
            .log_persist_failure()?;

        match &assigned {
            Some(task) => tracing::info!(
                agent_id = %req.agent_id,
                task_id = %task.task_id,
                command = %task.command,
                "task assigned",
            ),
            None => tracing::debug!(agent_id = %req.agent_id, "no task available"),
        }
        Ok(GetTaskResponse { task: assigned })
    }

    /// Close a task the caller is running. The task becomes Completed
    /// whatever `result.success` says.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::AgentNotFound`],
    /// [`DispatchError::Unauthenticated`], [`DispatchError::TaskNotFound`],
    /// or [`DispatchError::TaskNotOwned`] when the task is not Running on
    /// this agent.
    pub fn submit_result(
        &self,
        req: SubmitResultRequest,
    ) -> Result<SubmitResultResponse, DispatchError> {
        let now = self.now();
        let success = req.result.success;
        self.ledger
            .transact(|tx| {
                self.authenticate(tx, &req.agent_id, &req.session_token)?;
                let task = tx
                    .get_task(&req.task_id)
                    .ok_or_else(|| DispatchError::TaskNotFound(req.task_id.clone()))?;
                if task.status != TaskStatus::Running || task.assigned_to != req.agent_id {
                    return Err(DispatchError::TaskNotOwned {
                        task_id: req.task_id.clone(),
                        agent_id: req.agent_id.clone(),
                    });
                }

                let mut task = task.clone();
                task.status = TaskStatus::Completed;
                task.result = Some(TaskResult {
                    completed_at: Some(now),
                    ..req.result
                });
                tx.save_task(task).map_err(|e| {
                    tracing::error!(error = %e, "task completion rejected by ledger");
                    DispatchError::TaskNotOwned {
                        task_id: req.task_id.clone(),
                        agent_id: req.agent_id.clone(),
                    }
                })
            })
            .log_persist_failure()?;

        tracing::info!(
            agent_id = %req.agent_id,
            task_id = %req.task_id,
            success,
            "task completed",
        );
        Ok(SubmitResultResponse { accepted: true })
    }

    /// Fail every Running task that outlived its `timeout_seconds`.
    ///
    /// Tasks are never re-queued, so status stays monotone. Returns the ids
    /// of the tasks that were failed.
    pub fn sweep_overdue(&self) -> Vec<String> {
        let now = self.now();
        let failed = self
            .ledger
            .transact(|tx| {
                let overdue: Vec<Task> = tx.tasks().filter(|t| t.is_overdue(now)).cloned().collect();
                let mut failed = Vec::with_capacity(overdue.len());
                for mut task in overdue {
                    task.status = TaskStatus::Failed;
                    task.result = Some(TaskResult {
                        success: false,
                        error: format!(
                            "task timed out after {}s on agent {}",
                            task.timeout_seconds, task.assigned_to
                        ),
                        completed_at: Some(now),
                        ..TaskResult::default()
                    });
                    let id = task.id.clone();
                    if tx.save_task(task).is_ok() {
                        failed.push(id);
                    }
                }
                failed
            })
            .log_persist_failure();

        for task_id in &failed {
            tracing::warn!(task_id = %task_id, "running task timed out; marked failed");
        }
        failed
    }

    fn authenticate<'t>(
        &self,
        tx: &'t LedgerTxn<'_>,
        agent_id: &str,
        token: &str,
    ) -> Result<&'t Agent, DispatchError> {
        let Some(agent) = tx.get_agent(agent_id) else {
            tracing::warn!(agent_id, "request from unknown agent");
            return Err(DispatchError::AgentNotFound(agent_id.to_string()));
        };
        if !self.sessions.validate(agent, token) {
            tracing::warn!(agent_id, "invalid session token");
            return Err(DispatchError::Unauthenticated(agent_id.to_string()));
        }
        Ok(agent)
    }
}

fn default_liveness() -> Duration {
    Duration::seconds(i64::try_from(timing::LIVENESS_THRESHOLD_SECS).unwrap_or(300))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::clock::ManualClock;

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let dispatcher = Dispatcher::new(Arc::new(Ledger::in_memory())).with_clock(clock.clone());
        Harness {
            dispatcher: Arc::new(dispatcher),
            clock,
        }
    }

    impl Harness {
        fn register(&self, agent_id: &str) -> String {
            self.dispatcher
                .register(RegisterRequest {
                    agent_id: agent_id.to_string(),
                    agent_name: format!("agent-{agent_id}"),
                    version: "1.0.0".to_string(),
                    capabilities: HashMap::from([("os".to_string(), "linux".to_string())]),
                    hostname: agent_id.to_string(),
                    ip_address: "10.0.0.2".to_string(),
                })
                .unwrap()
                .session_token
        }

        fn heartbeat(&self, agent_id: &str, token: &str, status: AgentStatus) -> bool {
            self.dispatcher
                .heartbeat(HeartbeatRequest {
                    agent_id: agent_id.to_string(),
                    session_token: token.to_string(),
                    status,
                    metrics: HashMap::new(),
                })
                .unwrap()
                .has_task
        }

        fn get_task(&self, agent_id: &str, token: &str) -> Option<TaskAssignment> {
            self.dispatcher
                .get_task(&GetTaskRequest {
                    agent_id: agent_id.to_string(),
                    session_token: token.to_string(),
                })
                .unwrap()
                .task
        }

        fn submit(
            &self,
            agent_id: &str,
            token: &str,
            task_id: &str,
            success: bool,
        ) -> Result<SubmitResultResponse, DispatchError> {
            self.dispatcher.submit_result(SubmitResultRequest {
                agent_id: agent_id.to_string(),
                session_token: token.to_string(),
                task_id: task_id.to_string(),
                result: TaskResult {
                    success,
                    ..TaskResult::default()
                },
            })
        }

        /// Create a Pending task; each call is one second younger than the last.
        fn add_task(&self, id: &str, preferred: &str) {
            self.clock.advance(Duration::seconds(1));
            let mut task = Task::pending(
                id,
                "port_forward",
                "nat",
                HashMap::from([
                    ("dport".to_string(), "8080".to_string()),
                    ("to-destination-ip".to_string(), "10.0.0.5".to_string()),
                    ("to-destination-port".to_string(), "80".to_string()),
                ]),
                self.clock.now(),
            );
            task.assigned_to = preferred.to_string();
            self.dispatcher.ledger().save_task(task).unwrap();
        }

        fn task(&self, id: &str) -> Task {
            self.dispatcher.ledger().get_task(id).unwrap()
        }
    }

    #[test]
    fn end_to_end_scenario() {
        let h = harness();
        let token = h.register("a1");
        assert!(!h.heartbeat("a1", &token, AgentStatus::Idle));

        h.add_task("t1", "");
        assert!(h.heartbeat("a1", &token, AgentStatus::Idle));

        let task = h.get_task("a1", &token).expect("t1 should be assigned");
        assert_eq!(task.task_id, "t1");
        assert_eq!(task.parameters["dport"], "8080");
        let stored = h.task("t1");
        assert_eq!(stored.status, TaskStatus::Running);
        assert_eq!(stored.assigned_to, "a1");
        assert!(stored.assigned_at.is_some());

        h.submit("a1", &token, "t1", true).unwrap();
        let stored = h.task("t1");
        assert_eq!(stored.status, TaskStatus::Completed);
        let result = stored.result.unwrap();
        assert!(result.success);
        assert!(result.completed_at.is_some());

        assert!(h.get_task("a1", &token).is_none());
    }

    #[test]
    fn only_latest_registration_token_validates() {
        let h = harness();
        let first = h.register("a1");
        let second = h.register("a1");
        let third = h.register("a1");

        for stale in [&first, &second] {
            let err = h
                .dispatcher
                .heartbeat(HeartbeatRequest {
                    agent_id: "a1".to_string(),
                    session_token: stale.clone(),
                    status: AgentStatus::Idle,
                    metrics: HashMap::new(),
                })
                .unwrap_err();
            assert_eq!(err, DispatchError::Unauthenticated("a1".to_string()));
        }
        assert!(!h.heartbeat("a1", &third, AgentStatus::Idle));
    }

    #[test]
    fn reregistration_overwrites_the_record() {
        let h = harness();
        let token = h.register("a1");
        h.dispatcher
            .heartbeat(HeartbeatRequest {
                agent_id: "a1".to_string(),
                session_token: token,
                status: AgentStatus::Busy,
                metrics: HashMap::from([("load_1m".to_string(), "3.2".to_string())]),
            })
            .unwrap();

        h.register("a1");
        let agent = h.dispatcher.ledger().get_agent("a1").unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.metrics.is_empty());
    }

    #[test]
    fn register_rejects_blank_id() {
        let h = harness();
        let err = h
            .dispatcher
            .register(RegisterRequest {
                agent_id: "  ".to_string(),
                agent_name: String::new(),
                version: String::new(),
                capabilities: HashMap::new(),
                hostname: String::new(),
                ip_address: String::new(),
            })
            .unwrap_err();
        assert!(matches!(err, DispatchError::ValidationFailed(_)));
    }

    #[test]
    fn unknown_agent_and_bad_token_mutate_nothing() {
        let h = harness();
        let token = h.register("a1");
        h.add_task("t1", "");
        let before = h.dispatcher.ledger().get_agent("a1").unwrap();
        h.clock.advance(Duration::seconds(10));

        let err = h
            .dispatcher
            .get_task(&GetTaskRequest {
                agent_id: "ghost".to_string(),
                session_token: token.clone(),
            })
            .unwrap_err();
        assert_eq!(err, DispatchError::AgentNotFound("ghost".to_string()));

        let err = h
            .dispatcher
            .heartbeat(HeartbeatRequest {
                agent_id: "a1".to_string(),
                session_token: "session_forged".to_string(),
                status: AgentStatus::Busy,
                metrics: HashMap::new(),
            })
            .unwrap_err();
        assert_eq!(err.code(), fleet_common::codes::UNAUTHENTICATED);

        assert_eq!(h.dispatcher.ledger().get_agent("a1").unwrap(), before);
        assert_eq!(h.task("t1").status, TaskStatus::Pending);
    }

    #[test]
    fn sticky_preference_beats_older_unassigned_tasks() {
        let h = harness();
        let token = h.register("a1");
        h.add_task("older-unassigned", "");
        h.add_task("for-a1", "a1");

        let task = h.get_task("a1", &token).unwrap();
        assert_eq!(task.task_id, "for-a1");
    }

    #[test]
    fn tasks_preferring_another_agent_are_never_taken() {
        let h = harness();
        let token = h.register("a2");
        h.add_task("for-a1", "a1");

        assert!(!h.heartbeat("a2", &token, AgentStatus::Idle));
        assert!(h.get_task("a2", &token).is_none());
        assert_eq!(h.task("for-a1").status, TaskStatus::Pending);
    }

    #[test]
    fn unassigned_tasks_are_served_oldest_first() {
        let h = harness();
        let token = h.register("a1");
        h.add_task("first", "");
        h.add_task("second", "");

        assert_eq!(h.get_task("a1", &token).unwrap().task_id, "first");
        assert_eq!(h.get_task("a1", &token).unwrap().task_id, "second");
        assert!(h.get_task("a1", &token).is_none());
    }

    #[test]
    fn stale_agent_is_never_eligible() {
        let h = harness();
        let token = h.register("a1");
        h.add_task("t1", "");
        h.clock.advance(Duration::minutes(5) + Duration::seconds(1));

        assert!(h.get_task("a1", &token).is_none());
        assert_eq!(h.task("t1").status, TaskStatus::Pending);

        let agent = h.dispatcher.ledger().get_agent("a1").unwrap();
        assert!(!agent.is_eligible(h.clock.now(), h.dispatcher.liveness()));

        // A heartbeat refreshes liveness and makes the agent eligible again.
        assert!(h.heartbeat("a1", &token, AgentStatus::Idle));
    }

    #[test]
    fn busy_agent_gets_no_task() {
        let h = harness();
        let token = h.register("a1");
        h.add_task("t1", "");

        assert!(!h.heartbeat("a1", &token, AgentStatus::Busy));
        assert!(h.get_task("a1", &token).is_none());
    }

    #[test]
    fn submit_requires_ownership() {
        let h = harness();
        let t1 = h.register("a1");
        let t2 = h.register("a2");
        h.add_task("t1", "");
        h.get_task("a1", &t1).unwrap();

        let err = h.submit("a2", &t2, "t1", true).unwrap_err();
        assert!(matches!(err, DispatchError::TaskNotOwned { .. }));
        assert_eq!(h.task("t1").status, TaskStatus::Running);

        let err = h.submit("a1", &t1, "missing", true).unwrap_err();
        assert_eq!(err, DispatchError::TaskNotFound("missing".to_string()));
    }

    #[test]
    fn failed_outcome_still_completes_and_cannot_be_resubmitted() {
        let h = harness();
        let token = h.register("a1");
        h.add_task("t1", "");
        h.get_task("a1", &token).unwrap();

        h.submit("a1", &token, "t1", false).unwrap();
        let stored = h.task("t1");
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(!stored.result.unwrap().success);

        let err = h.submit("a1", &token, "t1", true).unwrap_err();
        assert!(matches!(err, DispatchError::TaskNotOwned { .. }));
        assert!(!h.task("t1").result.unwrap().success);
    }

    #[test]
    fn sweep_fails_overdue_running_tasks_without_requeueing() {
        let h = harness();
        let token = h.register("a1");
        h.add_task("t1", "");
        let mut task = h.task("t1");
        task.timeout_seconds = 60;
        h.dispatcher.ledger().save_task(task).unwrap();
        h.add_task("t2", "");
        h.get_task("a1", &token).unwrap();

        h.clock.advance(Duration::seconds(30));
        assert!(h.dispatcher.sweep_overdue().is_empty());

        h.clock.advance(Duration::seconds(31));
        assert_eq!(h.dispatcher.sweep_overdue(), vec!["t1".to_string()]);
        let swept = h.task("t1");
        assert_eq!(swept.status, TaskStatus::Failed);
        assert!(swept.result.unwrap().error.contains("timed out"));
        // untouched: still pending, no timeout
        assert_eq!(h.task("t2").status, TaskStatus::Pending);

        let err = h.submit("a1", &token, "t1", true).unwrap_err();
        assert!(matches!(err, DispatchError::TaskNotOwned { .. }));
    }

    /// Every agent polls once, all at the same time.
    fn race_get_task(agents: usize, tasks: usize) {
        let h = harness();
        let tokens: Vec<(String, String)> = (0..agents)
            .map(|i| {
                let id = format!("agent-{i}");
                let token = h.register(&id);
                (id, token)
            })
            .collect();
        for i in 0..tasks {
            h.add_task(&format!("t{i}"), "");
        }

        let handles: Vec<_> = tokens
            .into_iter()
            .map(|(id, token)| {
                let dispatcher = Arc::clone(&h.dispatcher);
                std::thread::spawn(move || {
                    dispatcher
                        .get_task(&GetTaskRequest {
                            agent_id: id.clone(),
                            session_token: token,
                        })
                        .unwrap()
                        .task
                        .map(|t| (t.task_id, id))
                })
            })
            .collect();

        let assigned: Vec<(String, String)> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        let distinct: HashSet<&String> = assigned.iter().map(|(task, _)| task).collect();

        assert_eq!(assigned.len(), agents.min(tasks));
        assert_eq!(distinct.len(), assigned.len());
        for (task_id, agent_id) in &assigned {
            let task = h.task(task_id);
            assert_eq!(task.status, TaskStatus::Running);
            assert_eq!(&task.assigned_to, agent_id);
        }
        let left_pending = h.dispatcher.ledger().pending_tasks().len();
        assert_eq!(left_pending, tasks - agents.min(tasks));
    }

    #[test]
    fn concurrent_get_task_never_double_assigns() {
        race_get_task(16, 10);
    }

    #[test]
    fn concurrent_get_task_leaves_surplus_tasks_pending() {
        race_get_task(4, 12);
    }

    #[test]
    fn select_task_ignores_non_pending_entries() {
        let now = Utc::now();
        let mut running = Task::pending("r", "shell", "x", HashMap::new(), now);
        running.status = TaskStatus::Running;
        let pending = Task::pending("p", "shell", "x", HashMap::new(), now);

        let picked = select_task("a1", &[&running, &pending]).unwrap();
        assert_eq!(picked.id, "p");
        assert!(select_task("a1", &[&running]).is_none());
    }
}

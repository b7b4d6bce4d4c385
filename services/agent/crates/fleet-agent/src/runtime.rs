//! Agent lifecycle: Unregistered → Registered, then heartbeat and drain.
//!
//! The heartbeat loop never waits on task execution. When a heartbeat reports
//! pending work, a drain task is spawned that repeats GetTask → execute →
//! SubmitResult until no task is returned. At most one drain runs at a time.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

use fleet_common::AgentStatus;
use fleet_common::protocol::{GetTaskRequest, HeartbeatRequest, SubmitResultRequest, TaskAssignment};

use crate::client::{ClientError, ControlPlane};
use crate::executor::TaskExecutor;
use crate::identity::{Identity, Metrics};

/// An agent that has not registered yet.
pub struct Agent {
    client: Arc<dyn ControlPlane>,
    executor: TaskExecutor,
    identity: Identity,
    heartbeat_interval: Duration,
}

impl Agent {
    #[must_use]
    pub fn new(
        client: Arc<dyn ControlPlane>,
        executor: TaskExecutor,
        identity: Identity,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            client,
            executor,
            identity,
            heartbeat_interval,
        }
    }

    /// Register and move to the Registered state.
    ///
    /// # Errors
    ///
    /// Returns the [`ClientError`] from the control plane.
    pub async fn register(self) -> Result<RegisteredAgent, ClientError> {
        let resp = self
            .client
            .register(self.identity.register_request())
            .await?;
        tracing::info!(
            agent_id = %self.identity.agent_id,
            name = %self.identity.name,
            "agent registered",
        );
        Ok(RegisteredAgent {
            session: Arc::new(Session {
                client: self.client,
                executor: self.executor,
                agent_id: self.identity.agent_id,
                session_token: resp.session_token,
                metrics: Metrics::default(),
                draining: AtomicBool::new(false),
                executing: AtomicBool::new(false),
            }),
            heartbeat_interval: self.heartbeat_interval,
        })
    }
}

struct Session {
    client: Arc<dyn ControlPlane>,
    executor: TaskExecutor,
    agent_id: String,
    session_token: String,
    metrics: Metrics,
    draining: AtomicBool,
    executing: AtomicBool,
}

/// Clears the drain flag however the drain ends.
struct DrainGuard(Arc<Session>);

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.0.draining.store(false, Ordering::Release);
    }
}

impl Session {
    fn status(&self) -> AgentStatus {
        if self.executing.load(Ordering::Acquire) {
            AgentStatus::Busy
        } else {
            AgentStatus::Idle
        }
    }

    async fn send_heartbeat(&self) -> Result<bool, ClientError> {
        let resp = self
            .client
            .heartbeat(HeartbeatRequest {
                agent_id: self.agent_id.clone(),
                session_token: self.session_token.clone(),
                status: self.status(),
                metrics: self.metrics.snapshot(),
            })
            .await?;
        tracing::debug!(agent_id = %self.agent_id, has_task = resp.has_task, "heartbeat");
        Ok(resp.has_task)
    }

    async fn next_task(&self) -> Result<Option<TaskAssignment>, ClientError> {
        let req = GetTaskRequest {
            agent_id: self.agent_id.clone(),
            session_token: self.session_token.clone(),
        };
        Ok(self.client.get_task(req).await?.task)
    }

    async fn run_task(&self, task: TaskAssignment) {
        self.executing.store(true, Ordering::Release);
        let result = self.executor.execute(&task).await;
        self.executing.store(false, Ordering::Release);

        let success = result.success;
        let req = SubmitResultRequest {
            agent_id: self.agent_id.clone(),
            session_token: self.session_token.clone(),
            task_id: task.task_id.clone(),
            result,
        };
        match self.client.submit_result(req).await {
            Ok(_) => {
                self.metrics.record_completed();
                tracing::info!(task_id = %task.task_id, success, "task result submitted");
            }
            Err(e) => {
                tracing::error!(task_id = %task.task_id, error = %e, "failed to submit task result");
            }
        }
    }

    /// Process tasks until the control plane has nothing more for us.
    ///
    /// A heartbeat that lands mid-execution reports Busy, which makes the
    /// next GetTask come back empty; an Idle heartbeat afterwards tells us
    /// whether work is still waiting. A failed GetTask ends the drain; the
    /// next heartbeat tick starts another.
    async fn drain(self: Arc<Self>) -> usize {
        let _guard = DrainGuard(Arc::clone(&self));
        let mut processed = 0;
        'drain: loop {
            loop {
                match self.next_task().await {
                    Ok(Some(task)) => {
                        self.run_task(task).await;
                        processed += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(agent_id = %self.agent_id, error = %e, "get task failed");
                        break 'drain;
                    }
                }
            }
            match self.send_heartbeat().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!(agent_id = %self.agent_id, error = %e, "heartbeat after drain failed");
                    break;
                }
            }
        }
        tracing::debug!(agent_id = %self.agent_id, processed, "drain finished");
        processed
    }
}

/// An agent holding a session token.
pub struct RegisteredAgent {
    session: Arc<Session>,
    heartbeat_interval: Duration,
}

impl RegisteredAgent {
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.session.agent_id
    }

    #[must_use]
    pub fn tasks_completed(&self) -> u64 {
        self.session.metrics.tasks_completed()
    }

    /// Send one heartbeat; spawn a drain when work is waiting and none is
    /// running. Returns the drain's handle when one was started.
    ///
    /// # Errors
    ///
    /// Returns the [`ClientError`]. An Unauthenticated rejection is not
    /// retried; the agent must be restarted to register again.
    pub async fn heartbeat(&self) -> Result<Option<JoinHandle<usize>>, ClientError> {
        let has_task = self.session.send_heartbeat().await?;
        if !has_task || self.session.draining.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }
        Ok(Some(tokio::spawn(Arc::clone(&self.session).drain())))
    }

    /// Heartbeat on a fixed interval until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.heartbeat().await {
                        Ok(_) => {}
                        Err(ClientError::Unauthenticated(msg)) => {
                            tracing::error!(
                                agent_id = %self.session.agent_id,
                                %msg,
                                "session no longer valid; restart the agent to re-register",
                            );
                        }
                        Err(e) => tracing::warn!(agent_id = %self.session.agent_id, error = %e, "heartbeat failed"),
                    }
                }
                () = &mut shutdown => break,
            }
        }
        tracing::info!(agent_id = %self.session.agent_id, "agent stopping");
    }
}

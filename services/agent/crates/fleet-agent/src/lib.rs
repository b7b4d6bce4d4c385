//! Fleet agent: registers with the control plane, heartbeats, and executes
//! the tasks it is handed.

pub mod client;
pub mod command_runner;
pub mod executor;
pub mod identity;
pub mod runtime;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod test_support {
    //! Canned [`ControlPlane`] and [`CommandRunner`] doubles.

    use std::collections::{HashMap, VecDeque};
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;

    use fleet_common::protocol::{
        GetTaskRequest, GetTaskResponse, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
        RegisterResponse, SubmitResultRequest, SubmitResultResponse, TaskAssignment,
    };

    use crate::client::{ClientError, ControlPlane};
    use crate::command_runner::CommandRunner;

    pub fn assignment(id: &str, task_type: &str, parameters: HashMap<String, String>) -> TaskAssignment {
        TaskAssignment {
            task_id: id.to_string(),
            task_type: task_type.to_string(),
            command: task_type.to_string(),
            parameters,
            timeout_seconds: 0,
            created_at: 1_700_000_000,
        }
    }

    // ── Command runner ────────────────────────────────────────────────────────

    /// Records every invocation; fails those whose arguments contain a pattern.
    #[derive(Default)]
    pub struct RecordingRunner {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        fail_on: Vec<String>,
    }

    impl RecordingRunner {
        pub fn failing_on(patterns: &[&str]) -> Self {
            Self {
                calls: Mutex::default(),
                fail_on: patterns.iter().map(ToString::to_string).collect(),
            }
        }

        pub fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, program: &str, args: &[&str], _: Duration) -> Result<Output> {
            let joined = args.join(" ");
            self.calls.lock().unwrap().push((
                program.to_string(),
                args.iter().map(ToString::to_string).collect(),
            ));
            if self.fail_on.iter().any(|p| joined.contains(p.as_str())) {
                return Ok(Output {
                    status: ExitStatus::from_raw(1 << 8),
                    stdout: Vec::new(),
                    stderr: b"boom".to_vec(),
                });
            }
            Ok(Output {
                status: ExitStatus::from_raw(0),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    // ── Control plane ─────────────────────────────────────────────────────────

    /// In-memory control plane handing out a fixed queue of tasks.
    #[derive(Default)]
    pub struct FakeControlPlane {
        token: Mutex<String>,
        tasks: Mutex<VecDeque<TaskAssignment>>,
        submitted: Mutex<Vec<SubmitResultRequest>>,
        heartbeats: Mutex<Vec<HeartbeatRequest>>,
        registrations: AtomicUsize,
        get_task_unavailable: AtomicBool,
    }

    impl FakeControlPlane {
        pub fn with_tasks(tasks: Vec<TaskAssignment>) -> Self {
            Self {
                tasks: Mutex::new(tasks.into()),
                ..Self::default()
            }
        }

        pub fn token(&self) -> String {
            self.token.lock().unwrap().clone()
        }

        /// Simulate another registration for the same agent id.
        pub fn rotate_token(&self) {
            *self.token.lock().unwrap() = "session_rotated".to_string();
        }

        /// Answer every GetTask with a 503 while heartbeats keep succeeding.
        pub fn fail_get_task(&self) {
            self.get_task_unavailable.store(true, Ordering::SeqCst);
        }

        pub fn registrations(&self) -> usize {
            self.registrations.load(Ordering::SeqCst)
        }

        pub fn submitted(&self) -> Vec<SubmitResultRequest> {
            self.submitted.lock().unwrap().clone()
        }

        pub fn heartbeats(&self) -> Vec<HeartbeatRequest> {
            self.heartbeats.lock().unwrap().clone()
        }

        fn check(&self, token: &str) -> Result<(), ClientError> {
            if *self.token.lock().unwrap() == token {
                Ok(())
            } else {
                Err(ClientError::Unauthenticated("invalid session token".to_string()))
            }
        }
    }

    #[async_trait]
    impl ControlPlane for FakeControlPlane {
        async fn register(&self, _: RegisterRequest) -> Result<RegisterResponse, ClientError> {
            let n = self.registrations.fetch_add(1, Ordering::SeqCst) + 1;
            let session_token = format!("session_{n}");
            self.token.lock().unwrap().clone_from(&session_token);
            Ok(RegisterResponse { session_token })
        }

        async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse, ClientError> {
            self.check(&req.session_token)?;
            self.heartbeats.lock().unwrap().push(req);
            Ok(HeartbeatResponse {
                has_task: !self.tasks.lock().unwrap().is_empty(),
            })
        }

        async fn get_task(&self, req: GetTaskRequest) -> Result<GetTaskResponse, ClientError> {
            self.check(&req.session_token)?;
            if self.get_task_unavailable.load(Ordering::SeqCst) {
                return Err(ClientError::Server {
                    status: 503,
                    message: "service unavailable".to_string(),
                });
            }
            Ok(GetTaskResponse {
                task: self.tasks.lock().unwrap().pop_front(),
            })
        }

        async fn submit_result(
            &self,
            req: SubmitResultRequest,
        ) -> Result<SubmitResultResponse, ClientError> {
            self.check(&req.session_token)?;
            self.submitted.lock().unwrap().push(req);
            Ok(SubmitResultResponse { accepted: true })
        }
    }
}

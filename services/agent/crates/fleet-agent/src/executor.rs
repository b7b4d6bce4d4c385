//! Turns a dispatched task into shell steps and runs them.
//!
//! Every step is attempted even after an earlier one fails; the task result
//! reports success only when all of them succeeded, with every failure
//! joined into `error`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};

use fleet_common::protocol::TaskAssignment;
use fleet_common::task_kind::{is_interface_name, params};
use fleet_common::{PortForwardParams, TaskKind, TaskResult};

use crate::command_runner::CommandRunner;

const SHELL: &str = "bash";

/// Metadata keys attached to every result
pub mod meta {
    pub const EXECUTED_AT: &str = "executed_at";
    pub const STEPS: &str = "steps";
    pub const FAILED_STEPS: &str = "failed_steps";
}

/// The six iptables rules that expose `dport` on the external interface and
/// forward it to the destination.
#[must_use]
pub fn port_forward_steps(p: &PortForwardParams) -> Vec<String> {
    let PortForwardParams {
        dport,
        to_destination_ip: ip,
        to_destination_port: port,
        external_interface: iface,
    } = p;
    vec![
        format!("iptables -t nat -A PREROUTING -p tcp --dport {dport} -j DNAT --to-destination {ip}:{port}"),
        format!("iptables -t nat -A PREROUTING -p udp --dport {dport} -j DNAT --to-destination {ip}:{port}"),
        format!("iptables -t nat -A POSTROUTING -o {iface} -j MASQUERADE"),
        format!("iptables -A FORWARD -o {iface} -p tcp -d {ip} --dport {port} -m state --state NEW,ESTABLISHED,RELATED -j ACCEPT"),
        format!("iptables -A FORWARD -o {iface} -p udp -d {ip} --dport {port} -m state --state NEW,ESTABLISHED,RELATED -j ACCEPT"),
        format!("iptables -A FORWARD -i {iface} -m state --state ESTABLISHED,RELATED -j ACCEPT"),
    ]
}

pub struct TaskExecutor {
    runner: Arc<dyn CommandRunner>,
    step_timeout: Duration,
    external_interface: String,
}

impl TaskExecutor {
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        step_timeout: Duration,
        external_interface: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            step_timeout,
            external_interface: external_interface.into(),
        }
    }

    /// Shell steps for `task`, or the reason it cannot run.
    ///
    /// # Errors
    ///
    /// Returns a message for malformed parameters or an unsupported type.
    pub fn plan(&self, task: &TaskAssignment) -> Result<Vec<String>, String> {
        match TaskKind::decode(&task.task_type, &task.parameters) {
            Ok(TaskKind::PortForward(mut p)) => {
                let named = task
                    .parameters
                    .get(params::EXTERNAL_INTERFACE)
                    .is_some_and(|v| !v.trim().is_empty());
                if !named {
                    if !is_interface_name(&self.external_interface) {
                        return Err(format!(
                            "configured external interface '{}' is not a valid interface name",
                            self.external_interface
                        ));
                    }
                    p.external_interface.clone_from(&self.external_interface);
                }
                Ok(port_forward_steps(&p))
            }
            Ok(TaskKind::Shell { script }) => Ok(vec![script]),
            Ok(TaskKind::Generic { task_type, .. }) => {
                Err(format!("unsupported task type '{task_type}'"))
            }
            Err(e) => Err(format!("invalid task parameters: {e}")),
        }
    }

    /// Run every step of `task` and fold the outcomes into one result.
    pub async fn execute(&self, task: &TaskAssignment) -> TaskResult {
        let started = Instant::now();
        tracing::info!(task_id = %task.task_id, command = %task.command, "executing task");

        let steps = match self.plan(task) {
            Ok(steps) => steps,
            Err(reason) => {
                tracing::warn!(task_id = %task.task_id, %reason, "task rejected");
                return finish(started, false, String::new(), reason, 0, 0);
            }
        };

        let mut outputs = Vec::with_capacity(steps.len());
        let mut failures = Vec::new();
        for step in &steps {
            tracing::debug!(task_id = %task.task_id, step = %step, "running step");
            match self.runner.run(SHELL, &["-c", step], self.step_timeout).await {
                Ok(out) if out.status.success() => {
                    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
                    if !stdout.is_empty() {
                        outputs.push(stdout);
                    }
                }
                Ok(out) => {
                    let combined = format!(
                        "{}{}",
                        String::from_utf8_lossy(&out.stdout),
                        String::from_utf8_lossy(&out.stderr)
                    );
                    failures.push(format!(
                        "step '{step}' exited with {}: {}",
                        out.status,
                        combined.trim()
                    ));
                }
                Err(e) => failures.push(format!("step '{step}' failed: {e:#}")),
            }
        }

        let success = failures.is_empty();
        let output = if success {
            if outputs.is_empty() {
                format!("task {} completed: {} step(s) succeeded", task.task_id, steps.len())
            } else {
                outputs.join("\n")
            }
        } else {
            format!("{} of {} step(s) failed", failures.len(), steps.len())
        };
        if success {
            tracing::info!(task_id = %task.task_id, steps = steps.len(), "task succeeded");
        } else {
            tracing::warn!(
                task_id = %task.task_id,
                failed = failures.len(),
                steps = steps.len(),
                "task finished with failures",
            );
        }

        finish(
            started,
            success,
            output,
            failures.join("\n"),
            steps.len(),
            failures.len(),
        )
    }
}

fn finish(
    started: Instant,
    success: bool,
    output: String,
    error: String,
    steps: usize,
    failed_steps: usize,
) -> TaskResult {
    let metadata = HashMap::from([
        (
            meta::EXECUTED_AT.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        (meta::STEPS.to_string(), steps.to_string()),
        (meta::FAILED_STEPS.to_string(), failed_steps.to_string()),
    ]);
    TaskResult {
        success,
        output,
        error,
        execution_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        metadata,
        completed_at: None,
    }
}

//! The authority's agent directory and task table.
//!
//! Both tables sit behind a single readers-writer lock. Reads take the shared
//! side; every mutation, including the compound read-scan-write sequences of
//! the dispatch protocol, runs under the exclusive side via
//! [`Ledger::transact`]. Callers never see the underlying maps.

pub mod snapshot;

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use fleet_common::{Agent, PersistMode, Task, TaskStatus};

use crate::error::LedgerError;
pub use snapshot::SnapshotStore;

#[derive(Debug, Default)]
struct Tables {
    agents: HashMap<String, Agent>,
    tasks: HashMap<String, Task>,
    agents_dirty: bool,
    tasks_dirty: bool,
}

/// Result of a transaction: the closure's value plus the snapshot outcome.
#[derive(Debug)]
#[must_use]
pub struct Committed<R> {
    pub value: R,
    /// Outcome of the snapshot write. An error here does not undo `value`.
    pub persisted: Result<(), LedgerError>,
}

impl<R> Committed<R> {
    /// Log a persistence failure and keep the value.
    pub fn log_persist_failure(self) -> R {
        if let Err(e) = &self.persisted {
            tracing::error!(error = %e, "ledger snapshot write failed; in-memory state kept");
        }
        self.value
    }
}

/// Shared, internally serialized owner of the agent and task tables.
#[derive(Debug)]
pub struct Ledger {
    tables: RwLock<Tables>,
    store: Option<SnapshotStore>,
    mode: PersistMode,
}

impl Ledger {
    /// Memory-only ledger.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            store: None,
            mode: PersistMode::Disabled,
        }
    }

    /// Open a ledger backed by `store`, loading any existing snapshots.
    ///
    /// A missing snapshot yields an empty table. A snapshot that cannot be
    /// read or parsed is logged and only that table starts empty.
    #[must_use]
    pub fn open(store: SnapshotStore, mode: PersistMode) -> Self {
        let mut tables = Tables::default();

        match store.load_agents() {
            Ok(Some(agents)) => tables.agents = agents,
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "failed to load agent snapshot; starting empty"),
        }
        match store.load_tasks() {
            Ok(Some(tasks)) => tables.tasks = tasks,
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "failed to load task snapshot; starting empty"),
        }

        tracing::info!(
            dir = %store.dir().display(),
            agents = tables.agents.len(),
            tasks = tables.tasks.len(),
            ?mode,
            "ledger loaded",
        );

        let store = (mode != PersistMode::Disabled).then_some(store);
        Self {
            tables: RwLock::new(tables),
            store,
            mode,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to both tables.
    ///
    /// In [`PersistMode::Immediate`] every table the closure touched is
    /// written out before the lock is released.
    pub fn transact<R>(&self, f: impl FnOnce(&mut LedgerTxn<'_>) -> R) -> Committed<R> {
        let mut tables = self.write();
        let value = f(&mut LedgerTxn {
            tables: &mut *tables,
        });
        let persisted = if self.mode == PersistMode::Immediate {
            self.persist(&mut tables)
        } else {
            Ok(())
        };
        Committed { value, persisted }
    }

    /// Write any dirty table. Used by the deferred flusher and at shutdown.
    ///
    /// # Errors
    ///
    /// Returns the first snapshot write failure; dirty flags stay set so the
    /// next flush retries.
    pub fn flush(&self) -> Result<(), LedgerError> {
        let mut tables = self.write();
        self.persist(&mut tables)
    }

    fn persist(&self, tables: &mut Tables) -> Result<(), LedgerError> {
        let Some(store) = &self.store else {
            tables.agents_dirty = false;
            tables.tasks_dirty = false;
            return Ok(());
        };
        if tables.agents_dirty {
            store.write_agents(&tables.agents)?;
            tables.agents_dirty = false;
        }
        if tables.tasks_dirty {
            store.write_tasks(&tables.tasks)?;
            tables.tasks_dirty = false;
        }
        Ok(())
    }

    // ── Agents ────────────────────────────────────────────────────────────

    #[must_use]
    pub fn get_agent(&self, id: &str) -> Option<Agent> {
        self.read().agents.get(id).cloned()
    }

    /// All agents, ordered by id.
    #[must_use]
    pub fn list_agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.read().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// # Errors
    ///
    /// Returns a persistence error; the agent is stored regardless.
    pub fn save_agent(&self, agent: Agent) -> Result<(), LedgerError> {
        self.transact(|tx| tx.save_agent(agent)).persisted
    }

    /// Remove an agent. `Ok(false)` when it did not exist.
    ///
    /// # Errors
    ///
    /// Returns a persistence error; the agent is removed regardless.
    pub fn delete_agent(&self, id: &str) -> Result<bool, LedgerError> {
        let committed = self.transact(|tx| tx.delete_agent(id));
        committed.persisted.map(|()| committed.value)
    }

    // ── Tasks ─────────────────────────────────────────────────────────────

    #[must_use]
    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.read().tasks.get(id).cloned()
    }

    /// All tasks, oldest first.
    #[must_use]
    pub fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.read().tasks.values().cloned().collect();
        sort_oldest_first(&mut tasks);
        tasks
    }

    /// Tasks with status Pending, oldest first.
    #[must_use]
    pub fn pending_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .read()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        sort_oldest_first(&mut tasks);
        tasks
    }

    /// Upsert a task.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StatusRegression`] (nothing stored) when the
    /// update would move an existing task's status backwards, or a
    /// persistence error (task stored regardless).
    pub fn save_task(&self, task: Task) -> Result<(), LedgerError> {
        let committed = self.transact(|tx| tx.save_task(task));
        committed.value?;
        committed.persisted
    }

    /// Remove a task. `Ok(false)` when it did not exist.
    ///
    /// # Errors
    ///
    /// Returns a persistence error; the task is removed regardless.
    pub fn delete_task(&self, id: &str) -> Result<bool, LedgerError> {
        let committed = self.transact(|tx| tx.delete_task(id));
        committed.persisted.map(|()| committed.value)
    }
}

fn sort_oldest_first(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Exclusive view of the tables for the duration of one [`Ledger::transact`].
pub struct LedgerTxn<'a> {
    tables: &'a mut Tables,
}

impl LedgerTxn<'_> {
    #[must_use]
    pub fn get_agent(&self, id: &str) -> Option<&Agent> {
        self.tables.agents.get(id)
    }

    pub fn save_agent(&mut self, agent: Agent) {
        self.tables.agents.insert(agent.id.clone(), agent);
        self.tables.agents_dirty = true;
    }

    pub fn delete_agent(&mut self, id: &str) -> bool {
        let removed = self.tables.agents.remove(id).is_some();
        self.tables.agents_dirty |= removed;
        removed
    }

    #[must_use]
    pub fn get_task(&self, id: &str) -> Option<&Task> {
        self.tables.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tables.tasks.values()
    }

    /// Pending tasks, oldest first.
    #[must_use]
    pub fn pending_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tables
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Upsert a task, refusing any backwards status move.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StatusRegression`] and leaves the table untouched.
    pub fn save_task(&mut self, task: Task) -> Result<(), LedgerError> {
        if let Some(existing) = self.tables.tasks.get(&task.id)
            && existing.status != task.status
            && !existing.status.can_transition_to(task.status)
        {
            return Err(LedgerError::StatusRegression {
                task_id: task.id,
                from: existing.status,
                to: task.status,
            });
        }
        self.tables.tasks.insert(task.id.clone(), task);
        self.tables.tasks_dirty = true;
        Ok(())
    }

    pub fn delete_task(&mut self, id: &str) -> bool {
        let removed = self.tables.tasks.remove(id).is_some();
        self.tables.tasks_dirty |= removed;
        removed
    }
}

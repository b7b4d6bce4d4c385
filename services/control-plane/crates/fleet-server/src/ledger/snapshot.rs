//! Whole-table JSON snapshots.
//!
//! Each table lives in its own file as an object keyed by record id. Writes
//! go to a temp file that is renamed over the snapshot so a crash never
//! leaves a half-written table behind.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use fleet_common::{Agent, Task};

use crate::error::LedgerError;

pub const AGENTS_FILE: &str = "agents.json";
pub const TASKS_FILE: &str = "tasks.json";

/// Snapshot files under one data directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn agents_path(&self) -> PathBuf {
        self.dir.join(AGENTS_FILE)
    }

    fn tasks_path(&self) -> PathBuf {
        self.dir.join(TASKS_FILE)
    }

    /// `Ok(None)` when no snapshot has been written yet.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Read`] or [`LedgerError::Corrupt`].
    pub fn load_agents(&self) -> Result<Option<HashMap<String, Agent>>, LedgerError> {
        load_table(&self.agents_path())
    }

    /// # Errors
    ///
    /// Returns [`LedgerError::Read`] or [`LedgerError::Corrupt`].
    pub fn load_tasks(&self) -> Result<Option<HashMap<String, Task>>, LedgerError> {
        load_table(&self.tasks_path())
    }

    /// # Errors
    ///
    /// Returns [`LedgerError::Serialize`] or [`LedgerError::Write`].
    pub fn write_agents(&self, agents: &HashMap<String, Agent>) -> Result<(), LedgerError> {
        write_table(&self.agents_path(), "agent", agents)
    }

    /// # Errors
    ///
    /// Returns [`LedgerError::Serialize`] or [`LedgerError::Write`].
    pub fn write_tasks(&self, tasks: &HashMap<String, Task>) -> Result<(), LedgerError> {
        write_table(&self.tasks_path(), "task", tasks)
    }
}

fn load_table<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<HashMap<String, T>>, LedgerError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LedgerError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| LedgerError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

fn write_table<T: Serialize>(
    path: &Path,
    table: &'static str,
    records: &HashMap<String, T>,
) -> Result<(), LedgerError> {
    // Sorted keys keep snapshots diffable.
    let ordered: BTreeMap<&String, &T> = records.iter().collect();
    let content = serde_json::to_string_pretty(&ordered)
        .map_err(|source| LedgerError::Serialize { table, source })?;

    let write_err = |source| LedgerError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, content).map_err(write_err)?;
    std::fs::rename(&temp_path, path).map_err(write_err)?;
    Ok(())
}

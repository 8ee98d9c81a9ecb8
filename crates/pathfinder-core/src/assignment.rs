//! User ↔ robot assignment persistence.
//!
//! The coordinator only consumes this table; it never owns it. A JSON-file
//! store is provided for single-node deployments, plus an in-memory store for
//! tests and ephemeral setups.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Durable key-value table queried by user id.
pub trait AssignmentStore: Send + Sync {
    /// Robots assigned to `user_id`, oldest assignment first.
    fn get_assigned_robots(&self, user_id: &str) -> Vec<String>;

    /// Record that `user_id` uses `robot_id`. Re-assigning moves it to the end.
    fn persist_assignment(&self, user_id: &str, robot_id: &str) -> anyhow::Result<()>;

    /// Drop every assignment that references `robot_id`.
    fn remove_robot(&self, robot_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentEntry {
    pub robot_id: String,
    pub assigned_at: DateTime<Utc>,
}

type AssignmentTable = HashMap<String, Vec<AssignmentEntry>>;

fn upsert(table: &mut AssignmentTable, user_id: &str, robot_id: &str) {
    let entries = table.entry(user_id.to_string()).or_default();
    entries.retain(|e| e.robot_id != robot_id);
    entries.push(AssignmentEntry {
        robot_id: robot_id.to_string(),
        assigned_at: Utc::now(),
    });
}

fn remove(table: &mut AssignmentTable, robot_id: &str) -> bool {
    let mut changed = false;
    for entries in table.values_mut() {
        let before = entries.len();
        entries.retain(|e| e.robot_id != robot_id);
        changed |= entries.len() != before;
    }
    table.retain(|_, entries| !entries.is_empty());
    changed
}

/// Assignment table persisted as a single JSON file.
///
/// Read-modify-write cycles are serialized through `write_lock`, and each
/// write lands in a temp file that is renamed over the table.
pub struct JsonAssignmentStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonAssignmentStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// The whole table. A missing file is an empty table; an unreadable one
    /// is an error so a later write cannot silently replace it.
    fn load_all(&self) -> anyhow::Result<AssignmentTable> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("corrupt assignment table {}", self.path.display()))
    }

    fn save_all(&self, data: &AssignmentTable) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update<F>(&self, change: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut AssignmentTable) -> bool,
    {
        let _guard = self.write_lock.lock().unwrap();
        let mut data = self.load_all()?;
        if change(&mut data) {
            self.save_all(&data)?;
        }
        Ok(())
    }

    /// All entries, keyed by user id.
    pub fn list(&self) -> anyhow::Result<AssignmentTable> {
        self.load_all()
    }
}

impl AssignmentStore for JsonAssignmentStore {
    fn get_assigned_robots(&self, user_id: &str) -> Vec<String> {
        match self.load_all() {
            Ok(mut data) => data
                .remove(user_id)
                .unwrap_or_default()
                .into_iter()
                .map(|e| e.robot_id)
                .collect(),
            Err(e) => {
                warn!("{e:#}");
                Vec::new()
            }
        }
    }

    fn persist_assignment(&self, user_id: &str, robot_id: &str) -> anyhow::Result<()> {
        self.update(|data| {
            upsert(data, user_id, robot_id);
            true
        })
    }

    fn remove_robot(&self, robot_id: &str) -> anyhow::Result<()> {
        self.update(|data| remove(data, robot_id))
    }
}

/// Non-durable store, lost on restart.
#[derive(Default)]
pub struct MemoryAssignmentStore {
    table: Mutex<AssignmentTable>,
}

impl MemoryAssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AssignmentStore for MemoryAssignmentStore {
    fn get_assigned_robots(&self, user_id: &str) -> Vec<String> {
        let table = self.table.lock().unwrap();
        table
            .get(user_id)
            .map(|entries| entries.iter().map(|e| e.robot_id.clone()).collect())
            .unwrap_or_default()
    }

    fn persist_assignment(&self, user_id: &str, robot_id: &str) -> anyhow::Result<()> {
        let mut table = self.table.lock().unwrap();
        upsert(&mut table, user_id, robot_id);
        Ok(())
    }

    fn remove_robot(&self, robot_id: &str) -> anyhow::Result<()> {
        let mut table = self.table.lock().unwrap();
        remove(&mut table, robot_id);
        Ok(())
    }
}

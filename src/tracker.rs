//! Task-tracking collaborator.
//!
//! The engine only ever creates, updates, or flags tasks as obsolete. Lookup
//! by external key goes through the task map, never through the tracker.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::RwLock;
use thiserror::Error;
use uuid::Uuid;

/// Identifier assigned by the task store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh random identifier for local trackers.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fields sent when a new work item is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub category: String,
    pub target_date: NaiveDate,
    pub assignee: Option<String>,
}

/// Fields refreshed on an existing work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub target_date: NaiveDate,
    pub assignee: Option<String>,
    pub category: Option<String>,
}

/// The task store rejected a write.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Task store rejected create of '{name}': {reason}")]
    CreateRejected { name: String, reason: String },

    #[error("Task store rejected update of task {task_id}: {reason}")]
    UpdateRejected { task_id: TaskId, reason: String },

    #[error("Task {0} not found in task store")]
    NotFound(TaskId),

    #[error("Task store unavailable: {0}")]
    Unavailable(String),
}

/// Consumed interface of the external task-tracking system.
pub trait TaskTracker: Send + Sync {
    fn create_task(&self, task: &NewTask) -> Result<TaskId, TrackerError>;

    /// Refresh date/assignee/category. Also clears an obsolete marker.
    fn update_task(&self, task_id: &TaskId, update: &TaskUpdate) -> Result<(), TrackerError>;

    fn mark_obsolete(&self, task_id: &TaskId) -> Result<(), TrackerError>;
}

/// A work item as held by a local tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTask {
    pub id: TaskId,
    pub name: String,
    pub category: String,
    pub target_date: NaiveDate,
    pub assignee: Option<String>,
    pub obsolete: bool,
}

/// In-memory tracker (non-persistent, for testing).
#[derive(Default)]
pub struct InMemoryTaskTracker {
    tasks: RwLock<HashMap<TaskId, TrackedTask>>,
    rejected_names: RwLock<HashSet<String>>,
    writes: RwLock<u64>,
}

impl InMemoryTaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every future create whose name is `name`.
    pub fn reject_creates_named(&self, name: &str) {
        if let Ok(mut rejected) = self.rejected_names.write() {
            rejected.insert(name.to_string());
        }
    }

    pub fn tasks(&self) -> Vec<TrackedTask> {
        let mut tasks: Vec<TrackedTask> = self
            .tasks
            .read()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        tasks.sort_by(|a, b| a.target_date.cmp(&b.target_date).then(a.name.cmp(&b.name)));
        tasks
    }

    pub fn get(&self, task_id: &TaskId) -> Option<TrackedTask> {
        self.tasks.read().ok()?.get(task_id).cloned()
    }

    /// Number of successful writes (create, update, obsolete) seen so far.
    pub fn write_count(&self) -> u64 {
        self.writes.read().map(|w| *w).unwrap_or(0)
    }

    fn bump_writes(&self) -> Result<(), TrackerError> {
        let mut writes = self
            .writes
            .write()
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?;
        *writes += 1;
        Ok(())
    }
}

impl TaskTracker for InMemoryTaskTracker {
    fn create_task(&self, task: &NewTask) -> Result<TaskId, TrackerError> {
        let rejected = self
            .rejected_names
            .read()
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?
            .contains(&task.name);
        if rejected {
            return Err(TrackerError::CreateRejected {
                name: task.name.clone(),
                reason: "rejected by task store".to_string(),
            });
        }
        let id = TaskId::generate();
        self.tasks
            .write()
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?
            .insert(
                id.clone(),
                TrackedTask {
                    id: id.clone(),
                    name: task.name.clone(),
                    category: task.category.clone(),
                    target_date: task.target_date,
                    assignee: task.assignee.clone(),
                    obsolete: false,
                },
            );
        self.bump_writes()?;
        Ok(id)
    }

    fn update_task(&self, task_id: &TaskId, update: &TaskUpdate) -> Result<(), TrackerError> {
        {
            let mut tasks = self
                .tasks
                .write()
                .map_err(|e| TrackerError::Unavailable(e.to_string()))?;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| TrackerError::NotFound(task_id.clone()))?;
            task.target_date = update.target_date;
            task.assignee = update.assignee.clone();
            if let Some(category) = &update.category {
                task.category = category.clone();
            }
            task.obsolete = false;
        }
        self.bump_writes()
    }

    fn mark_obsolete(&self, task_id: &TaskId) -> Result<(), TrackerError> {
        {
            let mut tasks = self
                .tasks
                .write()
                .map_err(|e| TrackerError::Unavailable(e.to_string()))?;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| TrackerError::NotFound(task_id.clone()))?;
            task.obsolete = true;
        }
        self.bump_writes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task(name: &str) -> NewTask {
        NewTask {
            name: name.to_string(),
            category: "payroll".to_string(),
            target_date: NaiveDate::from_ymd_opt(2025, 12, 23).unwrap(),
            assignee: None,
        }
    }

    #[test]
    fn create_update_and_obsolete() {
        let tracker = InMemoryTaskTracker::new();
        let id = tracker.create_task(&new_task("Payroll - Prepare")).unwrap();

        tracker
            .update_task(
                &id,
                &TaskUpdate {
                    target_date: NaiveDate::from_ymd_opt(2025, 12, 22).unwrap(),
                    assignee: Some("alice".to_string()),
                    category: None,
                },
            )
            .unwrap();
        tracker.mark_obsolete(&id).unwrap();

        let task = tracker.get(&id).unwrap();
        assert_eq!(task.assignee.as_deref(), Some("alice"));
        assert_eq!(task.category, "payroll");
        assert!(task.obsolete);
        assert_eq!(tracker.write_count(), 3);
    }

    #[test]
    fn rejected_creates_fail_without_side_effects() {
        let tracker = InMemoryTaskTracker::new();
        tracker.reject_creates_named("Broken");
        assert!(matches!(
            tracker.create_task(&new_task("Broken")),
            Err(TrackerError::CreateRejected { .. })
        ));
        assert!(tracker.tasks().is_empty());
        assert_eq!(tracker.write_count(), 0);
    }

    #[test]
    fn updating_unknown_task_is_not_found() {
        let tracker = InMemoryTaskTracker::new();
        let missing = TaskId::new("nope");
        let update = TaskUpdate {
            target_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            assignee: None,
            category: None,
        };
        assert_eq!(
            tracker.update_task(&missing, &update),
            Err(TrackerError::NotFound(missing.clone()))
        );
    }
}

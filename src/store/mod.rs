//! Storage module with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database; also hosts a local task tracker
//!
//! The task map (`external_key` → task) is the single source of truth for
//! idempotency: every backend rejects a second entry for the same key with
//! [`StoreError::DuplicateExternalKey`].

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::run::GenerationRun;
use crate::seed::{NaturalKey, Scope, SeedStep, SeedTemplate};
use crate::tracker::{TaskId, TaskTracker};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("External key already mapped: {0}")]
    DuplicateExternalKey(String),

    #[error("Template code '{code}' already belongs to another template")]
    TemplateCodeConflict { code: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Run {0} is already finalized")]
    RunFinalized(Uuid),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Durable link between an external key and a task in the task store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMapEntry {
    pub external_key: String,
    pub cycle_key: String,
    pub template_code: String,
    pub step_code: String,
    pub category: String,
    pub deadline: Option<NaiveDate>,
    /// `None` while a claim has not yet been attached to a created task.
    pub task_id: Option<TaskId>,
    pub seed_hash: String,
    pub obsolete: bool,
    pub created_run: Uuid,
    pub last_run: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whether an upsert created or refreshed a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Versioned seed definitions.
pub trait SeedStore: Send + Sync {
    /// Insert or refresh a template's own fields, keyed by its natural key.
    /// Steps are left untouched.
    fn upsert_template(&self, template: &SeedTemplate) -> Result<UpsertOutcome, StoreError>;

    /// Delete every step of the template and insert `steps` in their place.
    fn replace_steps(&self, key: &NaturalKey, steps: &[SeedStep]) -> Result<usize, StoreError>;

    /// Active templates inside `scope`, each with steps in sequence order.
    fn list_templates(&self, scope: &Scope) -> Result<Vec<SeedTemplate>, StoreError>;

    fn set_current_seed(&self, seed_id: &str) -> Result<(), StoreError>;

    fn current_seed(&self) -> Result<Option<String>, StoreError>;
}

/// Generated-task map.
pub trait TaskMapStore: Send + Sync {
    fn get_entry(&self, external_key: &str) -> Result<Option<TaskMapEntry>, StoreError>;

    /// Insert a new entry. Fails with `DuplicateExternalKey` if the key exists.
    fn claim_entry(&self, entry: &TaskMapEntry) -> Result<(), StoreError>;

    /// Record the task created for a claimed key.
    fn attach_task(&self, external_key: &str, task_id: &TaskId, run: Uuid)
        -> Result<(), StoreError>;

    /// Store a new hash and clear the obsolete flag.
    fn refresh_entry(&self, external_key: &str, seed_hash: &str, run: Uuid)
        -> Result<(), StoreError>;

    fn mark_entry_obsolete(&self, external_key: &str, run: Uuid) -> Result<(), StoreError>;

    /// All entries (obsolete included) recorded for a cycle key.
    fn entries_for_cycle(&self, cycle_key: &str) -> Result<Vec<TaskMapEntry>, StoreError>;
}

/// Generation run audit log.
pub trait RunLog: Send + Sync {
    fn record_run_started(&self, run: &GenerationRun) -> Result<(), StoreError>;

    /// Persist the final state. A run can only be finalized once.
    fn record_run_finalized(&self, run: &GenerationRun) -> Result<(), StoreError>;

    fn get_run(&self, id: Uuid) -> Result<Option<GenerationRun>, StoreError>;

    /// Most recent runs first.
    fn list_runs(&self, limit: usize) -> Result<Vec<GenerationRun>, StoreError>;
}

/// Everything the engine needs from one storage backend.
pub trait Backend: Send + Sync {
    fn seeds(&self) -> &dyn SeedStore;
    fn task_map(&self) -> &dyn TaskMapStore;
    fn runs(&self) -> &dyn RunLog;
    fn tracker(&self) -> &dyn TaskTracker;
}

/// Store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    Memory,
    #[default]
    Sqlite,
}

impl FromStr for StoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" | "db" => Ok(Self::Sqlite),
            other => Err(format!("unknown store '{}'", other)),
        }
    }
}

/// Create a backend based on type and configuration.
pub fn create_store(
    store_type: StoreType,
    data_dir: PathBuf,
) -> Result<Box<dyn Backend>, StoreError> {
    match store_type {
        StoreType::Memory => Ok(Box::new(InMemoryStore::new())),
        StoreType::Sqlite => {
            let store = SqliteStore::open_in_dir(&data_dir)?;
            Ok(Box::new(store))
        }
    }
}

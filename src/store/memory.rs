//! In-memory store (non-persistent).

use super::{
    Backend, RunLog, SeedStore, StoreError, TaskMapEntry, TaskMapStore, UpsertOutcome,
};
use crate::run::GenerationRun;
use crate::seed::{NaturalKey, Scope, SeedStep, SeedTemplate};
use crate::tracker::{InMemoryTaskTracker, TaskId, TaskTracker};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryStore {
    /// Templates keyed by `NaturalKey::storage_key()`.
    templates: RwLock<HashMap<String, SeedTemplate>>,
    current_seed: RwLock<Option<String>>,
    entries: RwLock<HashMap<String, TaskMapEntry>>,
    runs: RwLock<Vec<GenerationRun>>,
    tracker: InMemoryTaskTracker,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The local tracker served through [`Backend::tracker`].
    pub fn local_tracker(&self) -> &InMemoryTaskTracker {
        &self.tracker
    }

    /// Every map entry, for assertions in tests.
    pub fn all_entries(&self) -> Vec<TaskMapEntry> {
        self.entries
            .read()
            .map(|e| e.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read().map_err(|e| StoreError::Backend(e.to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write().map_err(|e| StoreError::Backend(e.to_string()))
}

impl SeedStore for InMemoryStore {
    fn upsert_template(&self, template: &SeedTemplate) -> Result<UpsertOutcome, StoreError> {
        let mut templates = write(&self.templates)?;
        let key = template.natural_key().storage_key();

        let code_taken = templates
            .iter()
            .any(|(k, t)| *k != key && t.code == template.code);
        if code_taken {
            return Err(StoreError::TemplateCodeConflict {
                code: template.code.clone(),
            });
        }

        match templates.get_mut(&key) {
            Some(existing) => {
                let steps = std::mem::take(&mut existing.steps);
                *existing = SeedTemplate {
                    steps,
                    ..template.clone()
                };
                Ok(UpsertOutcome::Updated)
            }
            None => {
                templates.insert(
                    key,
                    SeedTemplate {
                        steps: Vec::new(),
                        ..template.clone()
                    },
                );
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    fn replace_steps(&self, key: &NaturalKey, steps: &[SeedStep]) -> Result<usize, StoreError> {
        let mut templates = write(&self.templates)?;
        let storage_key = key.storage_key();
        let template = templates
            .get_mut(&storage_key)
            .ok_or(StoreError::NotFound(storage_key))?;
        let mut steps = steps.to_vec();
        steps.sort_by_key(|s| s.sequence);
        template.steps = steps;
        Ok(template.steps.len())
    }

    fn list_templates(&self, scope: &Scope) -> Result<Vec<SeedTemplate>, StoreError> {
        let templates = read(&self.templates)?;
        let mut out: Vec<SeedTemplate> = templates
            .values()
            .filter(|t| t.active && scope.includes(&t.category, &t.code))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(out)
    }

    fn set_current_seed(&self, seed_id: &str) -> Result<(), StoreError> {
        *write(&self.current_seed)? = Some(seed_id.to_string());
        Ok(())
    }

    fn current_seed(&self) -> Result<Option<String>, StoreError> {
        Ok(read(&self.current_seed)?.clone())
    }
}

impl TaskMapStore for InMemoryStore {
    fn get_entry(&self, external_key: &str) -> Result<Option<TaskMapEntry>, StoreError> {
        Ok(read(&self.entries)?.get(external_key).cloned())
    }

    fn claim_entry(&self, entry: &TaskMapEntry) -> Result<(), StoreError> {
        let mut entries = write(&self.entries)?;
        if entries.contains_key(&entry.external_key) {
            return Err(StoreError::DuplicateExternalKey(entry.external_key.clone()));
        }
        entries.insert(entry.external_key.clone(), entry.clone());
        Ok(())
    }

    fn attach_task(
        &self,
        external_key: &str,
        task_id: &TaskId,
        run: Uuid,
    ) -> Result<(), StoreError> {
        let mut entries = write(&self.entries)?;
        let entry = entries
            .get_mut(external_key)
            .ok_or_else(|| StoreError::NotFound(external_key.to_string()))?;
        entry.task_id = Some(task_id.clone());
        entry.last_run = run;
        entry.updated_at = Utc::now();
        Ok(())
    }

    fn refresh_entry(
        &self,
        external_key: &str,
        seed_hash: &str,
        run: Uuid,
    ) -> Result<(), StoreError> {
        let mut entries = write(&self.entries)?;
        let entry = entries
            .get_mut(external_key)
            .ok_or_else(|| StoreError::NotFound(external_key.to_string()))?;
        entry.seed_hash = seed_hash.to_string();
        entry.obsolete = false;
        entry.last_run = run;
        entry.updated_at = Utc::now();
        Ok(())
    }

    fn mark_entry_obsolete(&self, external_key: &str, run: Uuid) -> Result<(), StoreError> {
        let mut entries = write(&self.entries)?;
        let entry = entries
            .get_mut(external_key)
            .ok_or_else(|| StoreError::NotFound(external_key.to_string()))?;
        entry.obsolete = true;
        entry.last_run = run;
        entry.updated_at = Utc::now();
        Ok(())
    }

    fn entries_for_cycle(&self, cycle_key: &str) -> Result<Vec<TaskMapEntry>, StoreError> {
        let mut out: Vec<TaskMapEntry> = read(&self.entries)?
            .values()
            .filter(|e| e.cycle_key == cycle_key)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.external_key.cmp(&b.external_key));
        Ok(out)
    }
}

impl RunLog for InMemoryStore {
    fn record_run_started(&self, run: &GenerationRun) -> Result<(), StoreError> {
        let mut runs = write(&self.runs)?;
        runs.retain(|r| r.id() != run.id());
        runs.push(run.clone());
        Ok(())
    }

    fn record_run_finalized(&self, run: &GenerationRun) -> Result<(), StoreError> {
        let mut runs = write(&self.runs)?;
        match runs.iter_mut().find(|r| r.id() == run.id()) {
            Some(existing) if existing.status().is_final() => {
                Err(StoreError::RunFinalized(run.id()))
            }
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => {
                runs.push(run.clone());
                Ok(())
            }
        }
    }

    fn get_run(&self, id: Uuid) -> Result<Option<GenerationRun>, StoreError> {
        Ok(read(&self.runs)?.iter().find(|r| r.id() == id).cloned())
    }

    fn list_runs(&self, limit: usize) -> Result<Vec<GenerationRun>, StoreError> {
        let runs = read(&self.runs)?;
        Ok(runs.iter().rev().take(limit).cloned().collect())
    }
}

impl Backend for InMemoryStore {
    fn seeds(&self) -> &dyn SeedStore {
        self
    }

    fn task_map(&self) -> &dyn TaskMapStore {
        self
    }

    fn runs(&self) -> &dyn RunLog {
        self
    }

    fn tracker(&self) -> &dyn TaskTracker {
        &self.tracker
    }
}

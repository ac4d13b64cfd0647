//! SQLite-based store. Also serves as a local task tracker.

use super::{
    Backend, RunLog, SeedStore, StoreError, TaskMapEntry, TaskMapStore, UpsertOutcome,
};
use crate::calendar::DATE_FORMAT;
use crate::run::GenerationRun;
use crate::seed::{
    ActivityKind, AnchorRule, DateRule, NaturalKey, ScheduleKey, Scope, SeedStep, SeedTemplate,
};
use crate::tracker::{NewTask, TaskId, TaskTracker, TaskUpdate, TrackedTask, TrackerError};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS seed_templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    natural_key TEXT NOT NULL UNIQUE,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    anchor_rule TEXT NOT NULL DEFAULT 'month_end',
    form TEXT,
    period TEXT,
    deadline TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS seed_steps (
    template_id INTEGER NOT NULL,
    sequence INTEGER NOT NULL,
    activity TEXT NOT NULL,
    role_code TEXT NOT NULL,
    date_rule TEXT NOT NULL,
    PRIMARY KEY (template_id, sequence, activity),
    FOREIGN KEY (template_id) REFERENCES seed_templates(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS seed_meta (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_map (
    external_key TEXT PRIMARY KEY NOT NULL,
    cycle_key TEXT NOT NULL,
    template_code TEXT NOT NULL,
    step_code TEXT NOT NULL,
    category TEXT NOT NULL,
    deadline TEXT,
    task_id TEXT,
    seed_hash TEXT NOT NULL,
    obsolete INTEGER NOT NULL DEFAULT 0,
    created_run TEXT NOT NULL,
    last_run TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_map_cycle ON task_map(cycle_key);

CREATE TABLE IF NOT EXISTS generation_runs (
    id TEXT PRIMARY KEY NOT NULL,
    seed_id TEXT NOT NULL,
    cycle_key TEXT NOT NULL,
    status TEXT NOT NULL,
    dry_run INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    run_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_started ON generation_runs(started_at DESC);

CREATE TABLE IF NOT EXISTS tracked_tasks (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    target_date TEXT NOT NULL,
    assignee TEXT,
    obsolete INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const DB_FILE: &str = "seed-reconciler.db";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

fn now_string() -> String {
    Utc::now().to_rfc3339()
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(value: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|e| StoreError::Backend(format!("bad stored date '{}': {}", value, e)))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad stored timestamp '{}': {}", value, e)))
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value)
        .map_err(|e| StoreError::Backend(format!("bad stored uuid '{}': {}", value, e)))
}

impl SqliteStore {
    /// Open (or create) the database file inside `dir`.
    pub fn open_in_dir(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| StoreError::Backend(format!("Failed to create store dir: {}", e)))?;
        Self::open(&dir.join(DB_FILE))
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Backend(format!("Failed to open SQLite database: {}", e)))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Backend(format!("Failed to run schema: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    /// Tasks held by the local tracker table.
    pub fn tracked_tasks(&self) -> Result<Vec<TrackedTask>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, category, target_date, assignee, obsolete
                 FROM tracked_tasks ORDER BY target_date, name",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)? != 0,
                ))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(id, name, category, target_date, assignee, obsolete)| {
                Ok(TrackedTask {
                    id: TaskId::new(id),
                    name,
                    category,
                    target_date: parse_date(&target_date)?,
                    assignee,
                    obsolete,
                })
            })
            .collect()
    }

    fn load_steps(conn: &Connection, template_id: i64) -> Result<Vec<SeedStep>, StoreError> {
        let mut stmt = conn
            .prepare(
                "SELECT sequence, activity, role_code, date_rule
                 FROM seed_steps WHERE template_id = ?1
                 ORDER BY sequence, activity",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![template_id], |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(sequence, activity, role_code, date_rule)| {
                Ok(SeedStep {
                    sequence,
                    activity: ActivityKind::parse(&activity).ok_or_else(|| {
                        StoreError::Backend(format!("unknown activity '{}'", activity))
                    })?,
                    role_code,
                    date_rule: DateRule::parse_canonical(&date_rule).ok_or_else(|| {
                        StoreError::Backend(format!("unknown date rule '{}'", date_rule))
                    })?,
                })
            })
            .collect()
    }

    fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
        Ok(RawEntry {
            external_key: row.get(0)?,
            cycle_key: row.get(1)?,
            template_code: row.get(2)?,
            step_code: row.get(3)?,
            category: row.get(4)?,
            deadline: row.get(5)?,
            task_id: row.get(6)?,
            seed_hash: row.get(7)?,
            obsolete: row.get::<_, i64>(8)? != 0,
            created_run: row.get(9)?,
            last_run: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn touch_entry(
        &self,
        sql: &str,
        external_key: &str,
        value: Option<&str>,
        run: Uuid,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                sql,
                params![external_key, value, run.to_string(), now_string()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound(external_key.to_string()));
        }
        Ok(())
    }
}

const ENTRY_COLUMNS: &str = "external_key, cycle_key, template_code, step_code, category,
    deadline, task_id, seed_hash, obsolete, created_run, last_run, created_at, updated_at";

/// Row shape of `task_map` before text columns are decoded.
struct RawEntry {
    external_key: String,
    cycle_key: String,
    template_code: String,
    step_code: String,
    category: String,
    deadline: Option<String>,
    task_id: Option<String>,
    seed_hash: String,
    obsolete: bool,
    created_run: String,
    last_run: String,
    created_at: String,
    updated_at: String,
}

impl RawEntry {
    fn decode(self) -> Result<TaskMapEntry, StoreError> {
        Ok(TaskMapEntry {
            deadline: self.deadline.as_deref().map(parse_date).transpose()?,
            task_id: self.task_id.map(TaskId::new),
            created_run: parse_uuid(&self.created_run)?,
            last_run: parse_uuid(&self.last_run)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            external_key: self.external_key,
            cycle_key: self.cycle_key,
            template_code: self.template_code,
            step_code: self.step_code,
            category: self.category,
            seed_hash: self.seed_hash,
            obsolete: self.obsolete,
        })
    }
}

impl SeedStore for SqliteStore {
    fn upsert_template(&self, template: &SeedTemplate) -> Result<UpsertOutcome, StoreError> {
        let conn = self.conn()?;
        let natural_key = template.natural_key().storage_key();

        let code_taken = conn
            .prepare("SELECT 1 FROM seed_templates WHERE code = ?1 AND natural_key != ?2")
            .map_err(db_err)?
            .exists(params![template.code, natural_key])
            .map_err(db_err)?;
        if code_taken {
            return Err(StoreError::TemplateCodeConflict {
                code: template.code.clone(),
            });
        }

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM seed_templates WHERE natural_key = ?1",
                params![natural_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        let (form, period, deadline) = match &template.schedule {
            Some(s) => (
                Some(s.form.as_str()),
                Some(s.period.as_str()),
                Some(format_date(s.deadline)),
            ),
            None => (None, None, None),
        };

        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE seed_templates
                     SET code = ?2, name = ?3, category = ?4, anchor_rule = ?5, form = ?6,
                         period = ?7, deadline = ?8, active = ?9, updated_at = ?10
                     WHERE id = ?1",
                    params![
                        id,
                        template.code,
                        template.name,
                        template.category,
                        template.anchor_rule.as_str(),
                        form,
                        period,
                        deadline,
                        template.active as i64,
                        now_string(),
                    ],
                )
                .map_err(db_err)?;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                conn.execute(
                    "INSERT INTO seed_templates
                        (natural_key, code, name, category, anchor_rule, form, period,
                         deadline, active, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        natural_key,
                        template.code,
                        template.name,
                        template.category,
                        template.anchor_rule.as_str(),
                        form,
                        period,
                        deadline,
                        template.active as i64,
                        now_string(),
                    ],
                )
                .map_err(db_err)?;
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    fn replace_steps(&self, key: &NaturalKey, steps: &[SeedStep]) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let storage_key = key.storage_key();
        let tx = conn.transaction().map_err(db_err)?;

        let template_id: i64 = tx
            .query_row(
                "SELECT id FROM seed_templates WHERE natural_key = ?1",
                params![storage_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound(storage_key.clone()))?;

        tx.execute(
            "DELETE FROM seed_steps WHERE template_id = ?1",
            params![template_id],
        )
        .map_err(db_err)?;
        for step in steps {
            tx.execute(
                "INSERT INTO seed_steps (template_id, sequence, activity, role_code, date_rule)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    template_id,
                    step.sequence,
                    step.activity.as_str(),
                    step.role_code,
                    step.date_rule.canonical(),
                ],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(steps.len())
    }

    fn list_templates(&self, scope: &Scope) -> Result<Vec<SeedTemplate>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, code, name, category, anchor_rule, form, period, deadline
                 FROM seed_templates WHERE active = 1 ORDER BY code",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let mut templates = Vec::new();
        for (id, code, name, category, anchor_rule, form, period, deadline) in rows {
            if !scope.includes(&category, &code) {
                continue;
            }
            let schedule = match (form, period, deadline) {
                (Some(form), Some(period), Some(deadline)) => Some(ScheduleKey {
                    form,
                    period,
                    deadline: parse_date(&deadline)?,
                }),
                _ => None,
            };
            templates.push(SeedTemplate {
                anchor_rule: AnchorRule::parse(&anchor_rule).ok_or_else(|| {
                    StoreError::Backend(format!("unknown anchor rule '{}'", anchor_rule))
                })?,
                steps: Self::load_steps(&conn, id)?,
                code,
                name,
                category,
                schedule,
                active: true,
            });
        }
        Ok(templates)
    }

    fn set_current_seed(&self, seed_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO seed_meta (key, value) VALUES ('current_seed', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![seed_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn current_seed(&self) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT value FROM seed_meta WHERE key = 'current_seed'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }
}

impl TaskMapStore for SqliteStore {
    fn get_entry(&self, external_key: &str) -> Result<Option<TaskMapEntry>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM task_map WHERE external_key = ?1",
            ENTRY_COLUMNS
        );
        conn.query_row(&sql, params![external_key], Self::entry_from_row)
            .optional()
            .map_err(db_err)?
            .map(RawEntry::decode)
            .transpose()
    }

    fn claim_entry(&self, entry: &TaskMapEntry) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "INSERT INTO task_map ({})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            ENTRY_COLUMNS
        );
        conn.execute(
            &sql,
            params![
                entry.external_key,
                entry.cycle_key,
                entry.template_code,
                entry.step_code,
                entry.category,
                entry.deadline.map(format_date),
                entry.task_id.as_ref().map(|t| t.as_str()),
                entry.seed_hash,
                entry.obsolete as i64,
                entry.created_run.to_string(),
                entry.last_run.to_string(),
                entry.created_at.to_rfc3339(),
                entry.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                StoreError::DuplicateExternalKey(entry.external_key.clone())
            } else {
                db_err(e)
            }
        })?;
        Ok(())
    }

    fn attach_task(
        &self,
        external_key: &str,
        task_id: &TaskId,
        run: Uuid,
    ) -> Result<(), StoreError> {
        self.touch_entry(
            "UPDATE task_map SET task_id = ?2, last_run = ?3, updated_at = ?4
             WHERE external_key = ?1",
            external_key,
            Some(task_id.as_str()),
            run,
        )
    }

    fn refresh_entry(
        &self,
        external_key: &str,
        seed_hash: &str,
        run: Uuid,
    ) -> Result<(), StoreError> {
        self.touch_entry(
            "UPDATE task_map SET seed_hash = ?2, obsolete = 0, last_run = ?3, updated_at = ?4
             WHERE external_key = ?1",
            external_key,
            Some(seed_hash),
            run,
        )
    }

    fn mark_entry_obsolete(&self, external_key: &str, run: Uuid) -> Result<(), StoreError> {
        self.touch_entry(
            "UPDATE task_map SET obsolete = 1, last_run = ?3, updated_at = ?4
             WHERE external_key = ?1",
            external_key,
            None,
            run,
        )
    }

    fn entries_for_cycle(&self, cycle_key: &str) -> Result<Vec<TaskMapEntry>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM task_map WHERE cycle_key = ?1 ORDER BY external_key",
            ENTRY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![cycle_key], Self::entry_from_row)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().map(RawEntry::decode).collect()
    }
}

impl RunLog for SqliteStore {
    fn record_run_started(&self, run: &GenerationRun) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let run_json =
            serde_json::to_string(run).map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute(
            "INSERT INTO generation_runs
                (id, seed_id, cycle_key, status, dry_run, started_at, finished_at, run_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.id().to_string(),
                run.seed_id(),
                run.cycle_key(),
                run.status().as_str(),
                run.dry_run() as i64,
                run.started_at().to_rfc3339(),
                run.finished_at().map(|t| t.to_rfc3339()),
                run_json,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn record_run_finalized(&self, run: &GenerationRun) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let id = run.id().to_string();
        let stored_status: Option<String> = conn
            .query_row(
                "SELECT status FROM generation_runs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if stored_status.as_deref().is_some_and(|s| s != "RUNNING") {
            return Err(StoreError::RunFinalized(run.id()));
        }

        let run_json =
            serde_json::to_string(run).map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO generation_runs
                (id, seed_id, cycle_key, status, dry_run, started_at, finished_at, run_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                run.seed_id(),
                run.cycle_key(),
                run.status().as_str(),
                run.dry_run() as i64,
                run.started_at().to_rfc3339(),
                run.finished_at().map(|t| t.to_rfc3339()),
                run_json,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn get_run(&self, id: Uuid) -> Result<Option<GenerationRun>, StoreError> {
        let conn = self.conn()?;
        let run_json: Option<String> = conn
            .query_row(
                "SELECT run_json FROM generation_runs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        run_json
            .map(|json| {
                serde_json::from_str(&json).map_err(|e| StoreError::Backend(e.to_string()))
            })
            .transpose()
    }

    fn list_runs(&self, limit: usize) -> Result<Vec<GenerationRun>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_json FROM generation_runs
                 ORDER BY started_at DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.iter()
            .map(|json| {
                serde_json::from_str(json).map_err(|e| StoreError::Backend(e.to_string()))
            })
            .collect()
    }
}

fn tracker_err(e: StoreError) -> TrackerError {
    TrackerError::Unavailable(e.to_string())
}

impl TaskTracker for SqliteStore {
    fn create_task(&self, task: &NewTask) -> Result<TaskId, TrackerError> {
        let conn = self.conn().map_err(tracker_err)?;
        let id = TaskId::generate();
        let now = now_string();
        conn.execute(
            "INSERT INTO tracked_tasks
                (id, name, category, target_date, assignee, obsolete, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
            params![
                id.as_str(),
                task.name,
                task.category,
                format_date(task.target_date),
                task.assignee,
                now,
            ],
        )
        .map_err(|e| TrackerError::CreateRejected {
            name: task.name.clone(),
            reason: e.to_string(),
        })?;
        Ok(id)
    }

    fn update_task(&self, task_id: &TaskId, update: &TaskUpdate) -> Result<(), TrackerError> {
        let conn = self.conn().map_err(tracker_err)?;
        let changed = conn
            .execute(
                "UPDATE tracked_tasks
                 SET target_date = ?2, assignee = ?3, category = COALESCE(?4, category),
                     obsolete = 0, updated_at = ?5
                 WHERE id = ?1",
                params![
                    task_id.as_str(),
                    format_date(update.target_date),
                    update.assignee,
                    update.category,
                    now_string(),
                ],
            )
            .map_err(|e| TrackerError::UpdateRejected {
                task_id: task_id.clone(),
                reason: e.to_string(),
            })?;
        if changed == 0 {
            return Err(TrackerError::NotFound(task_id.clone()));
        }
        Ok(())
    }

    fn mark_obsolete(&self, task_id: &TaskId) -> Result<(), TrackerError> {
        let conn = self.conn().map_err(tracker_err)?;
        let changed = conn
            .execute(
                "UPDATE tracked_tasks SET obsolete = 1, updated_at = ?2 WHERE id = ?1",
                params![task_id.as_str(), now_string()],
            )
            .map_err(|e| TrackerError::UpdateRejected {
                task_id: task_id.clone(),
                reason: e.to_string(),
            })?;
        if changed == 0 {
            return Err(TrackerError::NotFound(task_id.clone()));
        }
        Ok(())
    }
}

impl Backend for SqliteStore {
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
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("in-memory sqlite")
    }

    #[test]
    fn upsert_is_keyed_by_natural_key() {
        contract::upsert_is_keyed_by_natural_key(&store());
    }

    #[test]
    fn replace_steps_is_full_replacement() {
        contract::replace_steps_is_full_replacement(&store());
    }

    #[test]
    fn inactive_templates_are_not_listed() {
        contract::inactive_templates_are_not_listed(&store());
    }

    #[test]
    fn code_conflicts_are_rejected() {
        contract::code_conflicts_are_rejected(&store());
    }

    #[test]
    fn external_keys_are_unique() {
        contract::external_keys_are_unique(&store());
    }

    #[test]
    fn entry_lifecycle() {
        contract::entry_lifecycle(&store());
    }

    #[test]
    fn runs_finalize_once() {
        contract::runs_finalize_once(&store());
    }

    #[test]
    fn schedule_templates_keep_their_deadline() {
        let s = store();
        let template = SeedTemplate {
            code: "VAT_201_2025_11".to_string(),
            name: "VAT-201 2025-11".to_string(),
            category: "statutory_filing".to_string(),
            anchor_rule: AnchorRule::Deadline,
            schedule: Some(ScheduleKey {
                form: "VAT-201".to_string(),
                period: "2025-11".to_string(),
                deadline: NaiveDate::from_ymd_opt(2025, 12, 25).unwrap(),
            }),
            active: true,
            steps: vec![SeedStep {
                sequence: 1,
                activity: ActivityKind::File,
                role_code: "TAX".to_string(),
                date_rule: DateRule::OnAnchor,
            }],
        };
        s.upsert_template(&template).unwrap();
        s.replace_steps(&template.natural_key(), &template.steps).unwrap();

        let loaded = s.list_templates(&Scope::All).unwrap();
        assert_eq!(loaded, vec![template]);
    }

    #[test]
    fn local_tracker_round_trip() {
        let s = store();
        let id = s
            .create_task(&NewTask {
                name: "Payroll Processing - Prepare (2025-12)".to_string(),
                category: "payroll".to_string(),
                target_date: NaiveDate::from_ymd_opt(2025, 12, 23).unwrap(),
                assignee: None,
            })
            .unwrap();
        s.mark_obsolete(&id).unwrap();
        assert!(s.tracked_tasks().unwrap()[0].obsolete);

        s.update_task(
            &id,
            &TaskUpdate {
                target_date: NaiveDate::from_ymd_opt(2025, 12, 22).unwrap(),
                assignee: Some("alice".to_string()),
                category: None,
            },
        )
        .unwrap();
        let task = &s.tracked_tasks().unwrap()[0];
        assert!(!task.obsolete);
        assert_eq!(task.category, "payroll");
        assert_eq!(task.assignee.as_deref(), Some("alice"));

        assert_eq!(
            s.mark_obsolete(&TaskId::new("missing")),
            Err(TrackerError::NotFound(TaskId::new("missing")))
        );
    }

    #[test]
    fn data_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = SqliteStore::open_in_dir(dir.path()).unwrap();
            s.set_current_seed("close@v9").unwrap();
            s.claim_entry(&contract::entry("C|9|PAYROLL|S01_PREP", "C|9"))
                .unwrap();
        }
        let s = SqliteStore::open_in_dir(dir.path()).unwrap();
        assert_eq!(s.current_seed().unwrap().as_deref(), Some("close@v9"));
        assert_eq!(s.entries_for_cycle("C|9").unwrap().len(), 1);
    }
}

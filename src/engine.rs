//! Reconciliation Engine.
//!
//! Expands the active seed for one cycle into expected task instances and
//! brings the task store in line with it:
//!
//! ```text
//! for each template in scope, each step in sequence order:
//!     key, target date, seed hash, assignee
//!     no map entry           -> CREATE     (claim key, create task, attach)
//!     entry, same hash       -> UNCHANGED  (no write)
//!     entry, different hash  -> UPDATE     (update task, refresh hash)
//! entries of the cycle that were not expected -> OBSOLETE (flag only)
//! ```
//!
//! A dry run computes every decision and counter but skips all writes to the
//! task store and the task map. The run record itself is always persisted.

use crate::calendar::{self, Calendar, CalendarError, HolidaySet};
use crate::error::ReconcileError;
use crate::keys;
use crate::roles::{Resolution, RoleDirectory, RoleResolver};
use crate::run::{DecisionKind, GenerationRun, InstanceDecision, RunRecorder, StatusPolicy};
use crate::seed::{AnchorRule, DateRule, Scope, SeedError, SeedStep, SeedTemplate};
use crate::store::{Backend, RunLog, SeedStore, StoreError, TaskMapEntry, TaskMapStore};
use crate::tracker::{NewTask, TaskId, TaskTracker, TaskUpdate};
use chrono::{NaiveDate, Utc};
use std::collections::HashSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const UNVERSIONED_SEED: &str = "unversioned";

/// Engine-wide settings, fixed for the lifetime of a [`Reconciler`].
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub holidays: HolidaySet,
    /// Unresolved assignees strictly above this fail the run.
    pub unresolved_fail_threshold: Option<u32>,
}

/// Parameters of one `generate` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateRequest {
    /// Defaults to the store's current seed.
    pub seed_id: Option<String>,
    pub scope: Scope,
    pub cycle_code: String,
    pub period: String,
    /// Raw `YYYY-MM-DD`; without it the anchor is the last day of `period`.
    pub anchor: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub dry_run: bool,
}

impl GenerateRequest {
    pub fn new(cycle_code: impl Into<String>, period: impl Into<String>) -> Self {
        Self {
            seed_id: None,
            scope: Scope::All,
            cycle_code: cycle_code.into(),
            period: period.into(),
            anchor: None,
            date_from: None,
            date_to: None,
            dry_run: false,
        }
    }

    pub fn anchor(mut self, anchor: impl Into<String>) -> Self {
        self.anchor = Some(anchor.into());
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn between(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn seed_id(mut self, seed_id: impl Into<String>) -> Self {
        self.seed_id = Some(seed_id.into());
        self
    }

    pub fn cycle_key(&self) -> String {
        keys::cycle_key(&self.cycle_code, &self.period)
    }

    fn in_range(&self, date: NaiveDate) -> bool {
        self.date_from.map_or(true, |from| date >= from)
            && self.date_to.map_or(true, |to| date <= to)
    }
}

/// State shared by every instance of one run.
struct RunContext<'r> {
    request: &'r GenerateRequest,
    cycle_key: &'r str,
    anchor: NaiveDate,
    run_id: Uuid,
}

/// One expected task instance, fully computed.
struct PlannedInstance<'t> {
    template: &'t SeedTemplate,
    step_code: String,
    external_key: String,
    task_name: String,
    target_date: NaiveDate,
    seed_hash: String,
    assignee: Option<String>,
}

impl PlannedInstance<'_> {
    fn decision(&self, kind: DecisionKind) -> InstanceDecision {
        InstanceDecision::new(kind, &self.template.code)
            .key(&self.external_key)
            .step(&self.step_code)
            .target(self.target_date)
            .assignee(self.assignee.clone())
    }

    fn new_task(&self) -> NewTask {
        NewTask {
            name: self.task_name.clone(),
            category: self.template.category.clone(),
            target_date: self.target_date,
            assignee: self.assignee.clone(),
        }
    }

    fn update(&self) -> TaskUpdate {
        TaskUpdate {
            target_date: self.target_date,
            assignee: self.assignee.clone(),
            category: Some(self.template.category.clone()),
        }
    }

    fn claim(&self, ctx: &RunContext<'_>) -> TaskMapEntry {
        let now = Utc::now();
        TaskMapEntry {
            external_key: self.external_key.clone(),
            cycle_key: ctx.cycle_key.to_string(),
            template_code: self.template.code.clone(),
            step_code: self.step_code.clone(),
            category: self.template.category.clone(),
            deadline: self.template.deadline(),
            task_id: None,
            seed_hash: self.seed_hash.clone(),
            obsolete: false,
            created_run: ctx.run_id,
            last_run: ctx.run_id,
            created_at: now,
            updated_at: now,
        }
    }
}

pub struct Reconciler<'a> {
    seeds: &'a dyn SeedStore,
    task_map: &'a dyn TaskMapStore,
    runs: &'a dyn RunLog,
    tracker: &'a dyn TaskTracker,
    directory: &'a dyn RoleDirectory,
    calendar: Calendar,
    policy: StatusPolicy,
}

impl<'a> Reconciler<'a> {
    /// Engine over one backend, using the backend's own task tracker.
    pub fn new(
        backend: &'a dyn Backend,
        directory: &'a dyn RoleDirectory,
        options: EngineOptions,
    ) -> Self {
        Self {
            seeds: backend.seeds(),
            task_map: backend.task_map(),
            runs: backend.runs(),
            tracker: backend.tracker(),
            directory,
            calendar: Calendar::new(options.holidays),
            policy: StatusPolicy {
                unresolved_fail_threshold: options.unresolved_fail_threshold,
            },
        }
    }

    /// Send task writes to `tracker` instead of the backend's tracker.
    pub fn with_tracker(mut self, tracker: &'a dyn TaskTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Reconcile one cycle and return the finalized run.
    ///
    /// Every failure inside the run is captured in the returned run's report
    /// and status. `Err` means the run record itself could not be persisted.
    pub fn generate(&self, request: &GenerateRequest) -> Result<GenerationRun, ReconcileError> {
        let cycle_key = request.cycle_key();
        let seed_id = self.seed_id_for(request);
        let mut recorder =
            RunRecorder::start(&seed_id, &request.cycle_code, &cycle_key, request.dry_run);
        let run_id = recorder.id();
        self.runs.record_run_started(recorder.snapshot())?;

        info!(
            run_id = %run_id,
            cycle_key = %cycle_key,
            seed_id = %seed_id,
            scope = %request.scope,
            dry_run = request.dry_run,
            "Generation run started"
        );

        if let Err(e) = self.reconcile(request, &cycle_key, &mut recorder) {
            error!(run_id = %run_id, cycle_key = %cycle_key, error = %e, "Generation run aborted");
            recorder.abort(e.to_string());
        }

        let run = recorder.finalize(&self.policy);
        self.runs.record_run_finalized(&run)?;

        let c = run.counters();
        info!(
            run_id = %run_id,
            cycle_key = %cycle_key,
            status = %run.status(),
            created = c.created,
            updated = c.updated,
            unchanged = c.unchanged,
            obsolete = c.obsolete_marked,
            unresolved = c.unresolved_assignee,
            write_errors = c.write_errors,
            "Generation run finished"
        );
        Ok(run)
    }

    /// Target date of `step` measured from `anchor`.
    ///
    /// Filing steps always land on the anchor, whatever offset they carry.
    pub fn target_date(
        &self,
        step: &SeedStep,
        anchor: NaiveDate,
    ) -> Result<NaiveDate, CalendarError> {
        if step.pinned_to_anchor() {
            return Ok(anchor);
        }
        match step.date_rule {
            DateRule::BusinessDaysBefore(n) => {
                self.calendar.subtract_business_days(anchor, i64::from(n))
            }
            DateRule::CalendarOffset(days) => calendar::add_calendar_days(anchor, i64::from(days)),
            DateRule::OnAnchor => Ok(anchor),
        }
    }

    fn seed_id_for(&self, request: &GenerateRequest) -> String {
        if let Some(seed_id) = &request.seed_id {
            return seed_id.clone();
        }
        match self.seeds.current_seed() {
            Ok(Some(seed_id)) => seed_id,
            Ok(None) => UNVERSIONED_SEED.to_string(),
            Err(e) => {
                warn!(error = %e, "Could not read current seed id");
                UNVERSIONED_SEED.to_string()
            }
        }
    }

    fn resolve_anchor(request: &GenerateRequest) -> Result<NaiveDate, CalendarError> {
        match request.anchor.as_deref() {
            Some(raw) => calendar::parse_date(raw),
            None => calendar::month_end_for_period(&request.period),
        }
    }

    /// Run-level errors come back as `Err`; everything else is recorded.
    fn reconcile(
        &self,
        request: &GenerateRequest,
        cycle_key: &str,
        recorder: &mut RunRecorder,
    ) -> Result<(), ReconcileError> {
        let ctx = RunContext {
            request,
            cycle_key,
            anchor: Self::resolve_anchor(request)?,
            run_id: recorder.id(),
        };
        let templates = self.seeds.list_templates(&request.scope)?;
        debug!(run_id = %ctx.run_id, templates = templates.len(), "Loaded seed templates");

        let resolver = RoleResolver::new(self.directory);
        let mut expected = HashSet::new();
        let mut skipped_templates = HashSet::new();

        for template in &templates {
            if let Err(e) = template.validate() {
                let err = ReconcileError::from(e);
                warn!(run_id = %ctx.run_id, error = %err, "Skipping malformed template");
                skipped_templates.insert(template.code.clone());
                recorder.record(
                    InstanceDecision::new(DecisionKind::Skipped, &template.code)
                        .detail(err.to_string()),
                );
                continue;
            }
            for step in template.ordered_steps() {
                self.reconcile_step(&ctx, &resolver, template, step, &mut expected, recorder)?;
            }
        }

        self.mark_obsolete(&ctx, &expected, &skipped_templates, recorder)
    }

    fn reconcile_step(
        &self,
        ctx: &RunContext<'_>,
        resolver: &RoleResolver<'_>,
        template: &SeedTemplate,
        step: &SeedStep,
        expected: &mut HashSet<String>,
        recorder: &mut RunRecorder,
    ) -> Result<(), ReconcileError> {
        let step_code = step.code();
        let external_key =
            keys::external_key(ctx.cycle_key, &template.code, &step_code, template.deadline());

        if !expected.insert(external_key.clone()) {
            warn!(external_key = %external_key, "Two steps map to the same external key");
            recorder.record(
                InstanceDecision::new(DecisionKind::Skipped, &template.code)
                    .key(external_key)
                    .step(step_code)
                    .detail("duplicate step identity"),
            );
            return Ok(());
        }
        if let Err(e) = step.validate(&template.code) {
            recorder.record(skipped(template, external_key, step_code, e.into()));
            return Ok(());
        }

        let anchor = match (template.anchor_rule, template.deadline()) {
            (AnchorRule::Deadline, Some(deadline)) => deadline,
            _ => ctx.anchor,
        };
        let target_date = match self.target_date(step, anchor) {
            Ok(date) => date,
            Err(e) => {
                let err = SeedError::MalformedStep {
                    template: template.code.clone(),
                    sequence: step.sequence,
                    reason: e.to_string(),
                };
                recorder.record(skipped(template, external_key, step_code, err.into()));
                return Ok(());
            }
        };
        if !ctx.request.in_range(target_date) {
            debug!(external_key = %external_key, target = %target_date, "Outside date range");
            recorder.record(
                InstanceDecision::new(DecisionKind::Filtered, &template.code)
                    .key(external_key)
                    .step(step_code)
                    .target(target_date),
            );
            return Ok(());
        }

        let assignee = match resolver.resolve(&step.role_code) {
            Resolution::Assigned(identity) => Some(identity),
            Resolution::Unresolved(reason) => {
                let err = ReconcileError::RoleUnresolved {
                    role_code: step.role_code.clone(),
                    reason,
                };
                warn!(external_key = %external_key, error = %err, "Assignee unresolved");
                recorder.note_unresolved(&step.role_code);
                None
            }
        };

        let period_label = template
            .schedule
            .as_ref()
            .map_or(ctx.request.period.as_str(), |s| s.period.as_str());
        let planned = PlannedInstance {
            template,
            task_name: template.task_name(step, period_label),
            step_code,
            external_key,
            target_date,
            seed_hash: keys::seed_hash(template, step),
            assignee,
        };
        recorder.record(self.apply(ctx, &planned));
        Ok(())
    }

    fn apply(&self, ctx: &RunContext<'_>, planned: &PlannedInstance<'_>) -> InstanceDecision {
        match self.task_map.get_entry(&planned.external_key) {
            Ok(None) => self.create(ctx, planned),
            Ok(Some(entry)) => self.reconcile_existing(ctx, planned, entry),
            Err(e) => self.failed(planned, e.into()),
        }
    }

    fn create(&self, ctx: &RunContext<'_>, planned: &PlannedInstance<'_>) -> InstanceDecision {
        if ctx.request.dry_run {
            return planned.decision(DecisionKind::Create);
        }

        match self.task_map.claim_entry(&planned.claim(ctx)) {
            Ok(()) => self.create_and_attach(ctx, planned),
            Err(StoreError::DuplicateExternalKey(_)) => {
                debug!(external_key = %planned.external_key, "Key claimed concurrently; re-reading");
                match self.task_map.get_entry(&planned.external_key) {
                    Ok(Some(entry)) if entry.task_id.is_none() => planned
                        .decision(DecisionKind::Unchanged)
                        .detail("claimed by a concurrent run"),
                    Ok(Some(entry)) => self.reconcile_existing(ctx, planned, entry),
                    Ok(None) => self.failed(
                        planned,
                        StoreError::NotFound(planned.external_key.clone()).into(),
                    ),
                    Err(e) => self.failed(planned, e.into()),
                }
            }
            Err(e) => self.failed(planned, e.into()),
        }
    }

    fn create_and_attach(
        &self,
        ctx: &RunContext<'_>,
        planned: &PlannedInstance<'_>,
    ) -> InstanceDecision {
        let task_id = match self.tracker.create_task(&planned.new_task()) {
            Ok(task_id) => task_id,
            Err(e) => return self.failed(planned, e.into()),
        };
        if let Err(e) = self
            .task_map
            .attach_task(&planned.external_key, &task_id, ctx.run_id)
        {
            return self.failed(planned, e.into()).task(Some(task_id));
        }
        debug!(external_key = %planned.external_key, task_id = %task_id, "Created task");
        planned.decision(DecisionKind::Create).task(Some(task_id))
    }

    fn reconcile_existing(
        &self,
        ctx: &RunContext<'_>,
        planned: &PlannedInstance<'_>,
        entry: TaskMapEntry,
    ) -> InstanceDecision {
        let Some(task_id) = entry.task_id.clone() else {
            return self.retry_create(ctx, planned, &entry);
        };

        if entry.seed_hash == planned.seed_hash && !entry.obsolete {
            return planned.decision(DecisionKind::Unchanged).task(Some(task_id));
        }

        let decision = planned.decision(DecisionKind::Update).task(Some(task_id.clone()));
        let decision = if entry.obsolete {
            decision.detail("revived obsolete entry")
        } else {
            decision
        };
        if ctx.request.dry_run {
            return decision;
        }

        if let Err(e) = self.tracker.update_task(&task_id, &planned.update()) {
            return self.failed(planned, e.into()).task(Some(task_id));
        }
        if let Err(e) =
            self.task_map
                .refresh_entry(&planned.external_key, &planned.seed_hash, ctx.run_id)
        {
            return self.failed(planned, e.into()).task(Some(task_id));
        }
        debug!(external_key = %planned.external_key, task_id = %task_id, "Updated task");
        decision
    }

    /// A claimed key whose task was never attached: create it now.
    fn retry_create(
        &self,
        ctx: &RunContext<'_>,
        planned: &PlannedInstance<'_>,
        entry: &TaskMapEntry,
    ) -> InstanceDecision {
        info!(external_key = %planned.external_key, "Retrying create for unattached claim");
        if ctx.request.dry_run {
            return planned.decision(DecisionKind::Create);
        }
        let decision = self.create_and_attach(ctx, planned);
        if decision.kind != DecisionKind::Create
            || (entry.seed_hash == planned.seed_hash && !entry.obsolete)
        {
            return decision;
        }
        match self
            .task_map
            .refresh_entry(&planned.external_key, &planned.seed_hash, ctx.run_id)
        {
            Ok(()) => decision,
            Err(e) => {
                let task_id = decision.task_id.clone();
                self.failed(planned, e.into()).task(task_id)
            }
        }
    }

    fn failed(&self, planned: &PlannedInstance<'_>, err: ReconcileError) -> InstanceDecision {
        error!(external_key = %planned.external_key, error = %err, "Task write failed");
        planned
            .decision(DecisionKind::Failed)
            .detail(format!("{}: {}", planned.external_key, err))
    }

    /// Flag entries of this cycle and scope that no longer have a step.
    fn mark_obsolete(
        &self,
        ctx: &RunContext<'_>,
        expected: &HashSet<String>,
        skipped_templates: &HashSet<String>,
        recorder: &mut RunRecorder,
    ) -> Result<(), ReconcileError> {
        let entries = self.task_map.entries_for_cycle(ctx.cycle_key)?;

        for entry in entries {
            if entry.obsolete
                || expected.contains(&entry.external_key)
                || skipped_templates.contains(&entry.template_code)
                || !ctx
                    .request
                    .scope
                    .includes(&entry.category, &entry.template_code)
            {
                continue;
            }

            let decision = InstanceDecision::new(DecisionKind::Obsolete, &entry.template_code)
                .key(&entry.external_key)
                .step(&entry.step_code)
                .task(entry.task_id.clone());
            if ctx.request.dry_run {
                recorder.record(decision);
                continue;
            }

            if let Err(e) = self.flag_obsolete(&entry, ctx.run_id) {
                error!(external_key = %entry.external_key, error = %e, "Could not mark obsolete");
                recorder.record(
                    InstanceDecision::new(DecisionKind::Failed, &entry.template_code)
                        .key(&entry.external_key)
                        .step(&entry.step_code)
                        .task(entry.task_id.clone())
                        .detail(format!("{}: {}", entry.external_key, e)),
                );
                continue;
            }
            info!(external_key = %entry.external_key, "Marked obsolete");
            recorder.record(decision);
        }
        Ok(())
    }

    fn flag_obsolete(&self, entry: &TaskMapEntry, run_id: Uuid) -> Result<(), ReconcileError> {
        if let Some(task_id) = &entry.task_id {
            self.tracker.mark_obsolete(task_id)?;
        }
        self.task_map
            .mark_entry_obsolete(&entry.external_key, run_id)?;
        Ok(())
    }
}

/// A step that cannot be planned; it stays expected so its entry is not
/// flagged obsolete.
fn skipped(
    template: &SeedTemplate,
    external_key: String,
    step_code: String,
    err: ReconcileError,
) -> InstanceDecision {
    warn!(external_key = %external_key, error = %err, "Skipping malformed step");
    InstanceDecision::new(DecisionKind::Skipped, &template.code)
        .key(external_key)
        .step(step_code)
        .detail(err.to_string())
}

/// Identity of the task linked to `external_key`, if one was created.
pub fn find_task_by_external_key(
    task_map: &dyn TaskMapStore,
    external_key: &str,
) -> Result<Option<TaskId>, StoreError> {
    Ok(task_map
        .get_entry(external_key)?
        .and_then(|entry| entry.task_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::InMemoryRoleDirectory;
    use crate::run::RunStatus;
    use crate::seed::{ActivityKind, ScheduleKey};
    use crate::store::InMemoryStore;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn step(sequence: u32, activity: ActivityKind, role: &str, rule: DateRule) -> SeedStep {
        SeedStep {
            sequence,
            activity,
            role_code: role.to_string(),
            date_rule: rule,
        }
    }

    fn payroll() -> SeedTemplate {
        SeedTemplate {
            code: "PAYROLL_PROCESSING".to_string(),
            name: "Payroll Processing".to_string(),
            category: "payroll".to_string(),
            anchor_rule: AnchorRule::MonthEnd,
            schedule: None,
            active: true,
            steps: vec![
                step(1, ActivityKind::Prep, "PAYROLL", DateRule::BusinessDaysBefore(6)),
                step(2, ActivityKind::Review, "CONTROLLER", DateRule::BusinessDaysBefore(3)),
                step(3, ActivityKind::Approve, "CFO", DateRule::BusinessDaysBefore(1)),
            ],
        }
    }

    fn seed(store: &InMemoryStore, template: &SeedTemplate) {
        store.upsert_template(template).unwrap();
        store
            .replace_steps(&template.natural_key(), &template.steps)
            .unwrap();
    }

    fn directory() -> InMemoryRoleDirectory {
        InMemoryRoleDirectory::new()
            .with_role("PAYROLL", Some("alice"), None)
            .with_role("CONTROLLER", Some("bob"), None)
            .with_role("CFO", Some("carol"), None)
            .with_role("TAX", Some("dave"), None)
    }

    fn request() -> GenerateRequest {
        GenerateRequest::new("MONTH_END_CLOSE", "2025-12").anchor("2025-12-31")
    }

    #[test]
    fn payroll_scenario_creates_then_is_unchanged() {
        let store = InMemoryStore::new();
        seed(&store, &payroll());
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());

        let first = engine.generate(&request()).unwrap();
        assert_eq!(first.status(), RunStatus::Pass);
        let c = first.counters();
        assert_eq!((c.created, c.updated, c.unchanged), (3, 0, 0));

        let targets: Vec<NaiveDate> = store
            .local_tracker()
            .tasks()
            .iter()
            .map(|t| t.target_date)
            .collect();
        assert_eq!(
            targets,
            vec![date(2025, 12, 23), date(2025, 12, 26), date(2025, 12, 30)]
        );

        let second = engine.generate(&request()).unwrap();
        let c = second.counters();
        assert_eq!((c.created, c.updated, c.unchanged), (0, 0, 3));
        assert_eq!(store.local_tracker().tasks().len(), 3);
    }

    #[test]
    fn dry_run_counts_without_writing() {
        let store = InMemoryStore::new();
        seed(&store, &payroll());
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());

        let planned = engine.generate(&request().dry_run(true)).unwrap();
        assert!(planned.dry_run());
        assert_eq!(planned.counters().created, 3);
        assert!(store.all_entries().is_empty());
        assert_eq!(store.local_tracker().write_count(), 0);

        let applied = engine.generate(&request()).unwrap();
        assert_eq!(planned.counters(), applied.counters());
        assert_eq!(store.runs().list_runs(10).unwrap().len(), 2, "dry runs are audited");
    }

    #[test]
    fn role_change_updates_exactly_one_instance() {
        let store = InMemoryStore::new();
        let mut template = payroll();
        seed(&store, &template);
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());
        engine.generate(&request()).unwrap();

        template.steps[1].role_code = "CFO".to_string();
        seed(&store, &template);
        let run = engine.generate(&request()).unwrap();
        let c = run.counters();
        assert_eq!((c.created, c.updated, c.unchanged), (0, 1, 2));

        let updated: Vec<_> = run.report().decisions_of(DecisionKind::Update).collect();
        assert_eq!(updated[0].step_code.as_deref(), Some("S02_REVIEW"));
        let task = store
            .local_tracker()
            .get(updated[0].task_id.as_ref().unwrap())
            .unwrap();
        assert_eq!(task.assignee.as_deref(), Some("carol"));
    }

    #[test]
    fn removed_step_is_marked_obsolete() {
        let store = InMemoryStore::new();
        let mut template = payroll();
        seed(&store, &template);
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());
        engine.generate(&request()).unwrap();

        template.steps.remove(2);
        seed(&store, &template);
        let run = engine.generate(&request()).unwrap();
        let c = run.counters();
        assert_eq!((c.obsolete_marked, c.unchanged), (1, 2));
        assert_eq!(run.status(), RunStatus::Warn, "obsolescence alone is a stale seed");

        let obsolete: Vec<_> = store
            .local_tracker()
            .tasks()
            .into_iter()
            .filter(|t| t.obsolete)
            .collect();
        assert_eq!(obsolete.len(), 1);
        assert_eq!(obsolete[0].target_date, date(2025, 12, 30));

        let again = engine.generate(&request()).unwrap();
        assert_eq!(again.counters().obsolete_marked, 0, "already flagged entries stay quiet");
    }

    #[test]
    fn restored_step_revives_obsolete_entry() {
        let store = InMemoryStore::new();
        let mut template = payroll();
        seed(&store, &template);
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());
        engine.generate(&request()).unwrap();

        let removed = template.steps.remove(2);
        seed(&store, &template);
        engine.generate(&request()).unwrap();

        template.steps.push(removed);
        seed(&store, &template);
        let run = engine.generate(&request()).unwrap();
        assert_eq!(run.counters().updated, 1);
        assert!(store.all_entries().iter().all(|e| !e.obsolete));
        assert!(store.local_tracker().tasks().iter().all(|t| !t.obsolete));
    }

    #[test]
    fn filing_steps_land_on_the_anchor() {
        let store = InMemoryStore::new();
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());
        let filing = step(4, ActivityKind::File, "TAX", DateRule::BusinessDaysBefore(5));
        let offset = step(5, ActivityKind::File, "TAX", DateRule::CalendarOffset(-9));

        let mut anchor = date(2025, 1, 1);
        while anchor < date(2026, 1, 1) {
            assert_eq!(engine.target_date(&filing, anchor).unwrap(), anchor);
            assert_eq!(engine.target_date(&offset, anchor).unwrap(), anchor);
            anchor = anchor.succ_opt().unwrap();
        }
    }

    #[test]
    fn schedules_anchor_on_their_deadline() {
        let store = InMemoryStore::new();
        let vat = SeedTemplate {
            code: "VAT_201_2025_11".to_string(),
            name: "VAT-201 2025-11".to_string(),
            category: "statutory_filing".to_string(),
            anchor_rule: AnchorRule::Deadline,
            schedule: Some(ScheduleKey {
                form: "VAT-201".to_string(),
                period: "2025-11".to_string(),
                deadline: date(2025, 12, 25),
            }),
            active: true,
            steps: vec![
                step(1, ActivityKind::Prep, "TAX", DateRule::BusinessDaysBefore(2)),
                step(2, ActivityKind::File, "TAX", DateRule::OnAnchor),
            ],
        };
        seed(&store, &vat);
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());

        let run = engine.generate(&request()).unwrap();
        let created: Vec<_> = run.report().decisions_of(DecisionKind::Create).collect();
        assert_eq!(created[0].target_date, Some(date(2025, 12, 23)));
        assert_eq!(created[1].target_date, Some(date(2025, 12, 25)));
        assert_eq!(
            created[1].external_key.as_deref(),
            Some("MONTH_END_CLOSE|2025-12|VAT_201_2025_11|S02_FILE|2025-12-25")
        );
        let names: Vec<String> = store
            .local_tracker()
            .tasks()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert!(names.contains(&"VAT-201 2025-11 - File (2025-11)".to_string()));
    }

    #[test]
    fn write_failure_fails_the_run_but_continues() {
        let store = InMemoryStore::new();
        seed(&store, &payroll());
        store
            .local_tracker()
            .reject_creates_named("Payroll Processing - Review (2025-12)");
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());

        let run = engine.generate(&request()).unwrap();
        assert_eq!(run.status(), RunStatus::Fail);
        let c = run.counters();
        assert_eq!((c.created, c.write_errors), (2, 1));
        assert_eq!(run.report().errors.len(), 1);

        let pending = store
            .all_entries()
            .into_iter()
            .filter(|e| e.task_id.is_none())
            .count();
        assert_eq!(pending, 1, "the claim stays behind for the next run");
    }

    #[test]
    fn unattached_claim_is_created_on_retry() {
        let store = InMemoryStore::new();
        seed(&store, &payroll());
        let dir = directory();
        let rejecting = crate::tracker::InMemoryTaskTracker::new();
        rejecting.reject_creates_named("Payroll Processing - Prepare (2025-12)");
        Reconciler::new(&store, &dir, EngineOptions::default())
            .with_tracker(&rejecting)
            .generate(&request())
            .unwrap();

        let run = Reconciler::new(&store, &dir, EngineOptions::default())
            .with_tracker(store.local_tracker())
            .generate(&request())
            .unwrap();
        let c = run.counters();
        assert_eq!((c.created, c.unchanged), (1, 2));
        assert!(store.all_entries().iter().all(|e| e.task_id.is_some()));
    }

    #[test]
    fn concurrent_claim_is_reclassified() {
        let store = InMemoryStore::new();
        let template = payroll();
        seed(&store, &template);
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());

        // Another run claimed and attached the key after our lookup found nothing.
        let cycle_key = request().cycle_key();
        let s = &template.steps[0];
        let key = keys::external_key(&cycle_key, &template.code, &s.code(), None);
        let ctx = RunContext {
            request: &request(),
            cycle_key: &cycle_key,
            anchor: date(2025, 12, 31),
            run_id: Uuid::new_v4(),
        };
        let planned = PlannedInstance {
            template: &template,
            step_code: s.code(),
            external_key: key.clone(),
            task_name: template.task_name(s, "2025-12"),
            target_date: date(2025, 12, 23),
            seed_hash: keys::seed_hash(&template, s),
            assignee: Some("alice".to_string()),
        };
        store.claim_entry(&planned.claim(&ctx)).unwrap();
        store
            .attach_task(&key, &TaskId::new("other-run"), ctx.run_id)
            .unwrap();

        let decision = engine.create(&ctx, &planned);
        assert_eq!(decision.kind, DecisionKind::Unchanged);
        assert_eq!(decision.task_id, Some(TaskId::new("other-run")));
        assert_eq!(store.local_tracker().write_count(), 0);
    }

    #[test]
    fn invalid_anchor_aborts_with_report() {
        let store = InMemoryStore::new();
        seed(&store, &payroll());
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());

        let run = engine
            .generate(&GenerateRequest::new("MONTH_END_CLOSE", "2025-12").anchor("2025-02-30"))
            .unwrap();
        assert_eq!(run.status(), RunStatus::Fail);
        assert!(run.fatal_error().unwrap().contains("2025-02-30"));
        assert_eq!(run.counters().created, 0);
        assert_eq!(store.runs().get_run(run.id()).unwrap(), Some(run));
    }

    #[test]
    fn anchor_defaults_to_period_month_end() {
        let store = InMemoryStore::new();
        seed(&store, &payroll());
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());

        let run = engine
            .generate(&GenerateRequest::new("MONTH_END_CLOSE", "2025-12"))
            .unwrap();
        let created: Vec<_> = run.report().decisions_of(DecisionKind::Create).collect();
        assert_eq!(created[2].target_date, Some(date(2025, 12, 30)));
    }

    #[test]
    fn holidays_shift_business_day_targets() {
        let store = InMemoryStore::new();
        seed(&store, &payroll());
        let dir = directory();
        let options = EngineOptions {
            holidays: [date(2025, 12, 25), date(2025, 12, 26)].into_iter().collect(),
            unresolved_fail_threshold: None,
        };
        let engine = Reconciler::new(&store, &dir, options);

        let run = engine.generate(&request()).unwrap();
        let targets: Vec<_> = run
            .report()
            .decisions_of(DecisionKind::Create)
            .map(|d| d.target_date.unwrap())
            .collect();
        assert_eq!(
            targets,
            vec![date(2025, 12, 19), date(2025, 12, 24), date(2025, 12, 30)]
        );
    }

    #[test]
    fn unresolved_roles_warn_and_threshold_fails() {
        let store = InMemoryStore::new();
        seed(&store, &payroll());
        let dir = InMemoryRoleDirectory::new().with_role("PAYROLL", Some("alice"), None);

        let run = Reconciler::new(&store, &dir, EngineOptions::default())
            .generate(&request().dry_run(true))
            .unwrap();
        assert_eq!(run.status(), RunStatus::Warn);
        assert_eq!(run.counters().unresolved_assignee, 2);
        assert_eq!(run.report().unresolved_roles, vec!["CONTROLLER", "CFO"]);

        let strict = EngineOptions {
            unresolved_fail_threshold: Some(1),
            ..EngineOptions::default()
        };
        let run = Reconciler::new(&store, &dir, strict)
            .generate(&request().dry_run(true))
            .unwrap();
        assert_eq!(run.status(), RunStatus::Fail);
    }

    #[test]
    fn date_filter_excludes_without_obsoleting() {
        let store = InMemoryStore::new();
        seed(&store, &payroll());
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());
        engine.generate(&request()).unwrap();

        let late_only = request().between(Some(date(2025, 12, 29)), None);
        let run = engine.generate(&late_only).unwrap();
        let c = run.counters();
        assert_eq!((c.filtered, c.unchanged, c.obsolete_marked), (2, 1, 0));
    }

    #[test]
    fn scope_limits_obsolescence() {
        let store = InMemoryStore::new();
        seed(&store, &payroll());
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());
        engine.generate(&request()).unwrap();

        let other = request().scope(Scope::Category("treasury".to_string()));
        let run = engine.generate(&other).unwrap();
        assert_eq!(run.counters(), &crate::run::RunCounters::default());
        assert!(store.all_entries().iter().all(|e| !e.obsolete));
    }

    #[test]
    fn malformed_step_is_skipped() {
        let store = InMemoryStore::new();
        let mut template = payroll();
        template.steps[0].role_code = " ".to_string();
        seed(&store, &template);
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());

        let run = engine.generate(&request()).unwrap();
        let c = run.counters();
        assert_eq!((c.skipped, c.created), (1, 2));
        assert_eq!(run.status(), RunStatus::Pass);
    }

    #[test]
    fn unplannable_steps_are_skipped_and_the_run_continues() {
        let store = InMemoryStore::new();
        let accruals = SeedTemplate {
            code: "ACCRUALS".to_string(),
            name: "Accruals".to_string(),
            category: "gl".to_string(),
            anchor_rule: AnchorRule::MonthEnd,
            schedule: None,
            active: true,
            steps: vec![step(1, ActivityKind::Prep, "CFO", DateRule::CalendarOffset(i32::MAX))],
        };
        let far_deadline = SeedTemplate {
            code: "LEGACY_RETURN".to_string(),
            name: "Legacy Return".to_string(),
            category: "statutory_filing".to_string(),
            anchor_rule: AnchorRule::Deadline,
            schedule: Some(ScheduleKey {
                form: "LEGACY".to_string(),
                period: "9999".to_string(),
                deadline: NaiveDate::MAX,
            }),
            active: true,
            steps: vec![step(1, ActivityKind::Prep, "TAX", DateRule::CalendarOffset(5))],
        };
        seed(&store, &accruals);
        seed(&store, &far_deadline);
        seed(&store, &payroll());
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());

        let run = engine.generate(&request()).unwrap();
        assert_eq!(run.fatal_error(), None);
        let c = run.counters();
        assert_eq!((c.skipped, c.created), (2, 3));
        assert_eq!(run.status(), RunStatus::Pass);

        let legacy = run
            .report()
            .decisions_of(DecisionKind::Skipped)
            .find(|d| d.template_code == "LEGACY_RETURN")
            .unwrap();
        assert!(legacy.detail.as_deref().unwrap().contains("out of range"));

        let again = engine.generate(&request()).unwrap();
        let c = again.counters();
        assert_eq!((c.skipped, c.unchanged, c.obsolete_marked), (2, 3, 0));
    }

    #[test]
    fn overflowing_period_aborts_with_report() {
        let store = InMemoryStore::new();
        seed(&store, &payroll());
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());

        let run = engine
            .generate(&GenerateRequest::new("MONTH_END_CLOSE", "2147483647-12"))
            .unwrap();
        assert_eq!(run.status(), RunStatus::Fail);
        assert!(run.fatal_error().unwrap().contains("2147483647-12"));
        assert_eq!(run.counters().created, 0);
    }

    #[test]
    fn seed_id_defaults_to_current_seed() {
        let store = InMemoryStore::new();
        seed(&store, &payroll());
        store.set_current_seed("close@v7").unwrap();
        let dir = directory();
        let engine = Reconciler::new(&store, &dir, EngineOptions::default());

        let run = engine.generate(&request().dry_run(true)).unwrap();
        assert_eq!(run.seed_id(), "close@v7");
        let pinned = engine
            .generate(&request().dry_run(true).seed_id("close@v8"))
            .unwrap();
        assert_eq!(pinned.seed_id(), "close@v8");
    }

    #[test]
    fn lookup_by_external_key_goes_through_the_map() {
        let store = InMemoryStore::new();
        seed(&store, &payroll());
        let dir = directory();
        Reconciler::new(&store, &dir, EngineOptions::default())
            .generate(&request())
            .unwrap();

        let key = "MONTH_END_CLOSE|2025-12|PAYROLL_PROCESSING|S01_PREP";
        let task_id = find_task_by_external_key(&store, key).unwrap().unwrap();
        assert_eq!(
            store.local_tracker().get(&task_id).unwrap().assignee.as_deref(),
            Some("alice")
        );
        assert_eq!(find_task_by_external_key(&store, "nope").unwrap(), None);
    }
}

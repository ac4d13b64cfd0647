//! Generation runs: the audit record of one reconciliation invocation.
//!
//! # State Machine
//! ```text
//! RunRecorder::start -> (record decisions) -> finalize -> GenerationRun (PASS | WARN | FAIL)
//! ```
//! A [`GenerationRun`] returned by [`RunRecorder::finalize`] has no mutators.

use crate::tracker::TaskId;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Pass,
    Warn,
    Fail,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Pass => "PASS",
            RunStatus::Warn => "WARN",
            RunStatus::Fail => "FAIL",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub created: u32,
    pub updated: u32,
    pub unchanged: u32,
    pub obsolete_marked: u32,
    pub unresolved_assignee: u32,
    pub filtered: u32,
    pub skipped: u32,
    pub write_errors: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Create,
    Update,
    Unchanged,
    Obsolete,
    /// Outside the requested date range.
    Filtered,
    /// Malformed seed data.
    Skipped,
    /// The task store or task map rejected a write.
    Failed,
}

/// Outcome for one expected (or formerly expected) task instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDecision {
    pub kind: DecisionKind,
    pub external_key: Option<String>,
    pub template_code: String,
    pub step_code: Option<String>,
    pub target_date: Option<NaiveDate>,
    pub assignee: Option<String>,
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl InstanceDecision {
    pub fn new(kind: DecisionKind, template_code: impl Into<String>) -> Self {
        Self {
            kind,
            external_key: None,
            template_code: template_code.into(),
            step_code: None,
            target_date: None,
            assignee: None,
            task_id: None,
            detail: None,
        }
    }

    pub fn key(mut self, external_key: impl Into<String>) -> Self {
        self.external_key = Some(external_key.into());
        self
    }

    pub fn step(mut self, step_code: impl Into<String>) -> Self {
        self.step_code = Some(step_code.into());
        self
    }

    pub fn target(mut self, date: NaiveDate) -> Self {
        self.target_date = Some(date);
        self
    }

    pub fn assignee(mut self, assignee: Option<String>) -> Self {
        self.assignee = assignee;
        self
    }

    pub fn task(mut self, task_id: Option<TaskId>) -> Self {
        self.task_id = task_id;
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Machine-assertable snapshot of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub counters: RunCounters,
    pub decisions: Vec<InstanceDecision>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl RunReport {
    pub fn decisions_of(&self, kind: DecisionKind) -> impl Iterator<Item = &InstanceDecision> {
        self.decisions.iter().filter(move |d| d.kind == kind)
    }
}

/// Thresholds that turn counters into a status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusPolicy {
    /// Unresolved assignees strictly above this fail the run.
    pub unresolved_fail_threshold: Option<u32>,
}

impl StatusPolicy {
    pub fn classify(&self, counters: &RunCounters, aborted: bool) -> RunStatus {
        let over_threshold = self
            .unresolved_fail_threshold
            .is_some_and(|limit| counters.unresolved_assignee > limit);
        if aborted || counters.write_errors > 0 || over_threshold {
            return RunStatus::Fail;
        }
        let stale_seed =
            counters.obsolete_marked > 0 && counters.created == 0 && counters.updated == 0;
        if counters.unresolved_assignee > 0 || stale_seed {
            return RunStatus::Warn;
        }
        RunStatus::Pass
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRun {
    id: Uuid,
    seed_id: String,
    cycle_code: String,
    cycle_key: String,
    dry_run: bool,
    status: RunStatus,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fatal_error: Option<String>,
    report: RunReport,
}

impl GenerationRun {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn seed_id(&self) -> &str {
        &self.seed_id
    }

    pub fn cycle_code(&self) -> &str {
        &self.cycle_code
    }

    pub fn cycle_key(&self) -> &str {
        &self.cycle_key
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal_error.as_deref()
    }

    pub fn counters(&self) -> &RunCounters {
        &self.report.counters
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// Operator-facing multi-line summary.
    pub fn summary(&self) -> String {
        let c = &self.report.counters;
        let mut out = format!(
            "{} {} (seed {}){}\n",
            self.status,
            self.cycle_key,
            self.seed_id,
            if self.dry_run { " [dry run]" } else { "" }
        );
        out.push_str(&format!(
            "  created {}, updated {}, unchanged {}, obsolete {}\n",
            c.created, c.updated, c.unchanged, c.obsolete_marked
        ));
        out.push_str(&format!(
            "  unresolved assignees {}, filtered {}, skipped {}, write errors {}\n",
            c.unresolved_assignee, c.filtered, c.skipped, c.write_errors
        ));
        if let Some(err) = &self.fatal_error {
            out.push_str(&format!("  aborted: {}\n", err));
        }
        for err in &self.report.errors {
            out.push_str(&format!("  error: {}\n", err));
        }
        out
    }
}

/// Accumulates a run while the engine works.
#[derive(Debug)]
pub struct RunRecorder {
    run: GenerationRun,
}

impl RunRecorder {
    pub fn start(seed_id: &str, cycle_code: &str, cycle_key: &str, dry_run: bool) -> Self {
        Self {
            run: GenerationRun {
                id: Uuid::new_v4(),
                seed_id: seed_id.to_string(),
                cycle_code: cycle_code.to_string(),
                cycle_key: cycle_key.to_string(),
                dry_run,
                status: RunStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                fatal_error: None,
                report: RunReport::default(),
            },
        }
    }

    pub fn id(&self) -> Uuid {
        self.run.id
    }

    /// In-progress view (status is still `RUNNING`).
    pub fn snapshot(&self) -> &GenerationRun {
        &self.run
    }

    pub fn record(&mut self, decision: InstanceDecision) {
        let counters = &mut self.run.report.counters;
        match decision.kind {
            DecisionKind::Create => counters.created += 1,
            DecisionKind::Update => counters.updated += 1,
            DecisionKind::Unchanged => counters.unchanged += 1,
            DecisionKind::Obsolete => counters.obsolete_marked += 1,
            DecisionKind::Filtered => counters.filtered += 1,
            DecisionKind::Skipped => counters.skipped += 1,
            DecisionKind::Failed => {
                counters.write_errors += 1;
                if let Some(detail) = &decision.detail {
                    self.run.report.errors.push(detail.clone());
                }
            }
        }
        self.run.report.decisions.push(decision);
    }

    pub fn note_unresolved(&mut self, role_code: &str) {
        self.run.report.counters.unresolved_assignee += 1;
        if !self.run.report.unresolved_roles.iter().any(|r| r == role_code) {
            self.run.report.unresolved_roles.push(role_code.to_string());
        }
    }

    /// Record a run-level failure; processing stops and the run will FAIL.
    pub fn abort(&mut self, reason: impl Into<String>) {
        self.run.fatal_error = Some(reason.into());
    }

    pub fn finalize(mut self, policy: &StatusPolicy) -> GenerationRun {
        let aborted = self.run.fatal_error.is_some();
        self.run.status = policy.classify(&self.run.report.counters, aborted);
        self.run.finished_at = Some(Utc::now());
        self.run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters() -> RunCounters {
        RunCounters::default()
    }

    #[test]
    fn clean_run_passes() {
        let c = RunCounters {
            created: 3,
            ..counters()
        };
        assert_eq!(StatusPolicy::default().classify(&c, false), RunStatus::Pass);
    }

    #[test]
    fn write_errors_and_aborts_fail() {
        let c = RunCounters {
            created: 2,
            write_errors: 1,
            ..counters()
        };
        assert_eq!(StatusPolicy::default().classify(&c, false), RunStatus::Fail);
        assert_eq!(
            StatusPolicy::default().classify(&counters(), true),
            RunStatus::Fail
        );
    }

    #[test]
    fn unresolved_assignees_warn_until_threshold() {
        let c = RunCounters {
            created: 3,
            unresolved_assignee: 2,
            ..counters()
        };
        assert_eq!(StatusPolicy::default().classify(&c, false), RunStatus::Warn);

        let lenient = StatusPolicy {
            unresolved_fail_threshold: Some(2),
        };
        assert_eq!(lenient.classify(&c, false), RunStatus::Warn);

        let strict = StatusPolicy {
            unresolved_fail_threshold: Some(1),
        };
        assert_eq!(strict.classify(&c, false), RunStatus::Fail);
    }

    #[test]
    fn obsolescence_without_content_change_warns() {
        let stale = RunCounters {
            unchanged: 2,
            obsolete_marked: 1,
            ..counters()
        };
        assert_eq!(StatusPolicy::default().classify(&stale, false), RunStatus::Warn);

        let reshaped = RunCounters {
            updated: 1,
            obsolete_marked: 1,
            ..counters()
        };
        assert_eq!(
            StatusPolicy::default().classify(&reshaped, false),
            RunStatus::Pass
        );
    }

    #[test]
    fn recorder_counts_decisions_and_finalizes() {
        let mut recorder =
            RunRecorder::start("close@v1", "MONTH_END_CLOSE", "MONTH_END_CLOSE|2025-12", false);
        recorder.record(InstanceDecision::new(DecisionKind::Create, "PAYROLL").key("k1"));
        recorder.record(InstanceDecision::new(DecisionKind::Unchanged, "PAYROLL").key("k2"));
        recorder.record(
            InstanceDecision::new(DecisionKind::Failed, "PAYROLL")
                .key("k3")
                .detail("task store down"),
        );
        recorder.note_unresolved("CFO");
        recorder.note_unresolved("CFO");
        assert_eq!(recorder.snapshot().status(), RunStatus::Running);

        let run = recorder.finalize(&StatusPolicy::default());
        assert_eq!(run.status(), RunStatus::Fail);
        assert!(run.finished_at().is_some());
        let c = run.counters();
        assert_eq!((c.created, c.unchanged, c.write_errors), (1, 1, 1));
        assert_eq!(c.unresolved_assignee, 2);
        assert_eq!(run.report().unresolved_roles, vec!["CFO".to_string()]);
        assert_eq!(run.report().errors, vec!["task store down".to_string()]);
        assert!(run.summary().starts_with("FAIL MONTH_END_CLOSE|2025-12"));
    }

    #[test]
    fn report_serializes_with_uppercase_status() {
        let run = RunRecorder::start("s", "C", "C|1", true).finalize(&StatusPolicy::default());
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["status"], "PASS");
        assert_eq!(json["dry_run"], true);
        assert_eq!(json["report"]["counters"]["created"], 0);
        let back: GenerationRun = serde_json::from_value(json).unwrap();
        assert_eq!(back, run);
    }
}

//! Seed data model: templates of recurring work and their steps.
//!
//! # Invariants
//! - A template exclusively owns its steps; steps have no identity of their own
//!   beyond `(template code, step code)`.
//! - Steps are always handed out in ascending `sequence` order.

mod bundle;
mod loader;

pub use bundle::{ScheduleSpec, SeedBundle, StepSpec, TemplateSpec};
pub use loader::{LoadSummary, SeedLoader};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A template or step that fails required-field validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SeedError {
    #[error("Template '{template}' is malformed: {reason}")]
    MalformedTemplate { template: String, reason: String },

    #[error("Step {sequence} of template '{template}' is malformed: {reason}")]
    MalformedStep {
        template: String,
        sequence: u32,
        reason: String,
    },

    #[error("Failed to parse seed bundle: {0}")]
    Parse(String),
}

/// Largest business-day or calendar-day offset a step may carry.
pub const MAX_STEP_OFFSET_DAYS: u32 = 366;

/// Kind of work a step represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Prep,
    Review,
    Approve,
    File,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Prep => "prep",
            ActivityKind::Review => "review",
            ActivityKind::Approve => "approve",
            ActivityKind::File => "file",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "prep" => Some(ActivityKind::Prep),
            "review" => Some(ActivityKind::Review),
            "approve" => Some(ActivityKind::Approve),
            "file" => Some(ActivityKind::File),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ActivityKind::Prep => "Prepare",
            ActivityKind::Review => "Review",
            ActivityKind::Approve => "Approve",
            ActivityKind::File => "File",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a template's dates are measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorRule {
    /// The cycle anchor (usually the last day of the closing month).
    #[default]
    MonthEnd,
    /// The template's own statutory deadline.
    Deadline,
    /// The anchor supplied by the operator for the run.
    Manual,
}

impl AnchorRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorRule::MonthEnd => "month_end",
            AnchorRule::Deadline => "deadline",
            AnchorRule::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "month_end" => Some(AnchorRule::MonthEnd),
            "deadline" => Some(AnchorRule::Deadline),
            "manual" => Some(AnchorRule::Manual),
            _ => None,
        }
    }
}

/// How a step's target date is derived from the anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "days", rename_all = "snake_case")]
pub enum DateRule {
    BusinessDaysBefore(u32),
    CalendarOffset(i32),
    OnAnchor,
}

impl DateRule {
    /// Normalize the raw per-step fields.
    ///
    /// A non-zero `business_days_before` wins over `offset_days`; with neither
    /// set (or `on_or_before_anchor`) the step lands on the anchor.
    pub fn from_fields(
        business_days_before: Option<u32>,
        offset_days: Option<i32>,
        on_or_before_anchor: bool,
    ) -> Self {
        match (business_days_before, offset_days) {
            _ if on_or_before_anchor => DateRule::OnAnchor,
            (Some(n), _) if n > 0 => DateRule::BusinessDaysBefore(n),
            (_, Some(d)) if d != 0 => DateRule::CalendarOffset(d),
            _ => DateRule::OnAnchor,
        }
    }

    /// Canonical text used for hashing and storage.
    pub fn canonical(&self) -> String {
        match self {
            DateRule::BusinessDaysBefore(n) => format!("bd_before:{}", n),
            DateRule::CalendarOffset(d) => format!("offset:{}", d),
            DateRule::OnAnchor => "on_anchor".to_string(),
        }
    }

    pub fn parse_canonical(value: &str) -> Option<Self> {
        if value == "on_anchor" {
            return Some(DateRule::OnAnchor);
        }
        let (kind, n) = value.split_once(':')?;
        match kind {
            "bd_before" => n.parse().ok().map(DateRule::BusinessDaysBefore),
            "offset" => n.parse().ok().map(DateRule::CalendarOffset),
            _ => None,
        }
    }
}

/// One activity within a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedStep {
    pub sequence: u32,
    pub activity: ActivityKind,
    pub role_code: String,
    pub date_rule: DateRule,
}

impl SeedStep {
    /// Derived step identity, stable across reloads: `S{sequence:02}_{KIND}`.
    ///
    /// Sequence and activity kind are both identity. Renumbering a step or
    /// changing its kind (say `prep` to `review`) retires the old instance as
    /// obsolete and creates a new one; it is never reported as an update.
    pub fn code(&self) -> String {
        format!(
            "S{:02}_{}",
            self.sequence,
            self.activity.as_str().to_uppercase()
        )
    }

    /// Filing steps and on-anchor rules never move off the anchor.
    pub fn pinned_to_anchor(&self) -> bool {
        self.activity == ActivityKind::File || self.date_rule == DateRule::OnAnchor
    }

    pub fn validate(&self, template_code: &str) -> Result<(), SeedError> {
        if self.role_code.trim().is_empty() {
            return Err(SeedError::MalformedStep {
                template: template_code.to_string(),
                sequence: self.sequence,
                reason: "missing role code".to_string(),
            });
        }
        let out_of_bounds = match self.date_rule {
            DateRule::BusinessDaysBefore(n) => n > MAX_STEP_OFFSET_DAYS,
            DateRule::CalendarOffset(d) => d.unsigned_abs() > MAX_STEP_OFFSET_DAYS,
            DateRule::OnAnchor => false,
        };
        if out_of_bounds {
            return Err(SeedError::MalformedStep {
                template: template_code.to_string(),
                sequence: self.sequence,
                reason: format!(
                    "date offset {} exceeds {} days",
                    self.date_rule.canonical(),
                    MAX_STEP_OFFSET_DAYS
                ),
            });
        }
        Ok(())
    }
}

/// Identity of a statutory schedule item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleKey {
    pub form: String,
    pub period: String,
    pub deadline: NaiveDate,
}

/// Natural key a template is upserted by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NaturalKey {
    Named { name: String, category: String },
    Schedule { form: String, period: String },
}

impl NaturalKey {
    /// Single-string rendering used as the storage key.
    pub fn storage_key(&self) -> String {
        match self {
            NaturalKey::Named { name, category } => format!("named|{}|{}", name, category),
            NaturalKey::Schedule { form, period } => format!("schedule|{}|{}", form, period),
        }
    }
}

/// A named, versioned unit of recurring work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedTemplate {
    pub code: String,
    pub name: String,
    pub category: String,
    pub anchor_rule: AnchorRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleKey>,
    pub active: bool,
    pub steps: Vec<SeedStep>,
}

impl SeedTemplate {
    pub fn natural_key(&self) -> NaturalKey {
        match &self.schedule {
            Some(s) => NaturalKey::Schedule {
                form: s.form.clone(),
                period: s.period.clone(),
            },
            None => NaturalKey::Named {
                name: self.name.clone(),
                category: self.category.clone(),
            },
        }
    }

    pub fn deadline(&self) -> Option<NaiveDate> {
        self.schedule.as_ref().map(|s| s.deadline)
    }

    /// Steps in ascending sequence order.
    pub fn ordered_steps(&self) -> Vec<&SeedStep> {
        let mut steps: Vec<&SeedStep> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.sequence);
        steps
    }

    /// Human-readable task title for one of this template's steps.
    pub fn task_name(&self, step: &SeedStep, period_label: &str) -> String {
        format!("{} - {} ({})", self.name, step.activity.label(), period_label)
    }

    pub fn validate(&self) -> Result<(), SeedError> {
        let malformed = |reason: &str| SeedError::MalformedTemplate {
            template: if self.code.is_empty() {
                self.name.clone()
            } else {
                self.code.clone()
            },
            reason: reason.to_string(),
        };
        if self.code.trim().is_empty() {
            return Err(malformed("missing code"));
        }
        if self.name.trim().is_empty() {
            return Err(malformed("missing name"));
        }
        if self.category.trim().is_empty() {
            return Err(malformed("missing category"));
        }
        if self.anchor_rule == AnchorRule::Deadline && self.schedule.is_none() {
            return Err(malformed("deadline anchor without a deadline"));
        }
        Ok(())
    }
}

/// Which templates a run covers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    All,
    Category(String),
    Template(String),
}

impl Scope {
    pub fn includes(&self, category: &str, template_code: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Category(c) => c == category,
            Scope::Template(t) => t == template_code,
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    /// `all`, `category:<name>` or `template:<code>`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("all") || value.is_empty() {
            return Ok(Scope::All);
        }
        match value.split_once(':') {
            Some(("category", c)) if !c.trim().is_empty() => {
                Ok(Scope::Category(c.trim().to_string()))
            }
            Some(("template", t)) if !t.trim().is_empty() => {
                Ok(Scope::Template(t.trim().to_string()))
            }
            _ => Err(format!(
                "invalid scope '{}': expected all, category:<name> or template:<code>",
                value
            )),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str("all"),
            Scope::Category(c) => write!(f, "category:{}", c),
            Scope::Template(t) => write!(f, "template:{}", t),
        }
    }
}

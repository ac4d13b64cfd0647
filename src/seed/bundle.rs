//! Seed bundle documents (JSON or YAML).
//!
//! ```json
//! {
//!   "seed_id": "month-end-close@v3",
//!   "templates": [
//!     { "name": "Payroll Processing", "category": "payroll",
//!       "steps": [ { "sequence": 1, "activity_kind": "prep", "role_code": "PAYROLL",
//!                    "business_days_before": 6 } ] }
//!   ],
//!   "schedules": [
//!     { "form": "VAT-201", "period": "2025-11", "deadline": "2025-12-25",
//!       "steps": [ { "sequence": 1, "activity_kind": "file", "role_code": "TAX" } ] }
//!   ]
//! }
//! ```

use super::{AnchorRule, DateRule, ScheduleKey, SeedError, SeedStep, SeedTemplate};
use crate::calendar::is_yaml_path;
use crate::util::slug_code;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedBundle {
    #[serde(default = "default_seed_id")]
    pub seed_id: String,
    #[serde(default)]
    pub templates: Vec<TemplateSpec>,
    #[serde(default)]
    pub schedules: Vec<ScheduleSpec>,
}

fn default_seed_id() -> String {
    "unversioned".to_string()
}

fn default_true() -> bool {
    true
}

fn default_schedule_category() -> String {
    "statutory_filing".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub name: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub anchor_rule: AnchorRule,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub form: String,
    pub period: String,
    pub deadline: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_schedule_category")]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// Raw step fields as authored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub sequence: u32,
    pub activity_kind: super::ActivityKind,
    #[serde(default)]
    pub role_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_days_before: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_days: Option<i32>,
    #[serde(default)]
    pub on_or_before_anchor: bool,
}

impl StepSpec {
    pub fn to_step(&self) -> SeedStep {
        SeedStep {
            sequence: self.sequence,
            activity: self.activity_kind,
            role_code: self.role_code.trim().to_string(),
            date_rule: DateRule::from_fields(
                self.business_days_before,
                self.offset_days,
                self.on_or_before_anchor,
            ),
        }
    }
}

impl TemplateSpec {
    /// Without an explicit `code`, the code is slugged from name and category,
    /// the same pair the store upserts by.
    pub fn to_template(&self) -> SeedTemplate {
        SeedTemplate {
            code: self
                .code
                .as_deref()
                .map(|c| c.trim().to_string())
                .unwrap_or_else(|| {
                    slug_code(&format!("{} {}", self.name, self.category))
                }),
            name: self.name.trim().to_string(),
            category: self.category.trim().to_string(),
            anchor_rule: self.anchor_rule,
            schedule: None,
            active: self.active,
            steps: self.steps.iter().map(StepSpec::to_step).collect(),
        }
    }
}

impl ScheduleSpec {
    pub fn to_template(&self) -> SeedTemplate {
        let form = self.form.trim().to_string();
        let period = self.period.trim().to_string();
        SeedTemplate {
            code: self
                .code
                .as_deref()
                .map(|c| c.trim().to_string())
                .unwrap_or_else(|| slug_code(&format!("{} {}", form, period))),
            name: self
                .name
                .as_deref()
                .map(|n| n.trim().to_string())
                .unwrap_or_else(|| format!("{} {}", form, period)),
            category: self.category.trim().to_string(),
            anchor_rule: AnchorRule::Deadline,
            schedule: Some(ScheduleKey {
                form,
                period,
                deadline: self.deadline,
            }),
            active: self.active,
            steps: self.steps.iter().map(StepSpec::to_step).collect(),
        }
    }
}

impl SeedBundle {
    pub fn from_json_str(raw: &str) -> Result<Self, SeedError> {
        serde_json::from_str(raw).map_err(|e| SeedError::Parse(e.to_string()))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, SeedError> {
        serde_yaml::from_str(raw).map_err(|e| SeedError::Parse(e.to_string()))
    }

    /// Read a bundle file; `.yaml`/`.yml` parse as YAML, anything else as JSON.
    pub fn from_path(path: &Path) -> Result<Self, SeedError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SeedError::Parse(format!("{}: {}", path.display(), e)))?;
        if is_yaml_path(path) {
            Self::from_yaml_str(&raw)
        } else {
            Self::from_json_str(&raw)
        }
    }

    /// All template groups, named templates first, then schedule items.
    pub fn templates(&self) -> Vec<SeedTemplate> {
        self.templates
            .iter()
            .map(TemplateSpec::to_template)
            .chain(self.schedules.iter().map(ScheduleSpec::to_template))
            .collect()
    }
}

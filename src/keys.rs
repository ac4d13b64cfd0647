//! Deterministic identity and content hashing for expected task instances.
//!
//! External key: `cycle_key|template_code|step_code[|deadline]`, each part
//! trimmed and nothing else normalized.
//!
//! Seed hash: SHA-256 over the content-bearing fields of a template/step pair.
//! Identity-bearing fields (codes, cycle) are not hashed: a content edit keeps
//! the key and changes the hash.

use crate::seed::{SeedStep, SeedTemplate};
use chrono::NaiveDate;
use sha2::{Digest, Sha256};

pub const KEY_SEPARATOR: char = '|';

/// Bumped whenever the hashed field list changes.
const HASH_VERSION: &str = "v1";

/// Field separator inside the hash preimage (ASCII unit separator).
const FIELD_SEPARATOR: u8 = 0x1f;

/// `CODE|period`, e.g. `MONTH_END_CLOSE|2025-11`.
pub fn cycle_key(cycle_code: &str, period: &str) -> String {
    format!("{}{}{}", cycle_code.trim(), KEY_SEPARATOR, period.trim())
}

pub fn external_key(
    cycle_key: &str,
    template_code: &str,
    step_code: &str,
    deadline: Option<NaiveDate>,
) -> String {
    let mut key =
        String::with_capacity(cycle_key.len() + template_code.len() + step_code.len() + 14);
    key.push_str(cycle_key.trim());
    key.push(KEY_SEPARATOR);
    key.push_str(template_code.trim());
    key.push(KEY_SEPARATOR);
    key.push_str(step_code.trim());
    if let Some(deadline) = deadline {
        key.push(KEY_SEPARATOR);
        key.push_str(&deadline.format(crate::calendar::DATE_FORMAT).to_string());
    }
    key
}

/// Hex-encoded SHA-256 of the template/step content.
pub fn seed_hash(template: &SeedTemplate, step: &SeedStep) -> String {
    let date_rule = step.date_rule.canonical();
    let fields: [&str; 7] = [
        HASH_VERSION,
        template.name.trim(),
        template.category.trim(),
        template.anchor_rule.as_str(),
        step.activity.as_str(),
        step.role_code.trim(),
        &date_rule,
    ];
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.as_bytes());
        hasher.update([FIELD_SEPARATOR]);
    }
    hex::encode(hasher.finalize())
}

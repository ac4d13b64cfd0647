//! Seed Store Loader: writes a bundle into the seed store.
//!
//! Each template is upserted by natural key and its steps fully replaced, so
//! loading the same bundle twice leaves the store unchanged.

use super::{SeedBundle, SeedStep, SeedTemplate};
use crate::store::{SeedStore, StoreError, UpsertOutcome};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub inserted: u32,
    pub updated: u32,
    pub steps_written: u32,
    /// Templates and steps dropped by validation or a template code conflict.
    pub rejected: u32,
}

pub struct SeedLoader<'a> {
    store: &'a dyn SeedStore,
}

impl<'a> SeedLoader<'a> {
    pub fn new(store: &'a dyn SeedStore) -> Self {
        Self { store }
    }

    /// Load every template group of `bundle`, then mark it as the current seed.
    ///
    /// Malformed templates and steps, and templates whose code already belongs
    /// to another template, are skipped and counted; other storage errors stop
    /// the load.
    pub fn load(&self, bundle: &SeedBundle) -> Result<LoadSummary, StoreError> {
        let mut summary = LoadSummary::default();

        for template in bundle.templates() {
            if let Err(e) = template.validate() {
                warn!(error = %e, "Rejected seed template");
                summary.rejected += 1;
                continue;
            }

            let (steps, rejected) = accepted_steps(&template);
            summary.rejected += rejected;

            match self.store.upsert_template(&template) {
                Ok(UpsertOutcome::Inserted) => summary.inserted += 1,
                Ok(UpsertOutcome::Updated) => summary.updated += 1,
                Err(e @ StoreError::TemplateCodeConflict { .. }) => {
                    warn!(error = %e, name = %template.name, "Rejected seed template");
                    summary.rejected += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
            let written = self.store.replace_steps(&template.natural_key(), &steps)?;
            summary.steps_written += written as u32;
        }

        self.store.set_current_seed(&bundle.seed_id)?;
        info!(
            seed_id = %bundle.seed_id,
            inserted = summary.inserted,
            updated = summary.updated,
            steps = summary.steps_written,
            rejected = summary.rejected,
            "Seed bundle loaded"
        );
        Ok(summary)
    }
}

/// Valid steps in sequence order, plus the number dropped.
fn accepted_steps(template: &SeedTemplate) -> (Vec<SeedStep>, u32) {
    let mut seen = HashSet::new();
    let mut rejected = 0;
    let mut steps = Vec::with_capacity(template.steps.len());

    for step in template.ordered_steps() {
        if let Err(e) = step.validate(&template.code) {
            warn!(error = %e, "Rejected seed step");
            rejected += 1;
            continue;
        }
        if !seen.insert(step.code()) {
            warn!(
                template = %template.code,
                step_code = %step.code(),
                "Rejected duplicate step"
            );
            rejected += 1;
            continue;
        }
        steps.push(step.clone());
    }
    (steps, rejected)
}

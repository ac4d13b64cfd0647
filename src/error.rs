//! Error taxonomy of a reconciliation run.
//!
//! Instance-level variants are recovered inside the engine and end up in the
//! run report. Only run-level failures reach callers of
//! [`Reconciler::generate`](crate::engine::Reconciler::generate).

use crate::calendar::CalendarError;
use crate::roles::UnresolvedReason;
use crate::seed::SeedError;
use crate::store::StoreError;
use crate::tracker::TrackerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    SeedMalformed(#[from] SeedError),

    #[error("Role '{role_code}' unresolved ({reason:?})")]
    RoleUnresolved {
        role_code: String,
        reason: UnresolvedReason,
    },

    #[error("Duplicate external key: {0}")]
    DuplicateExternalKey(String),

    #[error(transparent)]
    CollaboratorWriteFailure(#[from] TrackerError),

    #[error("Invalid calendar input: {0}")]
    CalendarInputInvalid(#[from] CalendarError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateExternalKey(key) => ReconcileError::DuplicateExternalKey(key),
            other => ReconcileError::Store(other),
        }
    }
}

//! # Seed Reconciler
//!
//! Declarative task generation for recurring finance and compliance work.
//!
//! A versioned seed of templates and steps describes what must happen every
//! cycle. For one cycle the engine expands the seed into expected task
//! instances, each with a deterministic external key and a content hash, and
//! reconciles them against what was generated before.
//!
//! ## Flow
//!
//! ```text
//!   seed bundle ──load──▶ SeedStore
//!                            │
//!                            ▼
//!   Calendar ──▶ Reconciler ◀── RoleResolver
//!                   │    │
//!                   ▼    ▼
//!         TaskMapStore  TaskTracker
//!                   │
//!                   ▼
//!              RunLog (GenerationRun)
//! ```
//!
//! ## Modules
//! - `calendar`: business-day arithmetic over weekends and a holiday set
//! - `keys`: external keys and seed hashes
//! - `seed`: seed model, bundle parsing and the loader
//! - `roles`: role code → assignee resolution
//! - `engine`: the reconciliation engine
//! - `run`: generation run audit records and status policy
//! - `store`: storage traits with in-memory and SQLite backends
//! - `tracker`: the task-tracking collaborator interface

pub mod calendar;
pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod roles;
pub mod run;
pub mod seed;
pub mod store;
pub mod tracker;
pub mod util;

pub use calendar::{Calendar, HolidaySet};
pub use config::Config;
pub use engine::{EngineOptions, GenerateRequest, Reconciler};
pub use error::ReconcileError;
pub use run::{GenerationRun, RunStatus};
pub use seed::{SeedBundle, SeedLoader};
pub use store::{create_store, Backend, StoreType};

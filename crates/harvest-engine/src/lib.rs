//! Extraction-run orchestration, online identity resolution, progress
//! estimation and offline duplicate reconciliation.

pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod locking;
pub mod progress;
pub mod provider;
pub mod resolver;
pub mod runs;
pub mod schedule;

pub use config::HarvestConfig;
pub use coordinator::{RunCoordinator, RunError};
pub use dedup::{
    run_duplicate_cleanup, CleanupOutcome, CleanupReport, DuplicateCleaner, EntityKind,
    ExternalReferenceCheck, MergeContext, NoExternalReferences,
};
pub use locking::CommandLock;
pub use provider::{BatchProvider, FetchError, FixtureBatchProvider, PageWindow};
pub use resolver::{OnlineResolver, Resolution};
pub use runs::{NewRun, RunService, RunUpdate};
pub use schedule::build_cleanup_scheduler;

//! Persistence abstraction for the harvester.
//!
//! The engine talks to a [`Store`] through a [`Session`], which tracks
//! whether the session has been poisoned by an unrecoverable failure.
//! Two implementations ship here: [`memory::InMemoryStore`] for tests and
//! fixture-only runs, and [`postgres::PgStore`] for the shared database.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{
    Company, CompanyBranch, ContactAddress, ContactLink, ExtractionRun, JobPosting,
    KeywordConfigState, Location,
};
use uuid::Uuid;

mod error;
pub mod memory;
pub mod postgres;
mod session;
pub mod testing;

pub use error::StoreError;
pub use session::Session;

/// Lease name held by the duplicate cleanup command.
pub const CLEANUP_LEASE: &str = "duplicate-cleanup";

/// Storage operations used by the resolution pipeline and the offline
/// deduplicator. Implementations must be safe to share across tasks.
///
/// Duplicate rows are an accepted write-time outcome; nothing in this trait
/// enforces identity uniqueness.
#[async_trait]
pub trait Store: Send + Sync {
    // companies
    async fn insert_company(&self, company: &Company) -> Result<(), StoreError>;
    async fn update_company(&self, company: &Company) -> Result<(), StoreError>;
    async fn get_company(&self, id: Uuid) -> Result<Option<Company>, StoreError>;
    async fn companies_created_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Company>, StoreError>;
    async fn delete_company(&self, id: Uuid) -> Result<(), StoreError>;

    // locations
    async fn insert_location(&self, location: &Location) -> Result<(), StoreError>;
    async fn update_location(&self, location: &Location) -> Result<(), StoreError>;
    async fn get_location(&self, id: Uuid) -> Result<Option<Location>, StoreError>;
    async fn locations_created_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Location>, StoreError>;
    async fn delete_location(&self, id: Uuid) -> Result<(), StoreError>;

    // branches
    async fn insert_branch(&self, branch: &CompanyBranch) -> Result<(), StoreError>;
    async fn update_branch(&self, branch: &CompanyBranch) -> Result<(), StoreError>;
    async fn get_branch(&self, id: Uuid) -> Result<Option<CompanyBranch>, StoreError>;
    async fn branches_created_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CompanyBranch>, StoreError>;
    async fn delete_branch(&self, id: Uuid) -> Result<(), StoreError>;
    async fn reassign_branches_to_company(&self, from: Uuid, to: Uuid) -> Result<(), StoreError>;
    async fn reassign_branches_to_location(&self, from: Uuid, to: Uuid) -> Result<(), StoreError>;

    // contact addresses + link rows
    async fn insert_contact(&self, contact: &ContactAddress) -> Result<(), StoreError>;
    async fn get_contact(&self, id: Uuid) -> Result<Option<ContactAddress>, StoreError>;
    async fn contacts_created_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ContactAddress>, StoreError>;
    async fn delete_contact(&self, id: Uuid) -> Result<(), StoreError>;
    async fn link_contact(&self, link: &ContactLink) -> Result<(), StoreError>;
    async fn contact_links_for_address(
        &self,
        address_id: Uuid,
    ) -> Result<Vec<ContactLink>, StoreError>;
    async fn reassign_contact_links_to_company(
        &self,
        from: Uuid,
        to: Uuid,
    ) -> Result<(), StoreError>;
    async fn reassign_contact_links_to_address(
        &self,
        from: Uuid,
        to: Uuid,
    ) -> Result<(), StoreError>;

    // postings
    async fn insert_posting(&self, posting: &JobPosting) -> Result<(), StoreError>;
    async fn update_posting(&self, posting: &JobPosting) -> Result<(), StoreError>;
    async fn get_posting(&self, id: Uuid) -> Result<Option<JobPosting>, StoreError>;
    async fn delete_posting(&self, id: Uuid) -> Result<(), StoreError>;
    async fn postings_created_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobPosting>, StoreError>;
    async fn postings_for_runs(&self, run_ids: &[Uuid]) -> Result<Vec<JobPosting>, StoreError>;
    /// Cheap pre-filtered lookup keyed by URL, consulted before the identity
    /// index to short-circuit exact rediscoveries.
    async fn find_posting_by_url(
        &self,
        url: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<JobPosting>, StoreError>;
    async fn find_posting_by_identity(
        &self,
        identity_hash: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<JobPosting>, StoreError>;
    async fn reassign_postings_to_company(&self, from: Uuid, to: Uuid) -> Result<(), StoreError>;
    async fn reassign_postings_to_branch(&self, from: Uuid, to: Uuid) -> Result<(), StoreError>;
    async fn reassign_postings_to_location(&self, from: Uuid, to: Uuid) -> Result<(), StoreError>;
    async fn reassign_postings_to_contact(&self, from: Uuid, to: Uuid) -> Result<(), StoreError>;

    // run <-> posting and keyword bookkeeping
    async fn bind_run_posting(&self, run_id: Uuid, posting_id: Uuid) -> Result<(), StoreError>;
    async fn run_ids_for_posting(&self, posting_id: Uuid) -> Result<Vec<Uuid>, StoreError>;
    async fn rebind_posting_runs(&self, from: Uuid, to: Uuid) -> Result<(), StoreError>;
    async fn bind_keyword_posting(
        &self,
        run_id: Uuid,
        keyword: &str,
        posting_id: Uuid,
    ) -> Result<(), StoreError>;
    async fn rebind_keyword_postings(&self, from: Uuid, to: Uuid) -> Result<(), StoreError>;

    // runs
    async fn insert_run(&self, run: &ExtractionRun) -> Result<(), StoreError>;
    /// Plain fetch by id with no-lock read semantics; safe to call from a
    /// fresh session while another session for the same run is broken.
    async fn get_run(&self, id: Uuid) -> Result<Option<ExtractionRun>, StoreError>;
    async fn update_run(&self, run: &ExtractionRun) -> Result<(), StoreError>;
    async fn upsert_keyword_config(&self, state: &KeywordConfigState) -> Result<(), StoreError>;
    async fn keyword_configs(&self, run_id: Uuid) -> Result<Vec<KeywordConfigState>, StoreError>;
    /// Number of runs still `IN_PROGRESS` that were created at or after
    /// `since`. Coarse, best-effort signal used to keep maintenance away
    /// from live extractions; stale crashed runs age out via `since`.
    async fn active_extraction_runs(&self, since: DateTime<Utc>) -> Result<i64, StoreError>;
    /// Average per-run found-count for `keyword` across prior runs with the
    /// same limit semantics (capped vs. uncapped). `None` when no peer run
    /// ever handled the keyword.
    async fn peer_keyword_average(
        &self,
        keyword: &str,
        capped: bool,
        exclude_run: Uuid,
    ) -> Result<Option<f64>, StoreError>;

    // write barriers and maintenance scopes
    /// Explicit write barrier. Ordering of flush calls inside a batch is a
    /// load-bearing invariant of the coordinator (lock-contention avoidance).
    async fn flush(&self) -> Result<(), StoreError>;
    async fn begin(&self) -> Result<(), StoreError>;
    async fn commit(&self) -> Result<(), StoreError>;
    async fn rollback(&self) -> Result<(), StoreError>;

    // advisory lease
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StoreError>;
    async fn lease_holder(&self, name: &str) -> Result<Option<String>, StoreError>;
}

//! Session wrapper that tracks unrecoverable persistence failures.
//!
//! Every store call goes through the session. The first unrecoverable error
//! marks the session poisoned; all subsequent calls fail fast with
//! [`StoreError::SessionPoisoned`] instead of issuing further operations
//! against an untrustworthy connection. Recovery code opens a *fresh*
//! session over the same store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use harvest_core::{
    Company, CompanyBranch, ContactAddress, ContactLink, ExtractionRun, JobPosting,
    KeywordConfigState, Location,
};
use uuid::Uuid;

use crate::{Store, StoreError};

pub struct Session {
    store: Arc<dyn Store>,
    poisoned: AtomicBool,
}

macro_rules! delegate {
    ($($(#[$meta:meta])* fn $name:ident(&self $(, $arg:ident: $ty:ty)*) -> $ret:ty;)*) => {
        $(
            $(#[$meta])*
            pub async fn $name(&self $(, $arg: $ty)*) -> Result<$ret, StoreError> {
                self.ensure_usable()?;
                self.track(self.store.$name($($arg),*).await)
            }
        )*
    };
}

impl Session {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            poisoned: AtomicBool::new(false),
        }
    }

    /// The underlying store, for opening a fresh session during recovery.
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn ensure_usable(&self) -> Result<(), StoreError> {
        if self.is_poisoned() {
            return Err(StoreError::SessionPoisoned);
        }
        Ok(())
    }

    fn track<T>(&self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(err) = &result {
            if err.is_unrecoverable() {
                self.poisoned.store(true, Ordering::SeqCst);
            }
        }
        result
    }

    delegate! {
        fn insert_company(&self, company: &Company) -> ();
        fn update_company(&self, company: &Company) -> ();
        fn get_company(&self, id: Uuid) -> Option<Company>;
        fn companies_created_since(&self, cutoff: DateTime<Utc>) -> Vec<Company>;
        fn delete_company(&self, id: Uuid) -> ();

        fn insert_location(&self, location: &Location) -> ();
        fn update_location(&self, location: &Location) -> ();
        fn get_location(&self, id: Uuid) -> Option<Location>;
        fn locations_created_since(&self, cutoff: DateTime<Utc>) -> Vec<Location>;
        fn delete_location(&self, id: Uuid) -> ();

        fn insert_branch(&self, branch: &CompanyBranch) -> ();
        fn update_branch(&self, branch: &CompanyBranch) -> ();
        fn get_branch(&self, id: Uuid) -> Option<CompanyBranch>;
        fn branches_created_since(&self, cutoff: DateTime<Utc>) -> Vec<CompanyBranch>;
        fn delete_branch(&self, id: Uuid) -> ();
        fn reassign_branches_to_company(&self, from: Uuid, to: Uuid) -> ();
        fn reassign_branches_to_location(&self, from: Uuid, to: Uuid) -> ();

        fn insert_contact(&self, contact: &ContactAddress) -> ();
        fn get_contact(&self, id: Uuid) -> Option<ContactAddress>;
        fn contacts_created_since(&self, cutoff: DateTime<Utc>) -> Vec<ContactAddress>;
        fn delete_contact(&self, id: Uuid) -> ();
        fn link_contact(&self, link: &ContactLink) -> ();
        fn contact_links_for_address(&self, address_id: Uuid) -> Vec<ContactLink>;
        fn reassign_contact_links_to_company(&self, from: Uuid, to: Uuid) -> ();
        fn reassign_contact_links_to_address(&self, from: Uuid, to: Uuid) -> ();

        fn insert_posting(&self, posting: &JobPosting) -> ();
        fn update_posting(&self, posting: &JobPosting) -> ();
        fn get_posting(&self, id: Uuid) -> Option<JobPosting>;
        fn delete_posting(&self, id: Uuid) -> ();
        fn postings_created_since(&self, cutoff: DateTime<Utc>) -> Vec<JobPosting>;
        fn postings_for_runs(&self, run_ids: &[Uuid]) -> Vec<JobPosting>;
        fn find_posting_by_url(&self, url: &str, cutoff: DateTime<Utc>) -> Option<JobPosting>;
        fn find_posting_by_identity(&self, identity_hash: &str, cutoff: DateTime<Utc>) -> Option<JobPosting>;
        fn reassign_postings_to_company(&self, from: Uuid, to: Uuid) -> ();
        fn reassign_postings_to_branch(&self, from: Uuid, to: Uuid) -> ();
        fn reassign_postings_to_location(&self, from: Uuid, to: Uuid) -> ();
        fn reassign_postings_to_contact(&self, from: Uuid, to: Uuid) -> ();

        fn bind_run_posting(&self, run_id: Uuid, posting_id: Uuid) -> ();
        fn run_ids_for_posting(&self, posting_id: Uuid) -> Vec<Uuid>;
        fn rebind_posting_runs(&self, from: Uuid, to: Uuid) -> ();
        fn bind_keyword_posting(&self, run_id: Uuid, keyword: &str, posting_id: Uuid) -> ();
        fn rebind_keyword_postings(&self, from: Uuid, to: Uuid) -> ();

        fn insert_run(&self, run: &ExtractionRun) -> ();
        fn active_extraction_runs(&self, since: DateTime<Utc>) -> i64;
        fn get_run(&self, id: Uuid) -> Option<ExtractionRun>;
        fn update_run(&self, run: &ExtractionRun) -> ();
        fn upsert_keyword_config(&self, state: &KeywordConfigState) -> ();
        fn keyword_configs(&self, run_id: Uuid) -> Vec<KeywordConfigState>;
        fn peer_keyword_average(&self, keyword: &str, capped: bool, exclude_run: Uuid) -> Option<f64>;

        fn flush(&self) -> ();
        fn begin(&self) -> ();
        fn commit(&self) -> ();
        fn rollback(&self) -> ();

        fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> bool;
        fn release_lease(&self, name: &str, holder: &str) -> ();
        fn lease_holder(&self, name: &str) -> Option<String>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::testing::FaultInjectingStore;

    fn posting(run_id: Uuid) -> JobPosting {
        JobPosting {
            id: Uuid::new_v4(),
            source: harvest_core::Source::Indeed,
            title: "Rust Engineer".into(),
            description: None,
            url: "https://jobs.example/1".into(),
            host: None,
            salary_min: None,
            salary_max: None,
            posted_at: None,
            languages: vec![],
            remote: false,
            company_id: None,
            branch_id: None,
            location_id: None,
            contact_address_id: None,
            identity_hash: "abc".into(),
            first_seen_run_id: run_id,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn unrecoverable_failure_poisons_the_session() {
        let store = Arc::new(FaultInjectingStore::new(Arc::new(InMemoryStore::new())));
        store.fail_once_on("insert_posting");
        let session = Session::new(store);

        let row = posting(Uuid::new_v4());
        let err = session.insert_posting(&row).await.unwrap_err();
        assert!(err.is_unrecoverable());
        assert!(session.is_poisoned());

        // Subsequent calls fail fast without touching the store.
        let err = session.flush().await.unwrap_err();
        assert!(matches!(err, StoreError::SessionPoisoned));
    }

    #[tokio::test]
    async fn fresh_session_over_same_store_is_usable() {
        let store = Arc::new(FaultInjectingStore::new(Arc::new(InMemoryStore::new())));
        store.fail_once_on("insert_posting");
        let session = Session::new(store);

        let row = posting(Uuid::new_v4());
        assert!(session.insert_posting(&row).await.is_err());

        let fresh = Session::new(session.store());
        fresh.insert_posting(&row).await.unwrap();
        assert!(fresh.get_posting(row.id).await.unwrap().is_some());
    }
}

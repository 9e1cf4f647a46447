//! Test doubles shipped with the library so downstream crates can exercise
//! the failure-recovery protocol without a real database.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{
    Company, CompanyBranch, ContactAddress, ContactLink, ExtractionRun, JobPosting,
    KeywordConfigState, Location,
};
use uuid::Uuid;

use crate::{Store, StoreError};

/// Wraps another [`Store`] and fails exactly one armed method call with an
/// unrecoverable error, then passes everything through untouched.
pub struct FaultInjectingStore {
    inner: Arc<dyn Store>,
    armed: Mutex<Option<String>>,
}

impl FaultInjectingStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self {
            inner,
            armed: Mutex::new(None),
        }
    }

    /// Arm the next call to `method` to fail with
    /// [`StoreError::Unrecoverable`].
    pub fn fail_once_on(&self, method: &str) {
        *self.armed.lock().expect("fault lock") = Some(method.to_string());
    }

    fn trip(&self, method: &str) -> Result<(), StoreError> {
        let mut armed = self.armed.lock().expect("fault lock");
        if armed.as_deref() == Some(method) {
            armed.take();
            return Err(StoreError::Unrecoverable(format!(
                "injected failure in {method}"
            )));
        }
        Ok(())
    }
}

macro_rules! fault_store_impl {
    ($($name:ident(&self $(, $arg:ident: $ty:ty)*) -> $ret:ty;)*) => {
        #[async_trait]
        impl Store for FaultInjectingStore {
            $(
                async fn $name(&self $(, $arg: $ty)*) -> Result<$ret, StoreError> {
                    self.trip(stringify!($name))?;
                    self.inner.$name($($arg),*).await
                }
            )*
        }
    };
}

fault_store_impl! {
    insert_company(&self, company: &Company) -> ();
    update_company(&self, company: &Company) -> ();
    get_company(&self, id: Uuid) -> Option<Company>;
    companies_created_since(&self, cutoff: DateTime<Utc>) -> Vec<Company>;
    delete_company(&self, id: Uuid) -> ();

    insert_location(&self, location: &Location) -> ();
    update_location(&self, location: &Location) -> ();
    get_location(&self, id: Uuid) -> Option<Location>;
    locations_created_since(&self, cutoff: DateTime<Utc>) -> Vec<Location>;
    delete_location(&self, id: Uuid) -> ();

    insert_branch(&self, branch: &CompanyBranch) -> ();
    update_branch(&self, branch: &CompanyBranch) -> ();
    get_branch(&self, id: Uuid) -> Option<CompanyBranch>;
    branches_created_since(&self, cutoff: DateTime<Utc>) -> Vec<CompanyBranch>;
    delete_branch(&self, id: Uuid) -> ();
    reassign_branches_to_company(&self, from: Uuid, to: Uuid) -> ();
    reassign_branches_to_location(&self, from: Uuid, to: Uuid) -> ();

    insert_contact(&self, contact: &ContactAddress) -> ();
    get_contact(&self, id: Uuid) -> Option<ContactAddress>;
    contacts_created_since(&self, cutoff: DateTime<Utc>) -> Vec<ContactAddress>;
    delete_contact(&self, id: Uuid) -> ();
    link_contact(&self, link: &ContactLink) -> ();
    contact_links_for_address(&self, address_id: Uuid) -> Vec<ContactLink>;
    reassign_contact_links_to_company(&self, from: Uuid, to: Uuid) -> ();
    reassign_contact_links_to_address(&self, from: Uuid, to: Uuid) -> ();

    insert_posting(&self, posting: &JobPosting) -> ();
    update_posting(&self, posting: &JobPosting) -> ();
    get_posting(&self, id: Uuid) -> Option<JobPosting>;
    delete_posting(&self, id: Uuid) -> ();
    postings_created_since(&self, cutoff: DateTime<Utc>) -> Vec<JobPosting>;
    postings_for_runs(&self, run_ids: &[Uuid]) -> Vec<JobPosting>;
    find_posting_by_url(&self, url: &str, cutoff: DateTime<Utc>) -> Option<JobPosting>;
    find_posting_by_identity(&self, identity_hash: &str, cutoff: DateTime<Utc>) -> Option<JobPosting>;
    reassign_postings_to_company(&self, from: Uuid, to: Uuid) -> ();
    reassign_postings_to_branch(&self, from: Uuid, to: Uuid) -> ();
    reassign_postings_to_location(&self, from: Uuid, to: Uuid) -> ();
    reassign_postings_to_contact(&self, from: Uuid, to: Uuid) -> ();

    bind_run_posting(&self, run_id: Uuid, posting_id: Uuid) -> ();
    run_ids_for_posting(&self, posting_id: Uuid) -> Vec<Uuid>;
    rebind_posting_runs(&self, from: Uuid, to: Uuid) -> ();
    bind_keyword_posting(&self, run_id: Uuid, keyword: &str, posting_id: Uuid) -> ();
    rebind_keyword_postings(&self, from: Uuid, to: Uuid) -> ();

    insert_run(&self, run: &ExtractionRun) -> ();
    active_extraction_runs(&self, since: DateTime<Utc>) -> i64;
    get_run(&self, id: Uuid) -> Option<ExtractionRun>;
    update_run(&self, run: &ExtractionRun) -> ();
    upsert_keyword_config(&self, state: &KeywordConfigState) -> ();
    keyword_configs(&self, run_id: Uuid) -> Vec<KeywordConfigState>;
    peer_keyword_average(&self, keyword: &str, capped: bool, exclude_run: Uuid) -> Option<f64>;

    flush(&self) -> ();
    begin(&self) -> ();
    commit(&self) -> ();
    rollback(&self) -> ();

    try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> bool;
    release_lease(&self, name: &str, holder: &str) -> ();
    lease_holder(&self, name: &str) -> Option<String>;
}

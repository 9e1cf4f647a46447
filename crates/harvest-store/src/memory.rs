//! In-memory [`Store`] used by tests and fixture-only runs.
//!
//! Mutating operations append their name to an operation log so tests can
//! assert barrier ordering (the coordinator's flush discipline).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{
    Company, CompanyBranch, ContactAddress, ContactLink, ExtractionRun, JobPosting,
    KeywordConfigState, Location,
};
use uuid::Uuid;

use crate::{Store, StoreError};

#[derive(Default, Clone)]
struct MemInner {
    companies: HashMap<Uuid, Company>,
    locations: HashMap<Uuid, Location>,
    branches: HashMap<Uuid, CompanyBranch>,
    contacts: HashMap<Uuid, ContactAddress>,
    contact_links: Vec<ContactLink>,
    postings: HashMap<Uuid, JobPosting>,
    runs: HashMap<Uuid, ExtractionRun>,
    run_postings: Vec<(Uuid, Uuid)>,
    keyword_configs: HashMap<(Uuid, String, String), KeywordConfigState>,
    keyword_postings: Vec<(Uuid, String, Uuid)>,
    leases: HashMap<String, (String, DateTime<Utc>)>,
    ops: Vec<String>,
    snapshot: Option<Box<MemInner>>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<MemInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutating operations issued so far, in order.
    pub fn op_log(&self) -> Vec<String> {
        self.inner.lock().expect("store lock").ops.clone()
    }

    fn with<T>(&self, f: impl FnOnce(&mut MemInner) -> T) -> T {
        let mut inner = self.inner.lock().expect("store lock");
        f(&mut inner)
    }

    fn record(&self, op: &str) {
        self.with(|inner| inner.ops.push(op.to_string()));
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_company(&self, company: &Company) -> Result<(), StoreError> {
        self.record("insert_company");
        self.with(|i| i.companies.insert(company.id, company.clone()));
        Ok(())
    }

    async fn update_company(&self, company: &Company) -> Result<(), StoreError> {
        self.record("update_company");
        self.with(|i| match i.companies.get_mut(&company.id) {
            Some(row) => {
                *row = company.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(company.id)),
        })
    }

    async fn get_company(&self, id: Uuid) -> Result<Option<Company>, StoreError> {
        Ok(self.with(|i| i.companies.get(&id).cloned()))
    }

    async fn companies_created_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Company>, StoreError> {
        let mut rows: Vec<_> = self.with(|i| {
            i.companies
                .values()
                .filter(|c| c.created_at >= cutoff)
                .cloned()
                .collect()
        });
        rows.sort_by_key(|c| c.created_at);
        Ok(rows)
    }

    async fn delete_company(&self, id: Uuid) -> Result<(), StoreError> {
        self.record("delete_company");
        self.with(|i| i.companies.remove(&id));
        Ok(())
    }

    async fn insert_location(&self, location: &Location) -> Result<(), StoreError> {
        self.record("insert_location");
        self.with(|i| i.locations.insert(location.id, location.clone()));
        Ok(())
    }

    async fn update_location(&self, location: &Location) -> Result<(), StoreError> {
        self.record("update_location");
        self.with(|i| match i.locations.get_mut(&location.id) {
            Some(row) => {
                *row = location.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(location.id)),
        })
    }

    async fn get_location(&self, id: Uuid) -> Result<Option<Location>, StoreError> {
        Ok(self.with(|i| i.locations.get(&id).cloned()))
    }

    async fn locations_created_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Location>, StoreError> {
        let mut rows: Vec<_> = self.with(|i| {
            i.locations
                .values()
                .filter(|l| l.created_at >= cutoff)
                .cloned()
                .collect()
        });
        rows.sort_by_key(|l| l.created_at);
        Ok(rows)
    }

    async fn delete_location(&self, id: Uuid) -> Result<(), StoreError> {
        self.record("delete_location");
        self.with(|i| i.locations.remove(&id));
        Ok(())
    }

    async fn insert_branch(&self, branch: &CompanyBranch) -> Result<(), StoreError> {
        self.record("insert_branch");
        self.with(|i| i.branches.insert(branch.id, branch.clone()));
        Ok(())
    }

    async fn update_branch(&self, branch: &CompanyBranch) -> Result<(), StoreError> {
        self.record("update_branch");
        self.with(|i| match i.branches.get_mut(&branch.id) {
            Some(row) => {
                *row = branch.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(branch.id)),
        })
    }

    async fn get_branch(&self, id: Uuid) -> Result<Option<CompanyBranch>, StoreError> {
        Ok(self.with(|i| i.branches.get(&id).cloned()))
    }

    async fn branches_created_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CompanyBranch>, StoreError> {
        let mut rows: Vec<_> = self.with(|i| {
            i.branches
                .values()
                .filter(|b| b.created_at >= cutoff)
                .cloned()
                .collect()
        });
        rows.sort_by_key(|b| b.created_at);
        Ok(rows)
    }

    async fn delete_branch(&self, id: Uuid) -> Result<(), StoreError> {
        self.record("delete_branch");
        self.with(|i| i.branches.remove(&id));
        Ok(())
    }

    async fn reassign_branches_to_company(&self, from: Uuid, to: Uuid) -> Result<(), StoreError> {
        self.record("reassign_branches_to_company");
        self.with(|i| {
            for branch in i.branches.values_mut() {
                if branch.company_id == from {
                    branch.company_id = to;
                }
            }
        });
        Ok(())
    }

    async fn reassign_branches_to_location(&self, from: Uuid, to: Uuid) -> Result<(), StoreError> {
        self.record("reassign_branches_to_location");
        self.with(|i| {
            for branch in i.branches.values_mut() {
                if branch.location_id == Some(from) {
                    branch.location_id = Some(to);
                }
            }
        });
        Ok(())
    }

    async fn insert_contact(&self, contact: &ContactAddress) -> Result<(), StoreError> {
        self.record("insert_contact");
        self.with(|i| i.contacts.insert(contact.id, contact.clone()));
        Ok(())
    }

    async fn get_contact(&self, id: Uuid) -> Result<Option<ContactAddress>, StoreError> {
        Ok(self.with(|i| i.contacts.get(&id).cloned()))
    }

    async fn contacts_created_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ContactAddress>, StoreError> {
        let mut rows: Vec<_> = self.with(|i| {
            i.contacts
                .values()
                .filter(|c| c.created_at >= cutoff)
                .cloned()
                .collect()
        });
        rows.sort_by_key(|c| c.created_at);
        Ok(rows)
    }

    async fn delete_contact(&self, id: Uuid) -> Result<(), StoreError> {
        self.record("delete_contact");
        self.with(|i| {
            i.contacts.remove(&id);
            i.contact_links.retain(|l| l.address_id != id);
        });
        Ok(())
    }

    async fn link_contact(&self, link: &ContactLink) -> Result<(), StoreError> {
        self.record("link_contact");
        self.with(|i| {
            if !i
                .contact_links
                .iter()
                .any(|l| l.company_id == link.company_id && l.address_id == link.address_id)
            {
                i.contact_links.push(link.clone());
            }
        });
        Ok(())
    }

    async fn contact_links_for_address(
        &self,
        address_id: Uuid,
    ) -> Result<Vec<ContactLink>, StoreError> {
        Ok(self.with(|i| {
            i.contact_links
                .iter()
                .filter(|l| l.address_id == address_id)
                .cloned()
                .collect()
        }))
    }

    async fn reassign_contact_links_to_company(
        &self,
        from: Uuid,
        to: Uuid,
    ) -> Result<(), StoreError> {
        self.record("reassign_contact_links_to_company");
        self.with(|i| {
            for link in i.contact_links.iter_mut() {
                if link.company_id == from {
                    link.company_id = to;
                }
            }
            dedup_links(&mut i.contact_links);
        });
        Ok(())
    }

    async fn reassign_contact_links_to_address(
        &self,
        from: Uuid,
        to: Uuid,
    ) -> Result<(), StoreError> {
        self.record("reassign_contact_links_to_address");
        self.with(|i| {
            for link in i.contact_links.iter_mut() {
                if link.address_id == from {
                    link.address_id = to;
                }
            }
            dedup_links(&mut i.contact_links);
        });
        Ok(())
    }

    async fn insert_posting(&self, posting: &JobPosting) -> Result<(), StoreError> {
        self.record("insert_posting");
        self.with(|i| i.postings.insert(posting.id, posting.clone()));
        Ok(())
    }

    async fn update_posting(&self, posting: &JobPosting) -> Result<(), StoreError> {
        self.record("update_posting");
        self.with(|i| match i.postings.get_mut(&posting.id) {
            Some(row) => {
                *row = posting.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(posting.id)),
        })
    }

    async fn get_posting(&self, id: Uuid) -> Result<Option<JobPosting>, StoreError> {
        Ok(self.with(|i| i.postings.get(&id).cloned()))
    }

    async fn delete_posting(&self, id: Uuid) -> Result<(), StoreError> {
        self.record("delete_posting");
        self.with(|i| {
            i.postings.remove(&id);
            i.run_postings.retain(|(_, p)| *p != id);
            i.keyword_postings.retain(|(_, _, p)| *p != id);
        });
        Ok(())
    }

    async fn postings_created_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobPosting>, StoreError> {
        let mut rows: Vec<_> = self.with(|i| {
            i.postings
                .values()
                .filter(|p| p.created_at >= cutoff)
                .cloned()
                .collect()
        });
        rows.sort_by_key(|p| p.created_at);
        Ok(rows)
    }

    async fn postings_for_runs(&self, run_ids: &[Uuid]) -> Result<Vec<JobPosting>, StoreError> {
        let mut rows: Vec<_> = self.with(|i| {
            let bound: Vec<Uuid> = i
                .run_postings
                .iter()
                .filter(|(run, _)| run_ids.contains(run))
                .map(|(_, posting)| *posting)
                .collect();
            i.postings
                .values()
                .filter(|p| bound.contains(&p.id))
                .cloned()
                .collect()
        });
        rows.sort_by_key(|p| p.created_at);
        Ok(rows)
    }

    async fn find_posting_by_url(
        &self,
        url: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<JobPosting>, StoreError> {
        Ok(self.with(|i| {
            i.postings
                .values()
                .filter(|p| p.url == url && p.created_at >= cutoff)
                .max_by_key(|p| p.created_at)
                .cloned()
        }))
    }

    async fn find_posting_by_identity(
        &self,
        identity_hash: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<JobPosting>, StoreError> {
        Ok(self.with(|i| {
            i.postings
                .values()
                .filter(|p| p.identity_hash == identity_hash && p.created_at >= cutoff)
                .max_by_key(|p| p.created_at)
                .cloned()
        }))
    }

    async fn reassign_postings_to_company(&self, from: Uuid, to: Uuid) -> Result<(), StoreError> {
        self.record("reassign_postings_to_company");
        self.with(|i| {
            for posting in i.postings.values_mut() {
                if posting.company_id == Some(from) {
                    posting.company_id = Some(to);
                }
            }
        });
        Ok(())
    }

    async fn reassign_postings_to_branch(&self, from: Uuid, to: Uuid) -> Result<(), StoreError> {
        self.record("reassign_postings_to_branch");
        self.with(|i| {
            for posting in i.postings.values_mut() {
                if posting.branch_id == Some(from) {
                    posting.branch_id = Some(to);
                }
            }
        });
        Ok(())
    }

    async fn reassign_postings_to_location(&self, from: Uuid, to: Uuid) -> Result<(), StoreError> {
        self.record("reassign_postings_to_location");
        self.with(|i| {
            for posting in i.postings.values_mut() {
                if posting.location_id == Some(from) {
                    posting.location_id = Some(to);
                }
            }
        });
        Ok(())
    }

    async fn reassign_postings_to_contact(&self, from: Uuid, to: Uuid) -> Result<(), StoreError> {
        self.record("reassign_postings_to_contact");
        self.with(|i| {
            for posting in i.postings.values_mut() {
                if posting.contact_address_id == Some(from) {
                    posting.contact_address_id = Some(to);
                }
            }
        });
        Ok(())
    }

    async fn bind_run_posting(&self, run_id: Uuid, posting_id: Uuid) -> Result<(), StoreError> {
        self.record("bind_run_posting");
        self.with(|i| {
            if !i.run_postings.contains(&(run_id, posting_id)) {
                i.run_postings.push((run_id, posting_id));
            }
        });
        Ok(())
    }

    async fn run_ids_for_posting(&self, posting_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.with(|i| {
            i.run_postings
                .iter()
                .filter(|(_, p)| *p == posting_id)
                .map(|(run, _)| *run)
                .collect()
        }))
    }

    async fn rebind_posting_runs(&self, from: Uuid, to: Uuid) -> Result<(), StoreError> {
        self.record("rebind_posting_runs");
        self.with(|i| {
            let runs: Vec<Uuid> = i
                .run_postings
                .iter()
                .filter(|(_, p)| *p == from)
                .map(|(run, _)| *run)
                .collect();
            i.run_postings.retain(|(_, p)| *p != from);
            for run in runs {
                if !i.run_postings.contains(&(run, to)) {
                    i.run_postings.push((run, to));
                }
            }
        });
        Ok(())
    }

    async fn bind_keyword_posting(
        &self,
        run_id: Uuid,
        keyword: &str,
        posting_id: Uuid,
    ) -> Result<(), StoreError> {
        self.record("bind_keyword_posting");
        self.with(|i| {
            let row = (run_id, keyword.to_string(), posting_id);
            if !i.keyword_postings.contains(&row) {
                i.keyword_postings.push(row);
            }
        });
        Ok(())
    }

    async fn rebind_keyword_postings(&self, from: Uuid, to: Uuid) -> Result<(), StoreError> {
        self.record("rebind_keyword_postings");
        self.with(|i| {
            let moved: Vec<(Uuid, String)> = i
                .keyword_postings
                .iter()
                .filter(|(_, _, p)| *p == from)
                .map(|(run, kw, _)| (*run, kw.clone()))
                .collect();
            i.keyword_postings.retain(|(_, _, p)| *p != from);
            for (run, kw) in moved {
                let row = (run, kw, to);
                if !i.keyword_postings.contains(&row) {
                    i.keyword_postings.push(row);
                }
            }
        });
        Ok(())
    }

    async fn insert_run(&self, run: &ExtractionRun) -> Result<(), StoreError> {
        self.record("insert_run");
        self.with(|i| i.runs.insert(run.id, run.clone()));
        Ok(())
    }

    async fn active_extraction_runs(&self, since: DateTime<Utc>) -> Result<i64, StoreError> {
        Ok(self.with(|i| {
            i.runs
                .values()
                .filter(|r| r.status == harvest_core::RunStatus::InProgress && r.created_at >= since)
                .count() as i64
        }))
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<ExtractionRun>, StoreError> {
        Ok(self.with(|i| i.runs.get(&id).cloned()))
    }

    async fn update_run(&self, run: &ExtractionRun) -> Result<(), StoreError> {
        self.record("update_run");
        self.with(|i| match i.runs.get_mut(&run.id) {
            Some(row) => {
                *row = run.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(run.id)),
        })
    }

    async fn upsert_keyword_config(&self, state: &KeywordConfigState) -> Result<(), StoreError> {
        self.record("upsert_keyword_config");
        self.with(|i| {
            let key = (
                state.run_id,
                state.keyword.clone(),
                state.configuration.clone(),
            );
            i.keyword_configs.insert(key, state.clone());
        });
        Ok(())
    }

    async fn keyword_configs(&self, run_id: Uuid) -> Result<Vec<KeywordConfigState>, StoreError> {
        let mut rows: Vec<_> = self.with(|i| {
            i.keyword_configs
                .values()
                .filter(|s| s.run_id == run_id)
                .cloned()
                .collect()
        });
        rows.sort_by(|a, b| {
            (a.keyword.as_str(), a.configuration.as_str())
                .cmp(&(b.keyword.as_str(), b.configuration.as_str()))
        });
        Ok(rows)
    }

    async fn peer_keyword_average(
        &self,
        keyword: &str,
        capped: bool,
        exclude_run: Uuid,
    ) -> Result<Option<f64>, StoreError> {
        Ok(self.with(|i| {
            let mut per_run = Vec::new();
            for run in i.runs.values() {
                if run.id == exclude_run || run.result_cap.is_some() != capped {
                    continue;
                }
                let found: i64 = i
                    .keyword_configs
                    .values()
                    .filter(|s| s.run_id == run.id && s.keyword == keyword)
                    .map(|s| s.found)
                    .sum();
                let has_rows = i
                    .keyword_configs
                    .values()
                    .any(|s| s.run_id == run.id && s.keyword == keyword);
                if has_rows {
                    per_run.push(found as f64);
                }
            }
            if per_run.is_empty() {
                None
            } else {
                Some(per_run.iter().sum::<f64>() / per_run.len() as f64)
            }
        }))
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.record("flush");
        Ok(())
    }

    async fn begin(&self) -> Result<(), StoreError> {
        self.record("begin");
        self.with(|i| {
            let mut snapshot = i.clone();
            snapshot.snapshot = None;
            i.snapshot = Some(Box::new(snapshot));
        });
        Ok(())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        self.record("commit");
        self.with(|i| i.snapshot = None);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        self.with(|i| {
            if let Some(snapshot) = i.snapshot.take() {
                let mut restored = *snapshot;
                restored.ops = i.ops.clone();
                *i = restored;
            }
            i.ops.push("rollback".to_string());
        });
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let expires = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        Ok(self.with(|i| match i.leases.get(name) {
            Some((existing, until)) if *until > now && existing != holder => false,
            _ => {
                i.leases
                    .insert(name.to_string(), (holder.to_string(), expires));
                true
            }
        }))
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        self.with(|i| {
            if let Some((existing, _)) = i.leases.get(name) {
                if existing == holder {
                    i.leases.remove(name);
                }
            }
        });
        Ok(())
    }

    async fn lease_holder(&self, name: &str) -> Result<Option<String>, StoreError> {
        let now = Utc::now();
        Ok(self.with(|i| {
            i.leases
                .get(name)
                .filter(|(_, until)| *until > now)
                .map(|(holder, _)| holder.clone())
        }))
    }
}

fn dedup_links(links: &mut Vec<ContactLink>) {
    let mut seen = Vec::new();
    links.retain(|l| {
        let key = (l.company_id, l.address_id);
        if seen.contains(&key) {
            false
        } else {
            seen.push(key);
            true
        }
    });
}

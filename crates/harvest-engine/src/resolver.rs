//! Online identity resolution for one normalized posting record.
//!
//! The resolver decides whether a candidate is already known (by its
//! title + company match key within a recency window) or must be inserted
//! as a fresh sub-graph. The cheaper URL index is consulted by the caller
//! before this stage. Either way the resolved posting is bound to the
//! current run, because a re-run for the same keyword must still "find"
//! previously known postings.

use chrono::{DateTime, Duration, Utc};
use harvest_core::{
    fingerprint, Company, CompanyBranch, ContactAddress, ContactLink, ExtractionRun, JobPosting,
    Location, PostingDraft,
};
use harvest_store::{Session, StoreError};
use tracing::{debug, warn};
use uuid::Uuid;

/// How far back the online lookups reach. Older rows are left to the
/// offline deduplicator.
pub const RECENCY_WINDOW_DAYS: i64 = 30;

pub fn recency_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(RECENCY_WINDOW_DAYS)
}

#[derive(Debug, Clone)]
pub enum Resolution {
    /// Candidate was unknown; a fresh sub-graph was staged for insertion.
    New(JobPosting),
    /// Candidate matched an already-stored posting; only the run binding
    /// was added.
    Existing(JobPosting),
}

impl Resolution {
    pub fn posting(&self) -> &JobPosting {
        match self {
            Resolution::New(p) | Resolution::Existing(p) => p,
        }
    }
}

pub struct OnlineResolver<'a> {
    session: &'a Session,
}

impl<'a> OnlineResolver<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Resolve one candidate. Returns `None` when the candidate is not
    /// permitted to exist (no company) or fails validation; both are
    /// per-record conditions that never abort the run.
    pub async fn resolve(
        &self,
        draft: &PostingDraft,
        configuration: &str,
        run: &ExtractionRun,
    ) -> Result<Option<Resolution>, StoreError> {
        // Postings without a company are not permitted to exist standalone.
        let Some(company_name) = draft.resolvable_company_name() else {
            debug!(
                url = %draft.url,
                configuration,
                "dropping candidate without a resolvable company name"
            );
            return Ok(None);
        };

        let now = Utc::now();
        let match_key = fingerprint::posting_match_key(&draft.title, company_name);
        if let Some(existing) = self
            .session
            .find_posting_by_identity(&match_key, recency_cutoff(now))
            .await?
        {
            self.session.bind_run_posting(run.id, existing.id).await?;
            return Ok(Some(Resolution::Existing(existing)));
        }

        if let Err(reason) = validate_draft(draft) {
            warn!(
                url = %draft.url,
                configuration,
                reason,
                "dropping candidate that failed validation"
            );
            return Ok(None);
        }

        let posting = self.stage_subgraph(draft, company_name, run, now).await?;
        self.session.bind_run_posting(run.id, posting.id).await?;
        Ok(Some(Resolution::New(posting)))
    }

    /// Insert the full candidate sub-graph: location, company, branch,
    /// contact address, posting. Duplicate companies/branches/locations are
    /// an accepted outcome here; the offline deduplicator reconciles them.
    async fn stage_subgraph(
        &self,
        draft: &PostingDraft,
        company_name: &str,
        run: &ExtractionRun,
        now: DateTime<Utc>,
    ) -> Result<JobPosting, StoreError> {
        let location_id = if draft.location_name.is_some()
            || draft.location_country.is_some()
            || draft.latitude.is_some()
        {
            let location = Location {
                id: Uuid::new_v4(),
                name: draft.location_name.clone(),
                country: draft.location_country.clone(),
                region: draft.location_region.clone(),
                latitude: draft.latitude,
                longitude: draft.longitude,
                created_at: now,
            };
            self.session.insert_location(&location).await?;
            Some(location.id)
        } else {
            None
        };

        let company = Company {
            id: Uuid::new_v4(),
            name: company_name.to_string(),
            website: draft.company_website.clone(),
            founded_year: None,
            industries: Vec::new(),
            employee_range: None,
            social_links: Vec::new(),
            last_seen_with_offer: Some(now),
            created_at: now,
        };
        self.session.insert_company(&company).await?;

        let branch = CompanyBranch {
            id: Uuid::new_v4(),
            company_id: company.id,
            location_id,
            phone_numbers: draft.branch_phone_numbers.clone(),
            created_at: now,
        };
        self.session.insert_branch(&branch).await?;

        let contact_address_id = match &draft.contact_address {
            Some(address) => {
                let contact = ContactAddress {
                    id: Uuid::new_v4(),
                    address: address.trim().to_string(),
                    created_at: now,
                };
                self.session.insert_contact(&contact).await?;
                self.session
                    .link_contact(&ContactLink {
                        company_id: company.id,
                        address_id: contact.id,
                        usable_for_applications: true,
                    })
                    .await?;
                Some(contact.id)
            }
            None => None,
        };

        let posting = JobPosting {
            id: Uuid::new_v4(),
            source: draft.source,
            title: draft.title.trim().to_string(),
            description: draft.description.clone(),
            url: draft.url.trim().to_string(),
            host: draft.host.clone(),
            salary_min: draft.salary_min,
            salary_max: draft.salary_max,
            posted_at: draft.posted_at,
            languages: draft.languages.clone(),
            remote: draft.remote,
            company_id: Some(company.id),
            branch_id: Some(branch.id),
            location_id,
            contact_address_id,
            identity_hash: fingerprint::posting_match_key(&draft.title, company_name),
            first_seen_run_id: run.id,
            created_at: now,
        };
        self.session.insert_posting(&posting).await?;
        Ok(posting)
    }
}

/// Field constraints for the full candidate sub-graph. Returns the first
/// violation found.
pub fn validate_draft(draft: &PostingDraft) -> Result<(), &'static str> {
    if draft.title.trim().is_empty() {
        return Err("empty title");
    }
    if draft.title.len() > 512 {
        return Err("title exceeds 512 bytes");
    }
    let url = draft.url.trim();
    if url.is_empty() {
        return Err("empty url");
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err("url is not http(s)");
    }
    if let (Some(min), Some(max)) = (draft.salary_min, draft.salary_max) {
        if min > max {
            return Err("salary range inverted");
        }
    }
    if draft.salary_min.map_or(false, |v| v < 0) || draft.salary_max.map_or(false, |v| v < 0) {
        return Err("negative salary");
    }
    if draft.latitude.map_or(false, |v| !(-90.0..=90.0).contains(&v)) {
        return Err("latitude out of range");
    }
    if draft
        .longitude
        .map_or(false, |v| !(-180.0..=180.0).contains(&v))
    {
        return Err("longitude out of range");
    }
    if let Some(address) = &draft.contact_address {
        if !address.contains('@') {
            return Err("contact address is not an email");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::{RunStatus, Source};
    use harvest_store::memory::InMemoryStore;
    use std::sync::Arc;

    fn draft(title: &str, company: Option<&str>, url: &str) -> PostingDraft {
        PostingDraft {
            source: Source::Indeed,
            title: title.into(),
            description: None,
            url: url.into(),
            host: None,
            company_name: company.map(Into::into),
            company_website: None,
            branch_phone_numbers: vec![],
            location_name: None,
            location_country: None,
            location_region: None,
            latitude: None,
            longitude: None,
            contact_address: None,
            salary_min: None,
            salary_max: None,
            posted_at: None,
            languages: vec![],
            remote: false,
        }
    }

    fn run() -> ExtractionRun {
        ExtractionRun {
            id: Uuid::new_v4(),
            keywords: vec!["rust".into()],
            sources: vec![Source::Indeed],
            requested_configurations: vec![],
            country: None,
            location: None,
            distance_km: None,
            page_offset: 0,
            page_count: 1,
            result_cap: None,
            found_count: 0,
            new_count: 0,
            bound_count: 0,
            status: RunStatus::InProgress,
            percentage_done: None,
            error_message: None,
            error_trace: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    async fn session_with_run(run: &ExtractionRun) -> Session {
        let session = Session::new(Arc::new(InMemoryStore::new()));
        session.insert_run(run).await.unwrap();
        session
    }

    #[tokio::test]
    async fn candidate_without_company_is_never_persisted() {
        let run = run();
        let session = session_with_run(&run).await;
        let resolver = OnlineResolver::new(&session);

        let resolution = resolver
            .resolve(&draft("Rust Engineer", None, "https://x.example/1"), "indeed-any", &run)
            .await
            .unwrap();
        assert!(resolution.is_none());
        assert!(session
            .find_posting_by_url("https://x.example/1", recency_cutoff(Utc::now()))
            .await
            .unwrap()
            .is_none());

        // Whitespace-only names do not count as resolvable either.
        let resolution = resolver
            .resolve(
                &draft("Rust Engineer", Some("   "), "https://x.example/1"),
                "indeed-any",
                &run,
            )
            .await
            .unwrap();
        assert!(resolution.is_none());
    }

    #[tokio::test]
    async fn same_identity_twice_yields_one_insert_and_one_binding() {
        let run = run();
        let session = session_with_run(&run).await;
        let resolver = OnlineResolver::new(&session);

        let first = resolver
            .resolve(
                &draft("Rust Engineer", Some("Acme GmbH"), "https://x.example/1"),
                "indeed-any",
                &run,
            )
            .await
            .unwrap()
            .expect("resolved");
        assert!(matches!(first, Resolution::New(_)));

        // Different URL, same title + company: the match key wins.
        let second = resolver
            .resolve(
                &draft("rust engineer ", Some("ACME GMBH"), "https://y.example/2"),
                "indeed-any",
                &run,
            )
            .await
            .unwrap()
            .expect("resolved");
        match second {
            Resolution::Existing(p) => assert_eq!(p.id, first.posting().id),
            Resolution::New(_) => panic!("second resolution must bind, not insert"),
        }

        let runs = session.run_ids_for_posting(first.posting().id).await.unwrap();
        assert_eq!(runs, vec![run.id]);
    }

    #[tokio::test]
    async fn invalid_candidate_is_dropped_without_aborting() {
        let run = run();
        let session = session_with_run(&run).await;
        let resolver = OnlineResolver::new(&session);

        let mut bad = draft("Rust Engineer", Some("Acme GmbH"), "ftp://x.example/1");
        bad.salary_min = Some(90_000);
        bad.salary_max = Some(50_000);
        let resolution = resolver.resolve(&bad, "indeed-any", &run).await.unwrap();
        assert!(resolution.is_none());

        // The session stays usable for the next candidate.
        let ok = resolver
            .resolve(
                &draft("Rust Engineer", Some("Acme GmbH"), "https://x.example/1"),
                "indeed-any",
                &run,
            )
            .await
            .unwrap();
        assert!(ok.is_some());
    }

    #[tokio::test]
    async fn new_posting_carries_immutable_first_seen_run() {
        let run = run();
        let session = session_with_run(&run).await;
        let resolver = OnlineResolver::new(&session);

        let resolution = resolver
            .resolve(
                &draft("Rust Engineer", Some("Acme GmbH"), "https://x.example/1"),
                "indeed-any",
                &run,
            )
            .await
            .unwrap()
            .expect("resolved");
        let posting = resolution.posting();
        assert_eq!(posting.first_seen_run_id, run.id);
        assert_eq!(posting.company_id.is_some(), true);
        assert!(posting.branch_id.is_some());
    }
}

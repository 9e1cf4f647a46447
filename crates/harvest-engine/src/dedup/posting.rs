//! Posting merge, the only cleaner with a veto hook: rows referenced by
//! external consumers must survive untouched, and a hash collision guard
//! double-checks title similarity before any pair is merged.

use std::collections::HashMap;

use async_trait::async_trait;
use harvest_core::{fingerprint, Company, JobPosting};
use harvest_store::{Session, StoreError};
use strsim::jaro_winkler;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    cluster_duplicates, fill_empty, union_preserving_order, CleanupWindow, DuplicateCleaner,
    EntityKind, ExternalReferenceCheck, MergeContext,
};

/// Normalized-title similarity below this means the identity hashes matched
/// by accident and the pair is left alone.
pub const TITLE_SIMILARITY_FLOOR: f64 = 0.8;

pub struct PostingCleaner<'a> {
    refs: &'a dyn ExternalReferenceCheck,
}

impl<'a> PostingCleaner<'a> {
    pub fn new(refs: &'a dyn ExternalReferenceCheck) -> Self {
        Self { refs }
    }

    /// An external-check failure counts as "referenced": skipping a merge
    /// is recoverable, deleting a bookmarked posting is not.
    async fn is_referenced(&self, posting_id: Uuid) -> bool {
        match self.refs.is_referenced(posting_id).await {
            Ok(referenced) => referenced,
            Err(err) => {
                warn!(
                    posting_id = %posting_id,
                    error = %err,
                    "external reference check failed, treating posting as referenced"
                );
                true
            }
        }
    }

    async fn merge_pair(
        &self,
        session: &Session,
        anchor: &mut JobPosting,
        loser: &JobPosting,
    ) -> Result<(), StoreError> {
        fill_empty(&mut anchor.description, &loser.description);
        fill_empty(&mut anchor.host, &loser.host);
        fill_empty(&mut anchor.salary_min, &loser.salary_min);
        fill_empty(&mut anchor.salary_max, &loser.salary_max);
        fill_empty(&mut anchor.posted_at, &loser.posted_at);
        fill_empty(&mut anchor.branch_id, &loser.branch_id);
        fill_empty(&mut anchor.location_id, &loser.location_id);
        fill_empty(&mut anchor.contact_address_id, &loser.contact_address_id);
        anchor.remote = anchor.remote || loser.remote;
        union_preserving_order(&mut anchor.languages, &loser.languages);
        // first_seen_run_id stays with the anchor; it already is the
        // earliest sighting.

        session.rebind_posting_runs(loser.id, anchor.id).await?;
        session.rebind_keyword_postings(loser.id, anchor.id).await?;
        session.update_posting(anchor).await?;
        Ok(())
    }
}

#[async_trait]
impl DuplicateCleaner for PostingCleaner<'_> {
    fn kind(&self) -> EntityKind {
        EntityKind::Posting
    }

    async fn clean(
        &self,
        session: &Session,
        window: &CleanupWindow,
        ctx: &mut MergeContext,
    ) -> Result<u64, StoreError> {
        let mut rows = if window.run_ids.is_empty() {
            session.postings_created_since(window.cutoff).await?
        } else {
            session.postings_for_runs(&window.run_ids).await?
        };
        rows.sort_by_key(|p| p.created_at);

        let mut companies: HashMap<Uuid, Option<Company>> = HashMap::new();
        let mut identities = Vec::with_capacity(rows.len());
        for posting in &rows {
            let company_name = match posting.company_id {
                Some(company_id) => {
                    let company = match companies.get(&company_id) {
                        Some(cached) => cached.clone(),
                        None => {
                            let fetched = session.get_company(company_id).await?;
                            companies.insert(company_id, fetched.clone());
                            fetched
                        }
                    };
                    company.map(|c| c.name)
                }
                None => None,
            };
            match company_name {
                Some(name) => identities.push(fingerprint::posting_identity(
                    &posting.title,
                    &name,
                    &posting.url,
                )),
                // Cannot compute a trustworthy identity; keep it unique.
                None => identities.push(format!("orphan-{}", posting.id)),
            }
        }

        let mut merges = 0u64;
        for (anchor_idx, loser_idxs) in cluster_duplicates(&identities) {
            let mut anchor = rows[anchor_idx].clone();
            let anchor_referenced = self.is_referenced(anchor.id).await;
            for loser_idx in loser_idxs {
                let loser = &rows[loser_idx];
                if anchor_referenced || self.is_referenced(loser.id).await {
                    info!(
                        anchor = %anchor.id,
                        loser = %loser.id,
                        "skipping posting merge, at least one side is externally referenced"
                    );
                    continue;
                }
                let similarity = jaro_winkler(
                    &anchor.title.trim().to_lowercase(),
                    &loser.title.trim().to_lowercase(),
                );
                if similarity < TITLE_SIMILARITY_FLOOR {
                    warn!(
                        anchor = %anchor.id,
                        loser = %loser.id,
                        similarity,
                        "identity collision with dissimilar titles, not merging"
                    );
                    continue;
                }

                debug!(anchor = %anchor.id, loser = %loser.id, "merging posting");
                self.merge_pair(session, &mut anchor, loser).await?;
                ctx.record(EntityKind::Posting, loser.id);
                merges += 1;
                session.flush().await?;
            }
        }
        Ok(merges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::NoExternalReferences;
    use chrono::{Duration, Utc};
    use harvest_core::Source;
    use harvest_store::memory::InMemoryStore;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    struct FixedReferences {
        referenced: Vec<Uuid>,
        asked: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl ExternalReferenceCheck for FixedReferences {
        async fn is_referenced(&self, posting_id: Uuid) -> anyhow::Result<bool> {
            self.asked.lock().await.push(posting_id);
            Ok(self.referenced.contains(&posting_id))
        }
    }

    fn company(name: &str) -> Company {
        Company {
            id: Uuid::new_v4(),
            name: name.into(),
            website: None,
            founded_year: None,
            industries: vec![],
            employee_range: None,
            social_links: vec![],
            last_seen_with_offer: None,
            created_at: Utc::now() - Duration::hours(2),
        }
    }

    fn posting(title: &str, company_id: Uuid, url: &str, age_minutes: i64) -> JobPosting {
        JobPosting {
            id: Uuid::new_v4(),
            source: Source::Indeed,
            title: title.into(),
            description: None,
            url: url.into(),
            host: None,
            salary_min: None,
            salary_max: None,
            posted_at: None,
            languages: vec![],
            remote: false,
            company_id: Some(company_id),
            branch_id: None,
            location_id: None,
            contact_address_id: None,
            identity_hash: "unused-here".into(),
            first_seen_run_id: Uuid::new_v4(),
            created_at: Utc::now() - Duration::minutes(age_minutes),
        }
    }

    fn window() -> CleanupWindow {
        CleanupWindow {
            cutoff: Utc::now() - Duration::days(1),
            run_ids: vec![],
        }
    }

    #[tokio::test]
    async fn equal_identity_postings_merge_and_rebind_runs() {
        let session = Session::new(Arc::new(InMemoryStore::new()));
        let acme = company("Acme GmbH");
        session.insert_company(&acme).await.unwrap();

        let older = posting("Rust Engineer", acme.id, "https://x.example/1", 30);
        let mut newer = posting("rust engineer", acme.id, "https://x.example/1 ", 10);
        newer.description = Some("Great gig".into());
        newer.languages = vec!["de".into()];
        session.insert_posting(&older).await.unwrap();
        session.insert_posting(&newer).await.unwrap();

        let run_id = Uuid::new_v4();
        session.bind_run_posting(run_id, newer.id).await.unwrap();

        let mut ctx = MergeContext::new();
        let merges = PostingCleaner::new(&NoExternalReferences)
            .clean(&session, &window(), &mut ctx)
            .await
            .unwrap();

        assert_eq!(merges, 1);
        assert!(ctx.is_removed(EntityKind::Posting, newer.id));
        let merged = session.get_posting(older.id).await.unwrap().unwrap();
        assert_eq!(merged.description.as_deref(), Some("Great gig"));
        assert_eq!(merged.languages, vec!["de".to_string()]);
        assert_eq!(merged.first_seen_run_id, older.first_seen_run_id);
        let runs = session.run_ids_for_posting(older.id).await.unwrap();
        assert_eq!(runs, vec![run_id]);
    }

    #[tokio::test]
    async fn externally_referenced_postings_are_left_alone() {
        let session = Session::new(Arc::new(InMemoryStore::new()));
        let acme = company("Acme GmbH");
        session.insert_company(&acme).await.unwrap();
        let older = posting("Rust Engineer", acme.id, "https://x.example/1", 30);
        let newer = posting("Rust Engineer", acme.id, "https://x.example/1", 10);
        session.insert_posting(&older).await.unwrap();
        session.insert_posting(&newer).await.unwrap();

        let refs = FixedReferences {
            referenced: vec![newer.id],
            asked: Mutex::new(vec![]),
        };
        let mut ctx = MergeContext::new();
        let merges = PostingCleaner::new(&refs)
            .clean(&session, &window(), &mut ctx)
            .await
            .unwrap();

        assert_eq!(merges, 0);
        assert_eq!(ctx.total(), 0);
        assert!(session.get_posting(newer.id).await.unwrap().is_some());
        // Both sides of the pair were checked.
        let asked = refs.asked.lock().await;
        assert!(asked.contains(&older.id) && asked.contains(&newer.id));
    }

    #[test]
    fn similarity_floor_separates_title_variants_from_collisions() {
        let score = |a: &str, b: &str| jaro_winkler(&a.to_lowercase(), &b.to_lowercase());
        assert!(score("Rust Engineer", "Rust Engineer (m/w/d)") >= TITLE_SIMILARITY_FLOOR);
        assert!(score("Rust Engineer", "Facility Manager") < TITLE_SIMILARITY_FLOOR);
    }

    #[tokio::test]
    async fn run_scoped_window_ignores_unrelated_postings() {
        let session = Session::new(Arc::new(InMemoryStore::new()));
        let acme = company("Acme GmbH");
        session.insert_company(&acme).await.unwrap();

        let in_run_a = posting("Rust Engineer", acme.id, "https://x.example/1", 30);
        let in_run_b = posting("Rust Engineer", acme.id, "https://x.example/1", 10);
        let outside = posting("Rust Engineer", acme.id, "https://x.example/1", 5);
        for p in [&in_run_a, &in_run_b, &outside] {
            session.insert_posting(p).await.unwrap();
        }
        let run_id = Uuid::new_v4();
        session.bind_run_posting(run_id, in_run_a.id).await.unwrap();
        session.bind_run_posting(run_id, in_run_b.id).await.unwrap();

        let scoped = CleanupWindow {
            cutoff: Utc::now() - Duration::days(1),
            run_ids: vec![run_id],
        };
        let mut ctx = MergeContext::new();
        let merges = PostingCleaner::new(&NoExternalReferences)
            .clean(&session, &scoped, &mut ctx)
            .await
            .unwrap();

        assert_eq!(merges, 1);
        assert!(ctx.is_removed(EntityKind::Posting, in_run_b.id));
        assert!(!ctx.is_removed(EntityKind::Posting, outside.id));
    }
}

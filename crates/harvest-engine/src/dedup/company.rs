//! Company merge: identical name + website rows collapse into the oldest
//! one; profile fields fill in from the losers and children are repointed.

use async_trait::async_trait;
use harvest_core::fingerprint;
use harvest_store::{Session, StoreError};
use tracing::debug;

use super::{
    cluster_duplicates, fill_empty, union_preserving_order, CleanupWindow, DuplicateCleaner,
    EntityKind, MergeContext,
};

pub struct CompanyCleaner;

#[async_trait]
impl DuplicateCleaner for CompanyCleaner {
    fn kind(&self) -> EntityKind {
        EntityKind::Company
    }

    async fn clean(
        &self,
        session: &Session,
        window: &CleanupWindow,
        ctx: &mut MergeContext,
    ) -> Result<u64, StoreError> {
        let mut rows = session.companies_created_since(window.cutoff).await?;
        rows.sort_by_key(|c| c.created_at);
        let identities: Vec<String> = rows
            .iter()
            .map(|c| fingerprint::company_identity(&c.name, c.website.as_deref()))
            .collect();

        let mut merges = 0u64;
        for (anchor_idx, loser_idxs) in cluster_duplicates(&identities) {
            let mut anchor = rows[anchor_idx].clone();
            for loser_idx in loser_idxs {
                let loser = &rows[loser_idx];
                debug!(anchor = %anchor.id, loser = %loser.id, name = %anchor.name, "merging company");

                fill_empty(&mut anchor.website, &loser.website);
                fill_empty(&mut anchor.founded_year, &loser.founded_year);
                fill_empty(&mut anchor.employee_range, &loser.employee_range);
                anchor.last_seen_with_offer =
                    anchor.last_seen_with_offer.max(loser.last_seen_with_offer);
                union_preserving_order(&mut anchor.industries, &loser.industries);
                union_preserving_order(&mut anchor.social_links, &loser.social_links);

                session.reassign_branches_to_company(loser.id, anchor.id).await?;
                session.reassign_postings_to_company(loser.id, anchor.id).await?;
                session
                    .reassign_contact_links_to_company(loser.id, anchor.id)
                    .await?;
                session.update_company(&anchor).await?;
                ctx.record(EntityKind::Company, loser.id);
                merges += 1;
                session.flush().await?;
            }
        }
        Ok(merges)
    }
}

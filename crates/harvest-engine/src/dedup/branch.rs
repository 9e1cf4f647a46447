//! Branch merge. A branch has no identity of its own; it borrows the owning
//! company's name + website and the identity of its location. Runs after
//! the company and location cleaners so those rows are already settled.

use std::collections::HashMap;

use async_trait::async_trait;
use harvest_core::{fingerprint, Company, Location};
use harvest_store::{Session, StoreError};
use tracing::debug;
use uuid::Uuid;

use super::{
    cluster_duplicates, fill_empty, union_preserving_order, CleanupWindow, DuplicateCleaner,
    EntityKind, MergeContext,
};

pub struct BranchCleaner;

#[async_trait]
impl DuplicateCleaner for BranchCleaner {
    fn kind(&self) -> EntityKind {
        EntityKind::Branch
    }

    async fn clean(
        &self,
        session: &Session,
        window: &CleanupWindow,
        ctx: &mut MergeContext,
    ) -> Result<u64, StoreError> {
        let mut rows = session.branches_created_since(window.cutoff).await?;
        rows.sort_by_key(|b| b.created_at);

        let mut companies: HashMap<Uuid, Option<Company>> = HashMap::new();
        let mut locations: HashMap<Uuid, Option<Location>> = HashMap::new();
        let mut identities = Vec::with_capacity(rows.len());
        for branch in &rows {
            let company = match companies.get(&branch.company_id) {
                Some(cached) => cached.clone(),
                None => {
                    let fetched = session.get_company(branch.company_id).await?;
                    companies.insert(branch.company_id, fetched.clone());
                    fetched
                }
            };
            let Some(company) = company else {
                // No owning company row; give it an identity nothing else
                // can share so it never clusters.
                identities.push(format!("orphan-{}", branch.id));
                continue;
            };
            let location_identity = match branch.location_id {
                Some(location_id) => {
                    let location = match locations.get(&location_id) {
                        Some(cached) => cached.clone(),
                        None => {
                            let fetched = session.get_location(location_id).await?;
                            locations.insert(location_id, fetched.clone());
                            fetched
                        }
                    };
                    location.map(|l| {
                        fingerprint::location_identity(
                            l.name.as_deref(),
                            l.country.as_deref(),
                            l.latitude,
                            l.longitude,
                        )
                    })
                }
                None => None,
            };
            identities.push(fingerprint::branch_identity(
                &company.name,
                company.website.as_deref(),
                location_identity.as_deref(),
            ));
        }

        let mut merges = 0u64;
        for (anchor_idx, loser_idxs) in cluster_duplicates(&identities) {
            let mut anchor = rows[anchor_idx].clone();
            for loser_idx in loser_idxs {
                let loser = &rows[loser_idx];
                debug!(anchor = %anchor.id, loser = %loser.id, "merging branch");

                fill_empty(&mut anchor.location_id, &loser.location_id);
                union_preserving_order(&mut anchor.phone_numbers, &loser.phone_numbers);

                session.reassign_postings_to_branch(loser.id, anchor.id).await?;
                session.update_branch(&anchor).await?;
                ctx.record(EntityKind::Branch, loser.id);
                merges += 1;
                session.flush().await?;
            }
        }
        Ok(merges)
    }
}

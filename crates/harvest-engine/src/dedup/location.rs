//! Location merge keyed on name + country + rounded coordinates.

use async_trait::async_trait;
use harvest_core::fingerprint;
use harvest_store::{Session, StoreError};
use tracing::debug;

use super::{
    cluster_duplicates, fill_empty, CleanupWindow, DuplicateCleaner, EntityKind, MergeContext,
};

pub struct LocationCleaner;

#[async_trait]
impl DuplicateCleaner for LocationCleaner {
    fn kind(&self) -> EntityKind {
        EntityKind::Location
    }

    async fn clean(
        &self,
        session: &Session,
        window: &CleanupWindow,
        ctx: &mut MergeContext,
    ) -> Result<u64, StoreError> {
        let mut rows = session.locations_created_since(window.cutoff).await?;
        rows.sort_by_key(|l| l.created_at);
        let identities: Vec<String> = rows
            .iter()
            .map(|l| {
                fingerprint::location_identity(
                    l.name.as_deref(),
                    l.country.as_deref(),
                    l.latitude,
                    l.longitude,
                )
            })
            .collect();

        let mut merges = 0u64;
        for (anchor_idx, loser_idxs) in cluster_duplicates(&identities) {
            let mut anchor = rows[anchor_idx].clone();
            for loser_idx in loser_idxs {
                let loser = &rows[loser_idx];
                debug!(anchor = %anchor.id, loser = %loser.id, "merging location");

                fill_empty(&mut anchor.name, &loser.name);
                fill_empty(&mut anchor.country, &loser.country);
                fill_empty(&mut anchor.region, &loser.region);
                fill_empty(&mut anchor.latitude, &loser.latitude);
                fill_empty(&mut anchor.longitude, &loser.longitude);

                session
                    .reassign_branches_to_location(loser.id, anchor.id)
                    .await?;
                session
                    .reassign_postings_to_location(loser.id, anchor.id)
                    .await?;
                session.update_location(&anchor).await?;
                ctx.record(EntityKind::Location, loser.id);
                merges += 1;
                session.flush().await?;
            }
        }
        Ok(merges)
    }
}

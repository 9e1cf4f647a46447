//! Contact-address merge keyed on the normalized address string. Link rows
//! and postings move to the surviving address before the loser is recorded.

use async_trait::async_trait;
use harvest_core::fingerprint;
use harvest_store::{Session, StoreError};
use tracing::debug;

use super::{cluster_duplicates, CleanupWindow, DuplicateCleaner, EntityKind, MergeContext};

pub struct ContactCleaner;

#[async_trait]
impl DuplicateCleaner for ContactCleaner {
    fn kind(&self) -> EntityKind {
        EntityKind::ContactAddress
    }

    async fn clean(
        &self,
        session: &Session,
        window: &CleanupWindow,
        ctx: &mut MergeContext,
    ) -> Result<u64, StoreError> {
        let mut rows = session.contacts_created_since(window.cutoff).await?;
        rows.sort_by_key(|c| c.created_at);
        let identities: Vec<String> = rows
            .iter()
            .map(|c| fingerprint::contact_identity(&c.address))
            .collect();

        let mut merges = 0u64;
        for (anchor_idx, loser_idxs) in cluster_duplicates(&identities) {
            let anchor = rows[anchor_idx].clone();
            for loser_idx in loser_idxs {
                let loser = &rows[loser_idx];
                debug!(anchor = %anchor.id, loser = %loser.id, "merging contact address");

                session
                    .reassign_contact_links_to_address(loser.id, anchor.id)
                    .await?;
                session
                    .reassign_postings_to_contact(loser.id, anchor.id)
                    .await?;
                ctx.record(EntityKind::ContactAddress, loser.id);
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
    use chrono::{Duration, Utc};
    use harvest_core::{Company, ContactAddress, ContactLink};
    use harvest_store::memory::InMemoryStore;
    use std::sync::Arc;
    use uuid::Uuid;

    fn contact(address: &str, age_minutes: i64) -> ContactAddress {
        ContactAddress {
            id: Uuid::new_v4(),
            address: address.into(),
            created_at: Utc::now() - Duration::minutes(age_minutes),
        }
    }

    #[tokio::test]
    async fn case_variants_of_one_address_merge_with_their_links() {
        let session = Session::new(Arc::new(InMemoryStore::new()));
        let older = contact("jobs@acme.de", 30);
        let newer = contact("Jobs@Acme.DE", 10);
        session.insert_contact(&older).await.unwrap();
        session.insert_contact(&newer).await.unwrap();

        let acme = Company {
            id: Uuid::new_v4(),
            name: "Acme GmbH".into(),
            website: None,
            founded_year: None,
            industries: vec![],
            employee_range: None,
            social_links: vec![],
            last_seen_with_offer: None,
            created_at: Utc::now(),
        };
        session.insert_company(&acme).await.unwrap();
        session
            .link_contact(&ContactLink {
                company_id: acme.id,
                address_id: newer.id,
                usable_for_applications: true,
            })
            .await
            .unwrap();

        let window = CleanupWindow {
            cutoff: Utc::now() - Duration::days(1),
            run_ids: vec![],
        };
        let mut ctx = MergeContext::new();
        let merges = ContactCleaner
            .clean(&session, &window, &mut ctx)
            .await
            .unwrap();

        assert_eq!(merges, 1);
        assert!(ctx.is_removed(EntityKind::ContactAddress, newer.id));
        let links = session.contact_links_for_address(older.id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].company_id, acme.id);
        assert!(session
            .contact_links_for_address(newer.id)
            .await
            .unwrap()
            .is_empty());
    }
}

//! Offline duplicate reconciliation.
//!
//! Write-time resolution accepts duplicate companies, branches, locations,
//! contact addresses and postings; this module merges them back together
//! after the fact. One cleaner per entity kind runs in its own transaction,
//! losers are only recorded during the merge phase, and a final ordered
//! removal pass deletes them children-before-parents, re-fetching every row
//! by id right before its delete.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use harvest_core::RunStatus;
use harvest_store::{Session, Store, StoreError, CLEANUP_LEASE};
use tracing::{info, warn};
use uuid::Uuid;

mod branch;
mod company;
mod contact;
mod location;
mod posting;

pub use branch::BranchCleaner;
pub use company::CompanyCleaner;
pub use contact::ContactCleaner;
pub use location::LocationCleaner;
pub use posting::PostingCleaner;

/// Extractions newer than this block maintenance entirely.
const ACTIVE_RUN_HORIZON_HOURS: i64 = 24;
/// How long the cleanup lease stays valid if the holder dies mid-pass.
const LEASE_TTL: StdDuration = StdDuration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Company,
    Branch,
    Location,
    ContactAddress,
    Posting,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Company => "company",
            EntityKind::Branch => "branch",
            EntityKind::Location => "location",
            EntityKind::ContactAddress => "contact-address",
            EntityKind::Posting => "posting",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Children strictly before parents, so no delete ever leaves a dangling
/// reference behind.
pub const REMOVAL_ORDER: [EntityKind; 5] = [
    EntityKind::Posting,
    EntityKind::Branch,
    EntityKind::ContactAddress,
    EntityKind::Location,
    EntityKind::Company,
];

/// Rows the merge phase absorbed into an anchor, pending removal. Cleaners
/// only record ids here; nothing is deleted until the removal pass.
#[derive(Debug, Default, Clone)]
pub struct MergeContext {
    removed: HashMap<EntityKind, Vec<Uuid>>,
}

impl MergeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EntityKind, id: Uuid) {
        self.removed.entry(kind).or_default().push(id);
    }

    pub fn removed(&self, kind: EntityKind) -> &[Uuid] {
        self.removed.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_removed(&self, kind: EntityKind, id: Uuid) -> bool {
        self.removed(kind).contains(&id)
    }

    pub fn total(&self) -> u64 {
        self.removed.values().map(|v| v.len() as u64).sum()
    }
}

/// Which rows a cleanup pass looks at.
#[derive(Debug, Clone)]
pub struct CleanupWindow {
    /// Rows created before this are out of scope.
    pub cutoff: DateTime<Utc>,
    /// When non-empty, the posting cleaner restricts itself to postings
    /// bound to these runs instead of the time window.
    pub run_ids: Vec<Uuid>,
}

#[async_trait]
pub trait DuplicateCleaner: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Merge duplicates of this kind, recording absorbed rows in `ctx`.
    /// Returns the number of merges performed.
    async fn clean(
        &self,
        session: &Session,
        window: &CleanupWindow,
        ctx: &mut MergeContext,
    ) -> Result<u64, StoreError>;
}

/// Veto hook for posting merges: a posting referenced from outside this
/// system (bookmarks, exports, notification history) must not disappear.
#[async_trait]
pub trait ExternalReferenceCheck: Send + Sync {
    async fn is_referenced(&self, posting_id: Uuid) -> anyhow::Result<bool>;
}

/// Check used when no external consumers exist.
pub struct NoExternalReferences;

#[async_trait]
impl ExternalReferenceCheck for NoExternalReferences {
    async fn is_referenced(&self, _posting_id: Uuid) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Group equal identities into (anchor, losers) index clusters. Input rows
/// must already be sorted oldest-first; the anchor is the earliest row of
/// each group and can never appear as a loser of another group.
pub fn cluster_duplicates(identities: &[String]) -> Vec<(usize, Vec<usize>)> {
    let mut by_identity: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for (idx, identity) in identities.iter().enumerate() {
        let entry = by_identity.entry(identity.as_str()).or_default();
        if entry.is_empty() {
            order.push(identity.as_str());
        }
        entry.push(idx);
    }
    order
        .into_iter()
        .filter_map(|identity| {
            let members = &by_identity[identity];
            if members.len() < 2 {
                return None;
            }
            Some((members[0], members[1..].to_vec()))
        })
        .collect()
}

#[derive(Debug)]
pub enum CleanupOutcome {
    /// The pass did not start; the reason says why.
    Skipped(String),
    Completed(CleanupReport),
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Merges performed per entity kind.
    pub merged: HashMap<EntityKind, u64>,
    /// Cleaners whose transaction was rolled back, with the error.
    pub failed: Vec<(EntityKind, String)>,
    /// Rows deleted by the removal pass.
    pub removed: u64,
    /// Set when the removal pass or the final run stamping failed; the
    /// merge phase results above still stand.
    pub removal_error: Option<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.removal_error.is_none()
    }
}

/// Run the whole offline pass: mutual-exclusion checks, one transaction per
/// cleaner, then the ordered removal pass, then lease release.
///
/// A failing cleaner is rolled back and reported without aborting the other
/// kinds; its recorded losers are discarded along with its transaction.
pub async fn run_duplicate_cleanup(
    store: Arc<dyn Store>,
    refs: &dyn ExternalReferenceCheck,
    window_days: u32,
    run_ids: &[Uuid],
) -> Result<CleanupOutcome, StoreError> {
    let now = Utc::now();
    let active = store
        .active_extraction_runs(now - Duration::hours(ACTIVE_RUN_HORIZON_HOURS))
        .await?;
    if active > 0 {
        return Ok(CleanupOutcome::Skipped(format!(
            "{active} extraction run(s) in progress"
        )));
    }

    let holder = Uuid::new_v4().to_string();
    if !store
        .try_acquire_lease(CLEANUP_LEASE, &holder, LEASE_TTL)
        .await?
    {
        let other = store.lease_holder(CLEANUP_LEASE).await?;
        return Ok(CleanupOutcome::Skipped(format!(
            "cleanup lease held by {}",
            other.unwrap_or_else(|| "unknown".into())
        )));
    }

    let window = CleanupWindow {
        cutoff: now - Duration::days(i64::from(window_days)),
        run_ids: run_ids.to_vec(),
    };

    // The lease must go away whether the pass finishes or errors out; its
    // TTL is only the backstop for a holder that died outright.
    let result = run_cleanup_pass(&store, refs, &window).await;
    if let Err(err) = store.release_lease(CLEANUP_LEASE, &holder).await {
        warn!(error = %err, "could not release the cleanup lease");
    }
    Ok(CleanupOutcome::Completed(result?))
}

async fn run_cleanup_pass(
    store: &Arc<dyn Store>,
    refs: &dyn ExternalReferenceCheck,
    window: &CleanupWindow,
) -> Result<CleanupReport, StoreError> {
    let cleaners: Vec<Box<dyn DuplicateCleaner + '_>> = vec![
        Box::new(CompanyCleaner),
        Box::new(LocationCleaner),
        Box::new(BranchCleaner),
        Box::new(ContactCleaner),
        Box::new(PostingCleaner::new(refs)),
    ];

    let mut report = CleanupReport::default();
    let mut ctx = MergeContext::new();
    for cleaner in &cleaners {
        let kind = cleaner.kind();
        // Losers recorded by a rolled-back cleaner must not reach the
        // removal pass, so work on a scratch copy until commit.
        let mut scratch = ctx.clone();
        let session = Session::new(Arc::clone(store));
        session.begin().await?;
        match cleaner.clean(&session, window, &mut scratch).await {
            Ok(merged) => {
                session.commit().await?;
                ctx = scratch;
                info!(kind = %kind, merged, "duplicate merge phase done");
                report.merged.insert(kind, merged);
            }
            Err(err) => {
                warn!(kind = %kind, error = %err, "cleaner failed, rolling back");
                // The session may be poisoned; roll back on the store itself.
                if let Err(rb) = store.rollback().await {
                    warn!(kind = %kind, error = %rb, "rollback failed");
                }
                report.failed.push((kind, err.to_string()));
            }
        }
    }

    match remove_absorbed_rows(store, &ctx).await {
        Ok(removed) => {
            report.removed = removed;
            if report.failed.is_empty() {
                if let Err(err) = stamp_runs_merged(store, &window.run_ids).await {
                    warn!(error = %err, "could not stamp the scoped runs merged");
                    report.removal_error = Some(format!("run stamping failed: {err}"));
                }
            }
        }
        Err(err) => {
            warn!(error = %err, "removal pass failed, rolling back");
            if let Err(rb) = store.rollback().await {
                warn!(error = %rb, "rollback failed");
            }
            report.removal_error = Some(err.to_string());
        }
    }

    Ok(report)
}

/// Delete absorbed rows in child-before-parent order. Every id is
/// re-fetched right before its delete; a row already gone (or deleted by a
/// cascade) is simply skipped.
async fn remove_absorbed_rows(
    store: &Arc<dyn Store>,
    ctx: &MergeContext,
) -> Result<u64, StoreError> {
    let session = Session::new(Arc::clone(store));
    session.begin().await?;
    let mut removed = 0u64;
    for kind in REMOVAL_ORDER {
        for &id in ctx.removed(kind) {
            let present = match kind {
                EntityKind::Posting => session.get_posting(id).await?.is_some(),
                EntityKind::Branch => session.get_branch(id).await?.is_some(),
                EntityKind::ContactAddress => session.get_contact(id).await?.is_some(),
                EntityKind::Location => session.get_location(id).await?.is_some(),
                EntityKind::Company => session.get_company(id).await?.is_some(),
            };
            if !present {
                continue;
            }
            match kind {
                EntityKind::Posting => session.delete_posting(id).await?,
                EntityKind::Branch => session.delete_branch(id).await?,
                EntityKind::ContactAddress => session.delete_contact(id).await?,
                EntityKind::Location => session.delete_location(id).await?,
                EntityKind::Company => session.delete_company(id).await?,
            }
            removed += 1;
        }
    }
    session.commit().await?;
    Ok(removed)
}

/// A run-scoped pass reconciled everything these runs imported; advance
/// their lifecycle from the imported statuses to `MERGED`.
async fn stamp_runs_merged(store: &Arc<dyn Store>, run_ids: &[Uuid]) -> Result<(), StoreError> {
    let session = Session::new(Arc::clone(store));
    for &run_id in run_ids {
        let Some(mut run) = session.get_run(run_id).await? else {
            continue;
        };
        if matches!(
            run.status,
            RunStatus::Imported | RunStatus::PartiallyImported
        ) {
            run.status = RunStatus::Merged;
            session.update_run(&run).await?;
        }
    }
    Ok(())
}

/// Keep `base` and append every element of `extra` not already present,
/// preserving first-seen order.
pub(crate) fn union_preserving_order(base: &mut Vec<String>, extra: &[String]) {
    for value in extra {
        if !base.iter().any(|have| have == value) {
            base.push(value.clone());
        }
    }
}

/// `base = base.or(extra)` for merge fills.
pub(crate) fn fill_empty<T: Clone>(base: &mut Option<T>, extra: &Option<T>) {
    if base.is_none() {
        *base = extra.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clustering_keeps_the_earliest_row_as_anchor() {
        let identities = vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
            "a".to_string(),
            "c".to_string(),
            "b".to_string(),
        ];
        let clusters = cluster_duplicates(&identities);
        assert_eq!(clusters, vec![(0, vec![2, 3]), (1, vec![5])]);
    }

    #[test]
    fn singletons_form_no_cluster() {
        let identities = vec!["a".to_string(), "b".to_string()];
        assert!(cluster_duplicates(&identities).is_empty());
    }

    #[test]
    fn union_skips_values_already_present() {
        let mut base = vec!["de".to_string(), "en".to_string()];
        union_preserving_order(&mut base, &["en".to_string(), "fr".to_string()]);
        assert_eq!(base, vec!["de", "en", "fr"]);
    }

    #[test]
    fn removal_order_is_children_before_parents() {
        let posting = REMOVAL_ORDER
            .iter()
            .position(|k| *k == EntityKind::Posting)
            .unwrap();
        let branch = REMOVAL_ORDER
            .iter()
            .position(|k| *k == EntityKind::Branch)
            .unwrap();
        let company = REMOVAL_ORDER
            .iter()
            .position(|k| *k == EntityKind::Company)
            .unwrap();
        assert!(posting < branch && branch < company);
    }
}

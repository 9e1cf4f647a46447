//! Run lifecycle: creation, terminal stamping, and the progress decision.

use chrono::Utc;
use harvest_core::{ExtractionRun, KeywordConfigState, RunStatus, Source};
use harvest_store::{Session, StoreError};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::progress::{self, KeywordPeer, PEER_COMPARISON_CEILING};

/// Parameters for a new extraction run; everything else starts zeroed.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub keywords: Vec<String>,
    pub sources: Vec<Source>,
    pub requested_configurations: Vec<String>,
    pub country: Option<String>,
    pub location: Option<String>,
    pub distance_km: Option<u32>,
    pub page_offset: u32,
    pub page_count: u32,
    pub result_cap: Option<u32>,
}

/// Counter deltas for one batch. Counters on the run are additive; they are
/// never overwritten with absolute values.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunUpdate {
    pub found: u32,
    pub new: u32,
    pub bound: u32,
}

pub struct RunService<'a> {
    session: &'a Session,
}

impl<'a> RunService<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    pub async fn create(&self, params: NewRun) -> Result<ExtractionRun, StoreError> {
        let run = ExtractionRun {
            id: Uuid::new_v4(),
            keywords: params.keywords,
            sources: params.sources,
            requested_configurations: params.requested_configurations,
            country: params.country,
            location: params.location,
            distance_km: params.distance_km,
            page_offset: params.page_offset,
            page_count: params.page_count,
            result_cap: params.result_cap,
            found_count: 0,
            new_count: 0,
            bound_count: 0,
            status: RunStatus::InProgress,
            percentage_done: None,
            error_message: None,
            error_trace: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.session.insert_run(&run).await?;
        Ok(run)
    }

    /// Add batch counters onto the stored run and return the updated row.
    pub async fn apply(&self, run_id: Uuid, update: RunUpdate) -> Result<ExtractionRun, StoreError> {
        let Some(mut run) = self.session.get_run(run_id).await? else {
            return Err(StoreError::NotFound(run_id));
        };
        run.found_count += i64::from(update.found);
        run.new_count += i64::from(update.new);
        run.bound_count += i64::from(update.bound);
        self.session.update_run(&run).await?;
        Ok(run)
    }

    /// Stamp a run `FAILED` with an error snapshot, unless one is already
    /// there from an earlier recovery.
    pub async fn mark_failed(&self, run_id: Uuid, message: &str) -> Result<(), StoreError> {
        let Some(mut run) = self.session.get_run(run_id).await? else {
            return Err(StoreError::NotFound(run_id));
        };
        if run.has_error_snapshot() {
            return Ok(());
        }
        run.status = RunStatus::Failed;
        run.error_message = Some(message.to_string());
        run.finished_at = Some(Utc::now());
        self.session.update_run(&run).await
    }

    /// Compute the completion estimate for a run, pulling peer history only
    /// when the peer signal can actually apply.
    pub async fn decide_progress(
        &self,
        run: &ExtractionRun,
        configs: &[KeywordConfigState],
    ) -> Result<u8, StoreError> {
        let capped = run.result_cap.is_some();
        let wants_peers = match run.result_cap {
            Some(cap) => run.found_count < i64::from(cap),
            None => run.found_count <= PEER_COMPARISON_CEILING,
        };

        let peers = if wants_peers {
            let mut per_keyword: BTreeMap<&str, i64> = BTreeMap::new();
            for config in configs {
                *per_keyword.entry(config.keyword.as_str()).or_default() += config.found;
            }
            let mut peers = Vec::with_capacity(per_keyword.len());
            for (keyword, found) in per_keyword {
                let average = self
                    .session
                    .peer_keyword_average(keyword, capped, run.id)
                    .await?;
                peers.push(KeywordPeer {
                    keyword: keyword.to_string(),
                    this_run_found: found,
                    peer_average: average,
                });
            }
            peers
        } else {
            Vec::new()
        };

        Ok(progress::estimate(run, configs, &peers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_store::memory::InMemoryStore;
    use std::sync::Arc;

    fn params(keywords: &[&str]) -> NewRun {
        NewRun {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            sources: vec![Source::Indeed],
            requested_configurations: vec![],
            country: Some("de".into()),
            location: None,
            distance_km: None,
            page_offset: 0,
            page_count: 1,
            result_cap: None,
        }
    }

    #[tokio::test]
    async fn created_runs_start_in_progress() {
        let session = Session::new(Arc::new(InMemoryStore::new()));
        let run = RunService::new(&session).create(params(&["rust"])).await.unwrap();
        assert_eq!(run.status, RunStatus::InProgress);
        let stored = session.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.keywords, vec!["rust".to_string()]);
    }

    #[tokio::test]
    async fn counter_updates_accumulate() {
        let session = Session::new(Arc::new(InMemoryStore::new()));
        let service = RunService::new(&session);
        let run = service.create(params(&["rust"])).await.unwrap();

        service
            .apply(run.id, RunUpdate { found: 3, new: 2, bound: 1 })
            .await
            .unwrap();
        let after = service
            .apply(run.id, RunUpdate { found: 2, new: 0, bound: 2 })
            .await
            .unwrap();

        assert_eq!(after.found_count, 5);
        assert_eq!(after.new_count, 2);
        assert_eq!(after.bound_count, 3);
    }

    #[tokio::test]
    async fn mark_failed_keeps_an_existing_snapshot() {
        let session = Session::new(Arc::new(InMemoryStore::new()));
        let service = RunService::new(&session);
        let run = service.create(params(&["rust"])).await.unwrap();

        service.mark_failed(run.id, "proxy down").await.unwrap();
        service.mark_failed(run.id, "later and wrong").await.unwrap();

        let stored = session.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("proxy down"));
    }

    #[tokio::test]
    async fn progress_decision_consults_peer_history_for_small_runs() {
        let session = Session::new(Arc::new(InMemoryStore::new()));
        let service = RunService::new(&session);

        // A finished peer run that found 50 for the same keyword.
        let mut peer = service.create(params(&["rust"])).await.unwrap();
        peer.found_count = 50;
        peer.status = RunStatus::Imported;
        session.update_run(&peer).await.unwrap();
        session
            .upsert_keyword_config(&KeywordConfigState {
                run_id: peer.id,
                keyword: "rust".into(),
                configuration: "indeed-de".into(),
                handled: true,
                found: 50,
            })
            .await
            .unwrap();

        let mut run = service.create(params(&["rust"])).await.unwrap();
        run.found_count = 5;
        // One of two configurations handled, so coverage alone reads 50 and
        // the peer signal is allowed to lower it further.
        let configs = vec![
            KeywordConfigState {
                run_id: run.id,
                keyword: "rust".into(),
                configuration: "indeed-de".into(),
                handled: true,
                found: 5,
            },
            KeywordConfigState {
                run_id: run.id,
                keyword: "rust".into(),
                configuration: "indeed-at".into(),
                handled: false,
                found: 0,
            },
        ];
        let pct = service.decide_progress(&run, &configs).await.unwrap();
        assert_eq!(pct, 10);
    }
}

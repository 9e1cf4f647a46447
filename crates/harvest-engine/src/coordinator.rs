//! Drives one extraction run end to end: keywords × sources × source
//! configurations, candidate resolution, run/keyword bookkeeping, and the
//! failure-recovery protocol for broken sessions.

use chrono::Utc;
use harvest_core::{ExtractionRun, KeywordConfigState, RunStatus, Source};
use harvest_store::{Session, StoreError};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::provider::{BatchProvider, FetchError, PageWindow};
use crate::resolver::{recency_cutoff, OnlineResolver, Resolution};
use crate::runs::{RunService, RunUpdate};

#[derive(Debug, Error)]
pub enum RunError {
    /// The upstream source could not be reached at all. The run is handed
    /// back unstamped; the caller decides its final status.
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
    /// The working session broke mid-run. The run has already been stamped
    /// `FAILED` (or found already stamped) through a fresh session.
    #[error("run {0} terminated after an unrecoverable storage failure")]
    Terminated(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct RunCoordinator<'a> {
    session: &'a Session,
    provider: &'a dyn BatchProvider,
}

impl<'a> RunCoordinator<'a> {
    pub fn new(session: &'a Session, provider: &'a dyn BatchProvider) -> Self {
        Self { session, provider }
    }

    /// Execute the run loop for an already-inserted `IN_PROGRESS` run.
    pub async fn execute(&self, run_id: Uuid) -> Result<ExtractionRun, RunError> {
        let mut run = self
            .session
            .get_run(run_id)
            .await?
            .ok_or(StoreError::NotFound(run_id))?;

        match self.drive(&mut run).await {
            Ok(()) => {}
            Err(RunError::Store(err)) if err.is_unrecoverable() => {
                self.recover(run_id, &err).await;
                return Err(RunError::Terminated(run_id));
            }
            Err(err) => return Err(err),
        }

        let configs = self.session.keyword_configs(run.id).await?;
        run.status = if configs.iter().all(|c| c.handled) {
            RunStatus::Imported
        } else {
            RunStatus::PartiallyImported
        };
        run.percentage_done = Some(
            RunService::new(self.session)
                .decide_progress(&run, &configs)
                .await?,
        );
        run.finished_at = Some(Utc::now());
        self.session.update_run(&run).await?;
        info!(
            run_id = %run.id,
            status = run.status.as_str(),
            found = run.found_count,
            new = run.new_count,
            bound = run.bound_count,
            percentage = run.percentage_done,
            "extraction run finished"
        );
        Ok(run)
    }

    async fn drive(&self, run: &mut ExtractionRun) -> Result<(), RunError> {
        let resolver = OnlineResolver::new(self.session);
        let page = PageWindow {
            offset: run.page_offset,
            count: run.page_count,
        };

        'sources: for keyword in run.keywords.clone() {
            for &source in &run.sources.clone() {
                for configuration in self.requested_configurations(run, source) {
                    let batch = match self
                        .provider
                        .fetch(&keyword, source, &configuration, &page)
                        .await
                    {
                        Ok(batch) => batch,
                        Err(FetchError::Unreachable(detail)) => {
                            return Err(RunError::Unreachable(detail));
                        }
                        Err(FetchError::Other(err)) => {
                            // A single broken configuration never aborts the
                            // run; it just stays unhandled for coverage.
                            warn!(
                                keyword,
                                source = %source,
                                configuration,
                                error = %err,
                                "batch fetch failed"
                            );
                            self.session
                                .upsert_keyword_config(&KeywordConfigState {
                                    run_id: run.id,
                                    keyword: keyword.clone(),
                                    configuration: configuration.clone(),
                                    handled: false,
                                    found: 0,
                                })
                                .await?;
                            continue;
                        }
                    };

                    let mut resolved_ids = Vec::new();
                    let mut delta = RunUpdate::default();
                    for draft in &batch {
                        delta.found += 1;
                        let cutoff = recency_cutoff(Utc::now());
                        let resolution = match self
                            .session
                            .find_posting_by_url(draft.url.trim(), cutoff)
                            .await?
                        {
                            Some(existing) => {
                                self.session.bind_run_posting(run.id, existing.id).await?;
                                Some(Resolution::Existing(existing))
                            }
                            None => resolver.resolve(draft, &configuration, run).await?,
                        };
                        match resolution {
                            Some(Resolution::New(posting)) => {
                                delta.new += 1;
                                resolved_ids.push(posting.id);
                            }
                            Some(Resolution::Existing(posting)) => {
                                delta.bound += 1;
                                resolved_ids.push(posting.id);
                            }
                            None => {}
                        }
                    }

                    // Barrier 1: all entity rows and run bindings for this
                    // batch are down before keyword bookkeeping starts.
                    self.session.flush().await?;

                    for posting_id in &resolved_ids {
                        self.session
                            .bind_keyword_posting(run.id, &keyword, *posting_id)
                            .await?;
                    }
                    self.session
                        .upsert_keyword_config(&KeywordConfigState {
                            run_id: run.id,
                            keyword: keyword.clone(),
                            configuration: configuration.clone(),
                            handled: true,
                            found: i64::from(delta.found),
                        })
                        .await?;

                    // Barrier 2: keyword bookkeeping is down before the next
                    // batch begins.
                    self.session.flush().await?;

                    *run = RunService::new(self.session).apply(run.id, delta).await?;

                    if let Some(cap) = run.result_cap {
                        if run.found_count >= i64::from(cap) {
                            info!(run_id = %run.id, cap, "result cap reached, stopping early");
                            break 'sources;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn requested_configurations(&self, run: &ExtractionRun, source: Source) -> Vec<String> {
        let all = self
            .provider
            .configurations(source, run.country.as_deref());
        if run.requested_configurations.is_empty() {
            return all;
        }
        all.into_iter()
            .filter(|c| run.requested_configurations.iter().any(|r| r == c))
            .collect()
    }

    /// Idempotent `FAILED` stamping through a fresh session. The broken
    /// session cannot be trusted to carry even this one write, and a
    /// concurrent recovery may already have stamped the run.
    async fn recover(&self, run_id: Uuid, cause: &StoreError) {
        let fresh = Session::new(self.session.store());
        let run = match fresh.get_run(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                warn!(run_id = %run_id, "run vanished during failure recovery");
                return;
            }
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "failure recovery could not load the run");
                return;
            }
        };
        if run.has_error_snapshot() {
            info!(run_id = %run_id, "run already carries a failure snapshot, leaving it");
            return;
        }
        let mut stamped = run;
        stamped.status = RunStatus::Failed;
        stamped.error_message = Some(cause.to_string());
        stamped.error_trace = Some(format!("{cause:?}"));
        stamped.finished_at = Some(Utc::now());
        if let Err(err) = fresh.update_run(&stamped).await {
            warn!(run_id = %run_id, error = %err, "failure recovery could not stamp the run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use harvest_core::PostingDraft;
    use harvest_store::memory::InMemoryStore;
    use harvest_store::testing::FaultInjectingStore;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct StaticProvider {
        batches: HashMap<(String, Source), Vec<PostingDraft>>,
        unreachable: bool,
    }

    impl StaticProvider {
        fn new() -> Self {
            Self {
                batches: HashMap::new(),
                unreachable: false,
            }
        }

        fn with_batch(mut self, keyword: &str, source: Source, batch: Vec<PostingDraft>) -> Self {
            self.batches.insert((keyword.into(), source), batch);
            self
        }
    }

    #[async_trait]
    impl BatchProvider for StaticProvider {
        fn configurations(&self, source: Source, country: Option<&str>) -> Vec<String> {
            vec![format!("{}-{}", source, country.unwrap_or("any"))]
        }

        async fn fetch(
            &self,
            keyword: &str,
            source: Source,
            _configuration: &str,
            _page: &PageWindow,
        ) -> Result<Vec<PostingDraft>, FetchError> {
            if self.unreachable {
                return Err(FetchError::Unreachable("proxy down".into()));
            }
            Ok(self
                .batches
                .get(&(keyword.to_string(), source))
                .cloned()
                .unwrap_or_default())
        }
    }

    fn draft(title: &str, company: &str, url: &str) -> PostingDraft {
        PostingDraft {
            source: Source::Indeed,
            title: title.into(),
            description: None,
            url: url.into(),
            host: None,
            company_name: Some(company.into()),
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

    fn run(keywords: &[&str]) -> ExtractionRun {
        ExtractionRun {
            id: Uuid::new_v4(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
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

    #[tokio::test]
    async fn full_run_imports_and_counts_new_versus_bound() {
        let store = Arc::new(InMemoryStore::new());
        let session = Session::new(store.clone());
        let run_row = run(&["rust", "golang"]);
        session.insert_run(&run_row).await.unwrap();

        // Both keywords return the same Acme posting; the second keyword
        // must bind, not insert.
        let provider = StaticProvider::new()
            .with_batch(
                "rust",
                Source::Indeed,
                vec![
                    draft("Rust Engineer", "Acme GmbH", "https://x.example/1"),
                    draft("Backend Engineer", "Beta AG", "https://x.example/2"),
                ],
            )
            .with_batch(
                "golang",
                Source::Indeed,
                vec![draft("Rust Engineer", "Acme GmbH", "https://x.example/1")],
            );

        let coordinator = RunCoordinator::new(&session, &provider);
        let finished = coordinator.execute(run_row.id).await.unwrap();

        assert_eq!(finished.status, RunStatus::Imported);
        assert_eq!(finished.found_count, 3);
        assert_eq!(finished.new_count, 2);
        assert_eq!(finished.bound_count, 1);
        assert!(finished.finished_at.is_some());
        assert!(finished.percentage_done.is_some());
    }

    #[tokio::test]
    async fn each_batch_gets_two_write_barriers_in_order() {
        let store = Arc::new(InMemoryStore::new());
        let session = Session::new(store.clone());
        let run_row = run(&["rust"]);
        session.insert_run(&run_row).await.unwrap();

        let provider = StaticProvider::new().with_batch(
            "rust",
            Source::Indeed,
            vec![draft("Rust Engineer", "Acme GmbH", "https://x.example/1")],
        );
        RunCoordinator::new(&session, &provider)
            .execute(run_row.id)
            .await
            .unwrap();

        let ops = store.op_log();
        let first_flush = ops.iter().position(|op| op == "flush").unwrap();
        let second_flush = ops.iter().rposition(|op| op == "flush").unwrap();
        let insert = ops.iter().position(|op| op == "insert_posting").unwrap();
        let keyword_bind = ops
            .iter()
            .position(|op| op == "bind_keyword_posting")
            .unwrap();
        assert!(insert < first_flush, "inserts precede the first barrier");
        assert!(
            first_flush < keyword_bind && keyword_bind < second_flush,
            "keyword bookkeeping sits between the two barriers"
        );
    }

    #[tokio::test]
    async fn broken_session_stamps_the_run_failed_exactly_once() {
        let store = Arc::new(FaultInjectingStore::new(Arc::new(InMemoryStore::new())));
        let session = Session::new(store.clone());
        let run_row = run(&["rust"]);
        session.insert_run(&run_row).await.unwrap();
        store.fail_once_on("insert_posting");

        let provider = StaticProvider::new().with_batch(
            "rust",
            Source::Indeed,
            vec![draft("Rust Engineer", "Acme GmbH", "https://x.example/1")],
        );
        let err = RunCoordinator::new(&session, &provider)
            .execute(run_row.id)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Terminated(id) if id == run_row.id));
        assert!(session.is_poisoned());

        let fresh = Session::new(session.store());
        let stamped = fresh.get_run(run_row.id).await.unwrap().unwrap();
        assert_eq!(stamped.status, RunStatus::Failed);
        assert!(stamped.has_error_snapshot());
        let first_message = stamped.error_message.clone();

        // A second recovery pass over the same run leaves the snapshot alone.
        let poisoned_again = Session::new(session.store());
        RunCoordinator::new(&poisoned_again, &provider)
            .recover(run_row.id, &StoreError::Unrecoverable("later".into()))
            .await;
        let unchanged = fresh.get_run(run_row.id).await.unwrap().unwrap();
        assert_eq!(unchanged.error_message, first_message);
    }

    #[tokio::test]
    async fn unreachable_source_aborts_without_stamping() {
        let store = Arc::new(InMemoryStore::new());
        let session = Session::new(store.clone());
        let run_row = run(&["rust"]);
        session.insert_run(&run_row).await.unwrap();

        let mut provider = StaticProvider::new();
        provider.unreachable = true;
        let err = RunCoordinator::new(&session, &provider)
            .execute(run_row.id)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Unreachable(_)));

        let row = session.get_run(run_row.id).await.unwrap().unwrap();
        assert_eq!(row.status, RunStatus::InProgress);
    }

    #[tokio::test]
    async fn result_cap_stops_the_loop_early() {
        let store = Arc::new(InMemoryStore::new());
        let session = Session::new(store.clone());
        let mut run_row = run(&["rust", "golang", "python"]);
        run_row.result_cap = Some(2);
        session.insert_run(&run_row).await.unwrap();

        let provider = StaticProvider::new()
            .with_batch(
                "rust",
                Source::Indeed,
                vec![
                    draft("Rust Engineer", "Acme GmbH", "https://x.example/1"),
                    draft("Backend Engineer", "Beta AG", "https://x.example/2"),
                ],
            )
            .with_batch(
                "golang",
                Source::Indeed,
                vec![draft("Go Engineer", "Gamma SE", "https://x.example/3")],
            );

        let finished = RunCoordinator::new(&session, &provider)
            .execute(run_row.id)
            .await
            .unwrap();
        assert_eq!(finished.found_count, 2);
        // Unvisited keywords left no bookkeeping rows behind.
        let configs = session.keyword_configs(run_row.id).await.unwrap();
        assert!(configs.iter().all(|c| c.keyword == "rust"));
    }
}

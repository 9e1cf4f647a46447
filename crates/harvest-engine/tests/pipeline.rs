//! End-to-end flows over the in-memory store: extraction followed by
//! re-extraction, and the full offline cleanup pass with its skip guards.

use std::sync::Arc;

use chrono::{Duration, Utc};
use harvest_core::{Company, JobPosting, Source};
use harvest_engine::{
    run_duplicate_cleanup, CleanupOutcome, EntityKind, FixtureBatchProvider, NewRun,
    NoExternalReferences, RunCoordinator, RunService,
};
use harvest_store::memory::InMemoryStore;
use harvest_store::testing::FaultInjectingStore;
use harvest_store::{Session, Store, CLEANUP_LEASE};
use uuid::Uuid;

fn new_run_params(keywords: &[&str]) -> NewRun {
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

fn write_fixture(dir: &std::path::Path, keyword: &str, body: &str) {
    let source_dir = dir.join("indeed");
    std::fs::create_dir_all(&source_dir).expect("mkdir");
    std::fs::write(source_dir.join(format!("{keyword}.json")), body).expect("write fixture");
}

#[tokio::test]
async fn reextraction_binds_known_postings_instead_of_duplicating() {
    let fixtures = tempfile::tempdir().expect("tempdir");
    write_fixture(
        fixtures.path(),
        "rust",
        r#"[{"source": "indeed", "title": "Rust Engineer", "url": "https://jobs.example/acme-1",
            "company_name": "Acme GmbH", "location_name": "Berlin", "location_country": "de"}]"#,
    );

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let provider = FixtureBatchProvider::new(fixtures.path());

    let session = Session::new(Arc::clone(&store));
    let first = RunService::new(&session)
        .create(new_run_params(&["rust"]))
        .await
        .unwrap();
    let first = RunCoordinator::new(&session, &provider)
        .execute(first.id)
        .await
        .unwrap();
    assert_eq!(first.new_count, 1);
    assert_eq!(first.bound_count, 0);

    // Second pass over the same fixture: the URL short-circuit must bind
    // the existing posting to the new run without inserting anything.
    let session = Session::new(Arc::clone(&store));
    let second = RunService::new(&session)
        .create(new_run_params(&["rust"]))
        .await
        .unwrap();
    let second = RunCoordinator::new(&session, &provider)
        .execute(second.id)
        .await
        .unwrap();
    assert_eq!(second.new_count, 0);
    assert_eq!(second.bound_count, 1);

    let all = session
        .postings_created_since(Utc::now() - Duration::days(1))
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    let mut runs = session.run_ids_for_posting(all[0].id).await.unwrap();
    runs.sort();
    let mut expected = vec![first.id, second.id];
    expected.sort();
    assert_eq!(runs, expected);
}

fn company_row(name: &str, age_minutes: i64) -> Company {
    Company {
        id: Uuid::new_v4(),
        name: name.into(),
        website: None,
        founded_year: None,
        industries: vec![],
        employee_range: None,
        social_links: vec![],
        last_seen_with_offer: None,
        created_at: Utc::now() - Duration::minutes(age_minutes),
    }
}

fn posting_row(title: &str, company_id: Uuid, url: &str, age_minutes: i64) -> JobPosting {
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
        identity_hash: String::new(),
        first_seen_run_id: Uuid::new_v4(),
        created_at: Utc::now() - Duration::minutes(age_minutes),
    }
}

#[tokio::test]
async fn cleanup_collapses_the_duplicate_graph_without_orphans() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let session = Session::new(Arc::clone(&store));

    // Two spellings of the same company, each with a copy of the same
    // posting. After the pass one company and one posting survive, and the
    // surviving posting points at the surviving company.
    let old_acme = company_row("Acme GmbH", 60);
    let new_acme = company_row("ACME GMBH", 20);
    session.insert_company(&old_acme).await.unwrap();
    session.insert_company(&new_acme).await.unwrap();
    let old_posting = posting_row("Rust Engineer", old_acme.id, "https://jobs.example/1", 50);
    let new_posting = posting_row("Rust Engineer", new_acme.id, "https://jobs.example/1", 10);
    session.insert_posting(&old_posting).await.unwrap();
    session.insert_posting(&new_posting).await.unwrap();

    let outcome = run_duplicate_cleanup(Arc::clone(&store), &NoExternalReferences, 14, &[])
        .await
        .unwrap();
    let report = match outcome {
        CleanupOutcome::Completed(report) => report,
        CleanupOutcome::Skipped(reason) => panic!("unexpected skip: {reason}"),
    };
    assert_eq!(report.merged.get(&EntityKind::Company), Some(&1));
    assert_eq!(report.merged.get(&EntityKind::Posting), Some(&1));
    assert!(report.failed.is_empty());
    assert_eq!(report.removed, 2);

    let session = Session::new(Arc::clone(&store));
    assert!(session.get_company(new_acme.id).await.unwrap().is_none());
    assert!(session.get_posting(new_posting.id).await.unwrap().is_none());
    let survivor = session.get_posting(old_posting.id).await.unwrap().unwrap();
    assert_eq!(survivor.company_id, Some(old_acme.id));
    // The cleanup left no posting pointing at a deleted company.
    let remaining = session
        .postings_created_since(Utc::now() - Duration::days(1))
        .await
        .unwrap();
    for posting in remaining {
        if let Some(company_id) = posting.company_id {
            assert!(session.get_company(company_id).await.unwrap().is_some());
        }
    }
    // Lease released at the end of the pass.
    assert!(session.lease_holder(CLEANUP_LEASE).await.unwrap().is_none());
}

#[tokio::test]
async fn run_scoped_cleanup_stamps_the_runs_merged() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let session = Session::new(Arc::clone(&store));
    let mut run = RunService::new(&session)
        .create(new_run_params(&["rust"]))
        .await
        .unwrap();
    run.status = harvest_core::RunStatus::Imported;
    session.update_run(&run).await.unwrap();

    let acme = company_row("Acme GmbH", 60);
    session.insert_company(&acme).await.unwrap();
    let keep = posting_row("Rust Engineer", acme.id, "https://jobs.example/1", 50);
    let dupe = posting_row("Rust Engineer", acme.id, "https://jobs.example/1", 10);
    session.insert_posting(&keep).await.unwrap();
    session.insert_posting(&dupe).await.unwrap();
    session.bind_run_posting(run.id, keep.id).await.unwrap();
    session.bind_run_posting(run.id, dupe.id).await.unwrap();

    let outcome = run_duplicate_cleanup(
        Arc::clone(&store),
        &NoExternalReferences,
        14,
        &[run.id],
    )
    .await
    .unwrap();
    assert!(matches!(outcome, CleanupOutcome::Completed(_)));

    let stamped = session.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stamped.status, harvest_core::RunStatus::Merged);
    assert!(session.get_posting(dupe.id).await.unwrap().is_none());
}

#[tokio::test]
async fn cleanup_refuses_to_run_next_to_a_live_extraction() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let session = Session::new(Arc::clone(&store));
    RunService::new(&session)
        .create(new_run_params(&["rust"]))
        .await
        .unwrap();

    let outcome = run_duplicate_cleanup(Arc::clone(&store), &NoExternalReferences, 14, &[])
        .await
        .unwrap();
    assert!(matches!(outcome, CleanupOutcome::Skipped(_)));
    assert!(session.lease_holder(CLEANUP_LEASE).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_runs_do_not_block_the_cleanup_gate() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let session = Session::new(Arc::clone(&store));
    let service = RunService::new(&session);
    let run = service.create(new_run_params(&["rust"])).await.unwrap();
    service.mark_failed(run.id, "proxy down").await.unwrap();

    // A stamped failure is terminal; only IN_PROGRESS runs hold cleanup off.
    let outcome = run_duplicate_cleanup(Arc::clone(&store), &NoExternalReferences, 14, &[])
        .await
        .unwrap();
    assert!(matches!(outcome, CleanupOutcome::Completed(_)));
}

#[tokio::test]
async fn cleanup_respects_a_foreign_lease() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    store
        .try_acquire_lease(CLEANUP_LEASE, "other-host", std::time::Duration::from_secs(600))
        .await
        .unwrap();

    let outcome = run_duplicate_cleanup(Arc::clone(&store), &NoExternalReferences, 14, &[])
        .await
        .unwrap();
    match outcome {
        CleanupOutcome::Skipped(reason) => assert!(reason.contains("other-host")),
        CleanupOutcome::Completed(_) => panic!("must not run under a foreign lease"),
    }

    store.release_lease(CLEANUP_LEASE, "other-host").await.unwrap();
    let outcome = run_duplicate_cleanup(Arc::clone(&store), &NoExternalReferences, 14, &[])
        .await
        .unwrap();
    assert!(matches!(outcome, CleanupOutcome::Completed(_)));
}

#[tokio::test]
async fn failed_cleaner_rolls_back_and_keeps_its_rows() {
    let inner = Arc::new(InMemoryStore::new());
    let store = Arc::new(FaultInjectingStore::new(inner));
    let dyn_store: Arc<dyn Store> = store.clone();
    let session = Session::new(Arc::clone(&dyn_store));

    let old_acme = company_row("Acme GmbH", 60);
    let new_acme = company_row("acme gmbh", 20);
    session.insert_company(&old_acme).await.unwrap();
    session.insert_company(&new_acme).await.unwrap();

    store.fail_once_on("update_company");
    let outcome = run_duplicate_cleanup(Arc::clone(&dyn_store), &NoExternalReferences, 14, &[])
        .await
        .unwrap();
    let report = match outcome {
        CleanupOutcome::Completed(report) => report,
        CleanupOutcome::Skipped(reason) => panic!("unexpected skip: {reason}"),
    };
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, EntityKind::Company);
    assert_eq!(report.removed, 0);

    // Rolled-back merges leave both rows in place for the next pass.
    assert!(session.get_company(old_acme.id).await.unwrap().is_some());
    assert!(session.get_company(new_acme.id).await.unwrap().is_some());
}

#[tokio::test]
async fn failed_removal_is_not_blamed_on_a_cleaner() {
    let inner = Arc::new(InMemoryStore::new());
    let store = Arc::new(FaultInjectingStore::new(inner));
    let dyn_store: Arc<dyn Store> = store.clone();
    let session = Session::new(Arc::clone(&dyn_store));

    let old_acme = company_row("Acme GmbH", 60);
    let new_acme = company_row("acme gmbh", 20);
    session.insert_company(&old_acme).await.unwrap();
    session.insert_company(&new_acme).await.unwrap();

    store.fail_once_on("delete_company");
    let outcome = run_duplicate_cleanup(Arc::clone(&dyn_store), &NoExternalReferences, 14, &[])
        .await
        .unwrap();
    let report = match outcome {
        CleanupOutcome::Completed(report) => report,
        CleanupOutcome::Skipped(reason) => panic!("unexpected skip: {reason}"),
    };
    // All cleaners committed; only the removal pass broke.
    assert!(report.failed.is_empty());
    assert!(report.removal_error.is_some());
    assert_eq!(report.removed, 0);
    assert_eq!(report.merged.get(&EntityKind::Company), Some(&1));

    // The merge stands but the loser row is still there for the next pass.
    assert!(session.get_company(new_acme.id).await.unwrap().is_some());
    assert!(session.lease_holder(CLEANUP_LEASE).await.unwrap().is_none());
}

#[tokio::test]
async fn lease_is_released_even_when_the_pass_errors() {
    let inner = Arc::new(InMemoryStore::new());
    let store = Arc::new(FaultInjectingStore::new(inner));
    let dyn_store: Arc<dyn Store> = store.clone();

    store.fail_once_on("begin");
    let err = run_duplicate_cleanup(Arc::clone(&dyn_store), &NoExternalReferences, 14, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, harvest_store::StoreError::Unrecoverable(_)));

    let session = Session::new(dyn_store);
    assert!(session.lease_holder(CLEANUP_LEASE).await.unwrap().is_none());
}

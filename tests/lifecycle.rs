// ABOUTME: End-to-end stage lifecycle tests against in-memory endpoints and a real SQLite store
// ABOUTME: Covers idempotent advance, batched population, restarts, failure handling and the parallel driver

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{migration, test_config, Harness};
use pglogical_cutover::config::FilterConfig;
use pglogical_cutover::context::ObjectSelection;
use pglogical_cutover::replication::{InMemoryEndpoint, ObjectNames};
use pglogical_cutover::{Advance, MigratorError, Stage, SyncState};

const TABLES: [&str; 3] = ["public.t1", "public.t2", "public.t3"];

#[tokio::test]
async fn test_advance_is_idempotent_and_never_moves_backwards() {
    let h = Harness::new();
    let endpoints = h.seed("eu1/orders", &TABLES);
    h.orchestrator.create(endpoints.request.clone()).await.unwrap();
    let cancel = CancellationToken::new();

    let mut previous = Stage::Uninitialized;
    for expected in [
        Stage::SchemaSynced,
        Stage::NodesProvisioned,
        Stage::SetPopulating,
        Stage::InitialSyncing,
    ] {
        let outcome = h.advance("eu1/orders").await.unwrap();
        assert_eq!(
            outcome,
            Advance::Transitioned {
                from: previous,
                to: expected
            }
        );
        let revision = h.orchestrator.status("eu1/orders").await.unwrap().revision;

        // Re-requesting the stage just reached, or any earlier one, does nothing.
        for stage in [previous, expected] {
            let again = h
                .orchestrator
                .advance("eu1/orders", Some(stage), &cancel)
                .await
                .unwrap();
            assert_eq!(again, Advance::AlreadyAt(expected));
        }
        let status = h.orchestrator.status("eu1/orders").await.unwrap();
        assert_eq!(status.stage, expected);
        assert_eq!(status.revision, revision);
        previous = expected;
    }

    let names = ObjectNames::for_pair("eu1/orders");
    let provider = format!("create_node:{}", names.provider_node);
    let subscriber = format!("create_node:{}", names.subscriber_node);
    let subscription = format!("create_subscription:{}", names.subscription);
    assert_eq!(endpoints.source.call_count(&provider), 1);
    assert_eq!(endpoints.target.call_count(&subscriber), 1);
    assert_eq!(endpoints.target.call_count(&subscription), 1);

    // No report yet, so steady-state has to wait.
    let waiting = h.advance("eu1/orders").await.unwrap();
    assert!(matches!(
        waiting,
        Advance::Waiting {
            stage: Stage::InitialSyncing,
            ..
        }
    ));
}

#[tokio::test]
async fn test_skipping_a_stage_is_rejected() {
    let h = Harness::new();
    let endpoints = h.seed("eu1/orders", &TABLES);
    h.orchestrator.create(endpoints.request.clone()).await.unwrap();

    let err = h
        .orchestrator
        .advance("eu1/orders", Some(Stage::SetPopulating), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MigratorError::Validation(_)));

    let err = h
        .orchestrator
        .advance("eu1/orders", Some(Stage::CutoverInProgress), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MigratorError::Validation(_)));
    assert_eq!(h.stage("eu1/orders").await, Stage::Uninitialized);
}

#[tokio::test]
async fn test_partial_batch_failure_resumes_without_duplicate_adds() {
    let h = Harness::new();
    let endpoints = h.seed("eu1/orders", &TABLES);
    h.orchestrator.create(endpoints.request.clone()).await.unwrap();
    for _ in 0..3 {
        h.advance("eu1/orders").await.unwrap();
    }
    assert_eq!(h.stage("eu1/orders").await, Stage::SetPopulating);

    endpoints.source.fail_next(
        "add_table:public.t3",
        MigratorError::Connection("canceling statement due to lock timeout".into()),
    );
    let err = h.advance("eu1/orders").await.unwrap_err();
    match &err {
        MigratorError::PartialBatchFailure {
            completed,
            remaining,
            ..
        } => {
            assert_eq!(completed, &vec!["public.t1".to_string(), "public.t2".to_string()]);
            assert_eq!(remaining, &vec!["public.t3".to_string()]);
        }
        other => panic!("unexpected error {:?}", other),
    }

    let status = h.orchestrator.status("eu1/orders").await.unwrap();
    assert_eq!(status.stage, Stage::SetPopulating);
    assert_eq!(status.set_tables, 2);
    let recorded = status.last_error.unwrap();
    assert_eq!(recorded.stage, Stage::SetPopulating);
    assert!(recorded.message.contains("lock timeout"));

    let outcome = h.advance("eu1/orders").await.unwrap();
    assert_eq!(
        outcome,
        Advance::Transitioned {
            from: Stage::SetPopulating,
            to: Stage::InitialSyncing
        }
    );
    assert_eq!(endpoints.source.call_count("add_table:public.t1"), 1);
    assert_eq!(endpoints.source.call_count("add_table:public.t2"), 1);
    assert_eq!(endpoints.source.call_count("add_table:public.t3"), 2);

    let status = h.orchestrator.status("eu1/orders").await.unwrap();
    assert_eq!(status.set_tables, 3);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_transient_failure_is_retried_within_one_advance() {
    let h = Harness::new();
    let endpoints = h.seed("eu1/orders", &TABLES);
    h.orchestrator.create(endpoints.request.clone()).await.unwrap();
    for _ in 0..3 {
        h.advance("eu1/orders").await.unwrap();
    }

    endpoints.source.fail_next(
        "add_table:public.t1",
        MigratorError::TransientConnection("terminating connection due to administrator command".into()),
    );
    let outcome = h.advance("eu1/orders").await.unwrap();
    assert_eq!(
        outcome,
        Advance::Transitioned {
            from: Stage::SetPopulating,
            to: Stage::InitialSyncing
        }
    );
    assert_eq!(endpoints.source.call_count("add_table:public.t1"), 2);
    assert_eq!(endpoints.source.call_count("add_table:public.t2"), 1);
}

#[tokio::test]
async fn test_create_is_idempotent_and_rejects_conflicts() {
    let h = Harness::new();
    let endpoints = h.seed("eu1/orders", &TABLES);
    let first = h.orchestrator.create(endpoints.request.clone()).await.unwrap();
    let second = h.orchestrator.create(endpoints.request.clone()).await.unwrap();
    assert_eq!(first.fingerprint, second.fingerprint);
    assert_eq!(first.revision, second.revision);
    assert_eq!(h.orchestrator.list().await.unwrap().len(), 1);

    let mut conflicting = endpoints.request.clone();
    conflicting.tables = ObjectSelection::Explicit(vec!["public.t1".into()]);
    let err = h.orchestrator.create(conflicting).await.unwrap_err();
    assert!(matches!(err, MigratorError::Validation(_)));

    let empty = migration("eu1/empty", &[]);
    assert!(matches!(
        h.orchestrator.create(empty).await.unwrap_err(),
        MigratorError::Validation(_)
    ));
}

#[tokio::test]
async fn test_discovery_applies_filters() {
    let h = Harness::new();
    let mut request = migration("eu1/shop", &[]);
    request.tables = ObjectSelection::Discover(FilterConfig {
        include: None,
        exclude: Some(vec!["audit_log".into()]),
    });
    request.sequences = ObjectSelection::Discover(FilterConfig::default());

    let source = InMemoryEndpoint::new()
        .with_table("public.carts", 4)
        .with_table("public.items", 9)
        .with_table("public.audit_log", 100)
        .with_table("reporting.daily", 1)
        .with_sequence("public.carts_id_seq", 4);
    h.factory.register(&request.source_dsn, Arc::new(source));

    let ctx = h.orchestrator.create(request).await.unwrap();
    assert_eq!(
        ctx.tables.iter().cloned().collect::<Vec<_>>(),
        vec!["public.carts", "public.items"]
    );
    assert_eq!(
        ctx.sequences.iter().cloned().collect::<Vec<_>>(),
        vec!["public.carts_id_seq"]
    );
}

#[tokio::test]
async fn test_progress_survives_restart() {
    let h = Harness::new();
    let endpoints = h.seed("eu1/orders", &TABLES);
    h.orchestrator.create(endpoints.request.clone()).await.unwrap();
    for _ in 0..3 {
        h.advance("eu1/orders").await.unwrap();
    }
    endpoints.source.fail_next(
        "add_table:public.t3",
        MigratorError::Connection("server closed the connection unexpectedly".into()),
    );
    h.advance("eu1/orders").await.unwrap_err();

    let restarted = h.restart();
    let status = restarted.status("eu1/orders").await.unwrap();
    assert_eq!(status.stage, Stage::SetPopulating);
    assert_eq!(status.set_tables, 2);

    restarted
        .advance("eu1/orders", None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        restarted.status("eu1/orders").await.unwrap().stage,
        Stage::InitialSyncing
    );
    assert_eq!(endpoints.source.call_count("add_table:public.t1"), 1);
    assert_eq!(endpoints.source.call_count("add_table:public.t3"), 2);
}

#[tokio::test]
async fn test_failed_context_is_queryable_and_resettable() {
    let h = Harness::new();
    let endpoints = h.seed("eu1/orders", &TABLES);
    endpoints
        .source
        .state()
        .tables
        .get_mut("public.t2")
        .unwrap()
        .has_pk = false;
    h.orchestrator.create(endpoints.request.clone()).await.unwrap();

    let err = h.advance("eu1/orders").await.unwrap_err();
    assert!(err.is_fatal());

    let status = h.orchestrator.status("eu1/orders").await.unwrap();
    assert_eq!(status.stage, Stage::Failed);
    let recorded = status.last_error.unwrap();
    assert_eq!(recorded.stage, Stage::Uninitialized);
    assert!(recorded.message.contains("public.t2"));

    // Failed is sticky until an operator resets it.
    assert!(matches!(
        h.advance("eu1/orders").await.unwrap_err(),
        MigratorError::Validation(_)
    ));

    endpoints
        .source
        .state()
        .tables
        .get_mut("public.t2")
        .unwrap()
        .has_pk = true;
    assert_eq!(
        h.orchestrator.reset("eu1/orders").await.unwrap(),
        Stage::Uninitialized
    );
    assert!(h.orchestrator.status("eu1/orders").await.unwrap().last_error.is_none());
    assert_eq!(
        h.advance("eu1/orders").await.unwrap(),
        Advance::Transitioned {
            from: Stage::Uninitialized,
            to: Stage::SchemaSynced
        }
    );
}

#[tokio::test]
async fn test_pause_holds_the_stage() {
    let h = Harness::new();
    let endpoints = h.seed("eu1/orders", &TABLES);
    h.orchestrator.create(endpoints.request.clone()).await.unwrap();

    h.orchestrator.pause("eu1/orders").await.unwrap();
    assert!(matches!(
        h.advance("eu1/orders").await.unwrap(),
        Advance::Waiting { .. }
    ));
    assert_eq!(h.stage("eu1/orders").await, Stage::Uninitialized);

    h.orchestrator.resume("eu1/orders").await.unwrap();
    assert!(matches!(
        h.advance("eu1/orders").await.unwrap(),
        Advance::Transitioned { .. }
    ));
}

#[tokio::test]
async fn test_polling_outside_monitored_stages_is_rejected() {
    let h = Harness::new();
    let endpoints = h.seed("eu1/orders", &TABLES);
    h.orchestrator.create(endpoints.request.clone()).await.unwrap();
    let err = h.orchestrator.poll_once("eu1/orders").await.unwrap_err();
    assert!(matches!(err, MigratorError::PreconditionViolation { .. }));
    // Rejecting a poll does not fail the migration.
    assert_eq!(h.stage("eu1/orders").await, Stage::Uninitialized);
}

#[tokio::test]
async fn test_steady_state_requires_consecutive_clean_polls() {
    let h = Harness::new();
    let endpoints = h.seed("eu1/orders", &TABLES);
    h.orchestrator.create(endpoints.request.clone()).await.unwrap();
    for _ in 0..4 {
        h.advance("eu1/orders").await.unwrap();
    }
    endpoints.catch_up();

    h.orchestrator.poll_once("eu1/orders").await.unwrap();
    // Writes arrive on the source that the target has not applied yet.
    endpoints.source_writes("public.t1", 5, 512);
    let report = h.orchestrator.poll_once("eu1/orders").await.unwrap();
    assert_eq!(report.tables["public.t1"].pending_changes, 5);
    assert_eq!(report.tables["public.t1"].clean_polls, 0);
    assert!(matches!(
        h.advance("eu1/orders").await.unwrap(),
        Advance::Waiting { .. }
    ));

    // The target catches up; two clean polls in a row are needed.
    endpoints.target.add_changes("public.t1", 5);
    endpoints.catch_up();
    h.orchestrator.poll_once("eu1/orders").await.unwrap();
    let report = h.orchestrator.poll_once("eu1/orders").await.unwrap();
    assert_eq!(report.tables["public.t1"].clean_polls, 2);
    assert_eq!(report.lag.as_ref().unwrap().wal_lag_bytes(), 0);
    assert_eq!(
        h.advance("eu1/orders").await.unwrap(),
        Advance::Transitioned {
            from: Stage::InitialSyncing,
            to: Stage::SteadyState
        }
    );
}

#[tokio::test]
async fn test_monitor_polls_without_advancing() {
    let h = Harness::new();
    let endpoints = h.seed("eu1/orders", &TABLES);
    h.orchestrator.create(endpoints.request.clone()).await.unwrap();
    for _ in 0..4 {
        h.advance("eu1/orders").await.unwrap();
    }
    endpoints.catch_up();

    let cancel = CancellationToken::new();
    let monitor = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        let cancel = cancel.clone();
        async move { orchestrator.monitor("eu1/orders", cancel).await }
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let report = loop {
        let status = h.orchestrator.status("eu1/orders").await.unwrap();
        if let Some(report) = status.report.filter(|r| r.polls >= 2) {
            break report;
        }
        assert!(tokio::time::Instant::now() < deadline, "monitor never polled twice");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    cancel.cancel();
    monitor.await.unwrap().unwrap();

    assert_eq!(report.tables_in(SyncState::Synchronized).len(), TABLES.len());
    assert_eq!(h.stage("eu1/orders").await, Stage::InitialSyncing);
    assert!(matches!(
        h.orchestrator
            .monitor("eu1/missing", CancellationToken::new())
            .await
            .unwrap_err(),
        MigratorError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_run_drives_pairs_independently() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.clean_polls_required = 1;
    let h = Harness::with_config(dir, config);

    let good = h.seed("eu1/good", &["public.a", "public.b"]);
    let bad = h.seed("eu1/bad", &["public.a"]);
    bad.source.state().tables.get_mut("public.a").unwrap().has_pk = false;
    let held = h.seed("eu1/held", &["public.a"]);
    for endpoints in [&good, &bad, &held] {
        h.orchestrator.create(endpoints.request.clone()).await.unwrap();
    }
    h.orchestrator.pause("eu1/held").await.unwrap();

    let cancel = CancellationToken::new();
    let runner = tokio::spawn(h.orchestrator.clone().run(cancel.clone()));

    wait_for_stage(&h, "eu1/good", Stage::InitialSyncing).await;
    good.catch_up();
    wait_for_stage(&h, "eu1/good", Stage::SteadyState).await;

    cancel.cancel();
    let outcomes = runner.await.unwrap().unwrap();
    let ids: Vec<&str> = outcomes.iter().map(|o| o.pair_id.as_str()).collect();
    assert_eq!(ids, vec!["eu1/bad", "eu1/good", "eu1/held"]);
    assert!(matches!(
        outcomes[0].result,
        Err(MigratorError::PreconditionViolation { .. })
    ));
    assert!(outcomes[1].result.is_ok());
    assert!(outcomes[2].result.is_ok());

    assert_eq!(h.stage("eu1/bad").await, Stage::Failed);
    assert_eq!(h.stage("eu1/good").await, Stage::SteadyState);
    assert_eq!(h.stage("eu1/held").await, Stage::Uninitialized);
    assert_eq!(h.router.attempts(), 0);
}

async fn wait_for_stage(h: &Harness, pair_id: &str, stage: Stage) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let current = h.stage(pair_id).await;
        if current == stage {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} stuck at {} waiting for {}",
            pair_id,
            current,
            stage
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ABOUTME: Shared fixtures for integration tests - in-memory endpoints, recording router, temp store
// ABOUTME: Each harness gets its own SQLite file so restarts can be simulated

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use pglogical_cutover::config::{Dsn, OrchestratorConfig, RetryConfig};
use pglogical_cutover::context::{ContextOptions, NewMigration, ObjectSelection};
use pglogical_cutover::error::{MigratorError, Result};
use pglogical_cutover::remote::TrafficRouter;
use pglogical_cutover::replication::{
    InMemoryEndpoint, InMemoryFactory, ObjectNames, RemoteTableState, SubscriptionStatus,
};
use pglogical_cutover::schema::SchemaCopier;
use pglogical_cutover::store::ContextStore;
use pglogical_cutover::{Advance, Lsn, Orchestrator, Stage};

pub struct NoCopy;

#[async_trait]
impl SchemaCopier for NoCopy {
    async fn copy_tables(&self, _: &Dsn, _: &Dsn, _: &[String]) -> Result<()> {
        Ok(())
    }
}

/// Roles frozen during cutover, with the write privileges each holds on every seeded table.
pub const ROLE_GRANTS: [(&str, &[&str]); 3] = [
    ("app_owner", &["INSERT", "UPDATE", "DELETE", "TRUNCATE"]),
    ("app_rw", &["INSERT", "UPDATE", "DELETE"]),
    ("app_ro", &[]),
];

/// Router double that records every redirect and can be told to fail.
#[derive(Default)]
pub struct RecordingRouter {
    redirects: Mutex<Vec<String>>,
    attempts: AtomicU32,
    failures: AtomicU32,
    /// Application writes that land on the new primary as soon as traffic moves.
    writes_after_redirect: Mutex<Vec<(Arc<InMemoryEndpoint>, String, i64)>>,
}

impl RecordingRouter {
    pub fn fail_next(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn write_after_redirect(&self, target: Arc<InMemoryEndpoint>, table: &str, rows: i64) {
        self.writes_after_redirect
            .lock()
            .unwrap()
            .push((target, table.to_string(), rows));
    }

    pub fn redirects(&self) -> Vec<String> {
        self.redirects.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrafficRouter for RecordingRouter {
    async fn redirect(&self, pair_id: &str, _target: &Dsn) -> Result<String> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MigratorError::Router("router returned 503".into()));
        }
        self.redirects.lock().unwrap().push(pair_id.to_string());
        for (target, table, rows) in self.writes_after_redirect.lock().unwrap().drain(..) {
            target.insert_rows(&table, rows);
        }
        Ok(format!("ack-{}", attempt))
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub factory: Arc<InMemoryFactory>,
    pub router: Arc<RecordingRouter>,
    pub config: OrchestratorConfig,
    pub dir: TempDir,
}

pub fn test_config(dir: &TempDir) -> OrchestratorConfig {
    OrchestratorConfig {
        state_path: dir.path().join("state.db"),
        batch_size: 2,
        poll_interval_secs: 1,
        clean_polls_required: 2,
        max_lag_bytes: 1_024,
        drain_timeout_secs: 1,
        drain_poll_interval_ms: 100,
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        ..OrchestratorConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        Self::with_config(dir, config)
    }

    pub fn with_config(dir: TempDir, config: OrchestratorConfig) -> Self {
        let factory = Arc::new(InMemoryFactory::new());
        let router = Arc::new(RecordingRouter::default());
        let orchestrator = Self::orchestrator(&config, factory.clone(), router.clone());
        Self {
            orchestrator,
            factory,
            router,
            config,
            dir,
        }
    }

    pub fn orchestrator(
        config: &OrchestratorConfig,
        factory: Arc<InMemoryFactory>,
        router: Arc<RecordingRouter>,
    ) -> Arc<Orchestrator> {
        let store = ContextStore::open(&config.state_path).unwrap();
        Arc::new(Orchestrator::new(
            config,
            store,
            factory,
            Arc::new(NoCopy),
            router,
        ))
    }

    /// A second orchestrator over the same state file, as after a process restart.
    pub fn restart(&self) -> Arc<Orchestrator> {
        Self::orchestrator(&self.config, self.factory.clone(), self.router.clone())
    }

    pub fn state_path(&self) -> PathBuf {
        self.config.state_path.clone()
    }

    /// Register source and target endpoints holding `tables` (10 rows each) for `pair_id`.
    pub fn seed(&self, pair_id: &str, tables: &[&str]) -> Endpoints {
        let request = migration(pair_id, tables);
        let source = Arc::new(tables.iter().fold(InMemoryEndpoint::new(), |e, t| {
            ROLE_GRANTS
                .iter()
                .fold(e.with_table(t, 10), |e, (role, privileges)| {
                    e.with_grant(t, role, privileges)
                })
        }));
        let target = Arc::new(
            tables
                .iter()
                .fold(InMemoryEndpoint::new(), |e, t| e.with_table(t, 10)),
        );
        self.factory.register(&request.source_dsn, source.clone());
        self.factory.register(&request.target_dsn, target.clone());
        Endpoints {
            source,
            target,
            request,
        }
    }

    pub async fn advance(&self, pair_id: &str) -> Result<Advance> {
        self.orchestrator
            .advance(pair_id, None, &CancellationToken::new())
            .await
    }

    pub async fn stage(&self, pair_id: &str) -> Stage {
        self.orchestrator.status(pair_id).await.unwrap().stage
    }

    /// Create the migration and walk it into steady-state with replication caught up.
    pub async fn steady_state(&self, endpoints: &Endpoints) {
        let pair_id = endpoints.request.pair_id.clone();
        self.orchestrator
            .create(endpoints.request.clone())
            .await
            .unwrap();
        for _ in 0..4 {
            self.advance(&pair_id).await.unwrap();
        }
        assert_eq!(self.stage(&pair_id).await, Stage::InitialSyncing);

        endpoints.catch_up();
        for _ in 0..self.config.clean_polls_required {
            self.orchestrator.poll_once(&pair_id).await.unwrap();
        }
        let outcome = self.advance(&pair_id).await.unwrap();
        assert_eq!(
            outcome,
            Advance::Transitioned {
                from: Stage::InitialSyncing,
                to: Stage::SteadyState
            }
        );
    }
}

pub struct Endpoints {
    pub source: Arc<InMemoryEndpoint>,
    pub target: Arc<InMemoryEndpoint>,
    pub request: NewMigration,
}

impl Endpoints {
    /// Every table ready, subscription replicating and the target applied up to the source's WAL position.
    pub fn catch_up(&self) {
        let tables: Vec<String> = self.source.state().tables.keys().cloned().collect();
        let refs: Vec<&str> = tables.iter().map(String::as_str).collect();
        self.target.set_sync_state(&refs, RemoteTableState::Ready);

        let names = ObjectNames::for_pair(&self.request.pair_id);
        if let Some(sub) = self.target.state().subscriptions.get_mut(&names.subscription) {
            sub.status = SubscriptionStatus::Replicating;
        }
        let wal = self.source.state().wal_lsn;
        self.target.state().applied_lsn = Some(wal);
    }

    /// Source writes committed past what the target has applied.
    pub fn source_writes(&self, table: &str, changes: u64, wal_bytes: u64) {
        self.source.add_changes(table, changes);
        let mut state = self.source.state();
        state.wal_lsn = Lsn(state.wal_lsn.0 + wal_bytes);
    }
}

pub fn migration(pair_id: &str, tables: &[&str]) -> NewMigration {
    NewMigration {
        pair_id: pair_id.to_string(),
        source_dsn: Dsn::new(format!("host=src-{} password=s3cret", pair_id)),
        target_dsn: Dsn::new(format!("host=dst-{} password=s3cret", pair_id)),
        provider_dsn: Dsn::new(format!("host=src-{} user=pglogical password=s3cret", pair_id)),
        schema_name: "public".into(),
        tables: ObjectSelection::Explicit(tables.iter().map(|t| t.to_string()).collect()),
        sequences: ObjectSelection::Explicit(vec![]),
        frozen_roles: ROLE_GRANTS.iter().map(|(role, _)| role.to_string()).collect(),
        options: ContextOptions::default(),
    }
}

// ABOUTME: Orchestrator entry point - operator commands plus a parallel driver for many migrations
// ABOUTME: Work for one pair is serialized by a keyed lock; pairs run independently with their own timeouts

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::OrchestratorConfig;
use crate::context::{
    ContextOptions, CutoverState, FailureRecord, MigrationContext, MonitorReport, NewMigration,
    ObjectSelection, Stage,
};
use crate::cutover::{CutoverCoordinator, CutoverSettings};
use crate::error::{MigratorError, Result};
use crate::gateway::RetryPolicy;
use crate::machine::{Advance, StageMachine};
use crate::monitor::StatusMonitor;
use crate::remote::TrafficRouter;
use crate::replication::{EndpointFactory, ReplicationCatalog, ReplicationSetManager};
use crate::schema::SchemaCopier;
use crate::store::ContextStore;

/// One async mutex per pair id.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(key.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}

/// Operator-facing view of one migration. Connection strings are redacted.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub pair_id: String,
    pub source: String,
    pub target: String,
    pub stage: Stage,
    pub paused: bool,
    pub revision: u64,
    pub tracked_tables: usize,
    pub set_tables: usize,
    pub tracked_sequences: usize,
    pub set_sequences: usize,
    pub cutover: Option<CutoverState>,
    pub last_error: Option<FailureRecord>,
    pub report: Option<MonitorReport>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationStatus {
    fn new(ctx: &MigrationContext, mut report: Option<MonitorReport>) -> Self {
        // Verified tokens live with the context, where writes are revision-checked.
        let verified = match ctx.stage {
            Stage::CutoverComplete | Stage::TornDown => {
                ctx.cutover.as_ref().and_then(|state| state.snapshot.as_ref())
            }
            _ => None,
        };
        if let (Some(snapshot), Some(report)) = (verified, report.as_mut()) {
            for (table, token) in &snapshot.target {
                if let Some(status) = report.tables.get_mut(table) {
                    status.verified = Some(token.clone());
                }
            }
        }
        Self {
            pair_id: ctx.pair_id.clone(),
            source: ctx.source_dsn.redacted(),
            target: ctx.target_dsn.redacted(),
            stage: ctx.stage,
            paused: ctx.paused,
            revision: ctx.revision,
            tracked_tables: ctx.tables.len(),
            set_tables: ctx.set_tables.len(),
            tracked_sequences: ctx.sequences.len(),
            set_sequences: ctx.set_sequences.len(),
            cutover: ctx.cutover.clone(),
            last_error: ctx.last_error.clone(),
            report,
            updated_at: ctx.updated_at,
        }
    }
}

/// How a driven context finished during `run`.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextOutcome {
    pub pair_id: String,
    pub result: Result<()>,
}

enum Drive {
    Continue,
    Stop,
}

pub struct Orchestrator {
    store: ContextStore,
    machine: StageMachine,
    monitor: StatusMonitor,
    cutover: CutoverCoordinator,
    endpoints: Arc<dyn EndpointFactory>,
    locks: KeyedLocks,
    step_timeout: Duration,
    poll_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        config: &OrchestratorConfig,
        store: ContextStore,
        endpoints: Arc<dyn EndpointFactory>,
        copier: Arc<dyn SchemaCopier>,
        router: Arc<dyn TrafficRouter>,
    ) -> Self {
        let sets = ReplicationSetManager::new(config.batch_size, RetryPolicy::from(&config.retry));
        Self {
            machine: StageMachine::new(
                store.clone(),
                sets,
                copier,
                config.lag_freshness(),
                config.max_lag_bytes,
            ),
            monitor: StatusMonitor::new(config.clean_polls_required, config.poll_interval()),
            cutover: CutoverCoordinator::new(CutoverSettings::from(config), router),
            store,
            endpoints,
            locks: KeyedLocks::default(),
            step_timeout: config.context_step_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    /// Register a migration. Repeating an identical request returns the existing context.
    pub async fn create(&self, new: NewMigration) -> Result<MigrationContext> {
        let _guard = self.locks.lock(&new.pair_id).await;
        let source = self.endpoints.endpoint(&new.source_dsn);

        let tables = match &new.tables {
            ObjectSelection::Explicit(list) => sorted(list.clone()),
            ObjectSelection::Discover(filter) => {
                let found = source.list_tables(&new.schema_name).await?;
                filter.apply(&new.schema_name, &found)
            }
        };
        let sequences = match &new.sequences {
            ObjectSelection::Explicit(list) => sorted(list.clone()),
            ObjectSelection::Discover(filter) => {
                let found = source.list_sequences(&new.schema_name).await?;
                filter.apply(&new.schema_name, &found)
            }
        };
        if tables.is_empty() {
            return Err(MigratorError::Validation(format!(
                "migration {} selects no tables",
                new.pair_id
            )));
        }

        let fingerprint = fingerprint(&new, &tables, &sequences);
        if let Some(existing) = self.store.get(&new.pair_id).await? {
            if existing.fingerprint == fingerprint {
                debug!(pair = %new.pair_id, "Migration already registered");
                return Ok(existing);
            }
            return Err(MigratorError::Validation(format!(
                "migration {} already exists with a different configuration",
                new.pair_id
            )));
        }

        let now = Utc::now();
        let mut ctx = MigrationContext {
            pair_id: new.pair_id.clone(),
            source_dsn: new.source_dsn,
            target_dsn: new.target_dsn,
            provider_dsn: new.provider_dsn,
            stage: Stage::Uninitialized,
            tables: tables.into_iter().collect(),
            sequences: sequences.into_iter().collect(),
            set_tables: Default::default(),
            set_sequences: Default::default(),
            frozen_roles: new.frozen_roles,
            options: new.options,
            cutover: None,
            paused: false,
            last_error: None,
            fingerprint,
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&mut ctx).await?;
        info!(
            pair = %ctx.pair_id,
            tables = ctx.tables.len(),
            sequences = ctx.sequences.len(),
            "Migration created"
        );
        Ok(ctx)
    }

    /// One forward transition, to the successor stage or to `to` if given.
    pub async fn advance(
        &self,
        pair_id: &str,
        to: Option<Stage>,
        cancel: &CancellationToken,
    ) -> Result<Advance> {
        let _guard = self.locks.lock(pair_id).await;
        let mut ctx = self.store.load(pair_id).await?;
        let pair = self.endpoints.pair(&ctx);
        match to {
            Some(target) => self.machine.advance_to(&mut ctx, &pair, target, cancel).await,
            None => self.machine.advance(&mut ctx, &pair, cancel).await,
        }
    }

    pub async fn pause(&self, pair_id: &str) -> Result<MigrationContext> {
        self.set_paused(pair_id, true).await
    }

    pub async fn resume(&self, pair_id: &str) -> Result<MigrationContext> {
        self.set_paused(pair_id, false).await
    }

    async fn set_paused(&self, pair_id: &str, paused: bool) -> Result<MigrationContext> {
        let _guard = self.locks.lock(pair_id).await;
        let mut ctx = self.store.load(pair_id).await?;
        if ctx.paused != paused {
            ctx.paused = paused;
            self.store.persist(&mut ctx).await?;
            info!(pair = %pair_id, paused, "Migration pause state changed");
        }
        Ok(ctx)
    }

    /// Start or resume the cutover of one pair.
    pub async fn cutover(&self, pair_id: &str, cancel: &CancellationToken) -> Result<Stage> {
        let _guard = self.locks.lock(pair_id).await;
        let mut ctx = self.store.load(pair_id).await?;
        let pair = self.endpoints.pair(&ctx);
        self.cutover.run(&self.machine, &mut ctx, &pair, cancel).await
    }

    pub async fn reset(&self, pair_id: &str) -> Result<Stage> {
        let _guard = self.locks.lock(pair_id).await;
        let mut ctx = self.store.load(pair_id).await?;
        let pair = self.endpoints.pair(&ctx);
        self.machine.reset(&mut ctx, &pair).await
    }

    pub async fn rollback(&self, pair_id: &str) -> Result<()> {
        let _guard = self.locks.lock(pair_id).await;
        let mut ctx = self.store.load(pair_id).await?;
        let pair = self.endpoints.pair(&ctx);
        self.machine.rollback(&mut ctx, &pair).await
    }

    /// Latest persisted stage, error and monitor report.
    pub async fn status(&self, pair_id: &str) -> Result<MigrationStatus> {
        let ctx = self.store.load(pair_id).await?;
        let report = self.store.load_report(pair_id).await?;
        Ok(MigrationStatus::new(&ctx, report))
    }

    pub async fn list(&self) -> Result<Vec<MigrationStatus>> {
        let mut statuses = Vec::new();
        for ctx in self.store.list().await? {
            let report = self.store.load_report(&ctx.pair_id).await?;
            statuses.push(MigrationStatus::new(&ctx, report));
        }
        Ok(statuses)
    }

    /// Poll replication status once. Only valid while the pair is being monitored.
    pub async fn poll_once(&self, pair_id: &str) -> Result<MonitorReport> {
        let ctx = self.store.load(pair_id).await?;
        if !ctx.stage.is_monitored() {
            return Err(MigratorError::precondition(
                ctx.stage,
                "status is only polled during initial-syncing and steady-state",
            ));
        }
        self.monitor
            .poll_once(&self.store, self.endpoints.as_ref(), &ctx)
            .await
    }

    /// Poll one pair on the monitor interval without advancing it, until cancelled
    /// or the pair reaches a terminal stage.
    pub async fn monitor(&self, pair_id: &str, cancel: CancellationToken) -> Result<()> {
        self.store.load(pair_id).await?;
        self.monitor
            .run(&self.store, self.endpoints.as_ref(), pair_id, cancel)
            .instrument(info_span!("monitor", pair = %pair_id))
            .await
    }

    /// Drive every non-terminal migration until it stops or `cancel` fires.
    /// Cutover is never started here; it stays an explicit operator command.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<Vec<ContextOutcome>> {
        let mut tasks = JoinSet::new();
        for ctx in self.store.list().await? {
            if ctx.stage.is_terminal() || ctx.stage.is_cutover() {
                debug!(pair = %ctx.pair_id, stage = %ctx.stage, "Not driving migration");
                continue;
            }
            let this = self.clone();
            let cancel = cancel.child_token();
            let pair_id = ctx.pair_id.clone();
            let span = info_span!("migration", pair = %pair_id);
            tasks.spawn(
                async move {
                    let result = this.drive(&pair_id, &cancel).await;
                    ContextOutcome { pair_id, result }
                }
                .instrument(span),
            );
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    match &outcome.result {
                        Ok(()) => info!(pair = %outcome.pair_id, "Migration driver finished"),
                        Err(err) => error!(pair = %outcome.pair_id, "Migration driver stopped: {}", err),
                    }
                    outcomes.push(outcome);
                }
                Err(err) => error!("Migration driver task panicked: {}", err),
            }
        }
        outcomes.sort_by(|a, b| a.pair_id.cmp(&b.pair_id));
        Ok(outcomes)
    }

    async fn drive(&self, pair_id: &str, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match tokio::time::timeout(self.step_timeout, self.step(pair_id, cancel)).await {
                Ok(Ok(Drive::Stop)) => return Ok(()),
                Ok(Ok(Drive::Continue)) => {}
                Ok(Err(MigratorError::Cancelled)) => return Ok(()),
                Ok(Err(err)) if err.is_fatal() => return Err(err),
                Ok(Err(err)) => warn!(pair = %pair_id, "Step failed, will retry: {}", err),
                Err(_) => warn!(
                    pair = %pair_id,
                    timeout_secs = self.step_timeout.as_secs(),
                    "Step timed out, will retry"
                ),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn step(&self, pair_id: &str, cancel: &CancellationToken) -> Result<Drive> {
        let _guard = self.locks.lock(pair_id).await;
        let mut ctx = self.store.load(pair_id).await?;
        if ctx.stage.is_terminal() || ctx.stage.is_cutover() {
            return Ok(Drive::Stop);
        }
        if ctx.paused {
            return Ok(Drive::Continue);
        }
        if ctx.stage.is_monitored() {
            self.monitor
                .poll_once(&self.store, self.endpoints.as_ref(), &ctx)
                .await?;
        }
        if ctx.stage == Stage::SteadyState {
            return Ok(Drive::Continue);
        }

        let pair = self.endpoints.pair(&ctx);
        // Walk forward while stages complete immediately; stop at the first wait.
        loop {
            match self.machine.advance(&mut ctx, &pair, cancel).await? {
                Advance::Transitioned { to, .. } if !to.is_monitored() => continue,
                Advance::Transitioned { .. } => return Ok(Drive::Continue),
                Advance::AlreadyAt(_) => return Ok(Drive::Continue),
                Advance::Waiting { reason, .. } => {
                    debug!(pair = %pair_id, stage = %ctx.stage, "Waiting: {}", reason);
                    return Ok(Drive::Continue);
                }
            }
        }
    }
}

fn sorted(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items.dedup();
    items
}

/// Stable digest of everything that defines a migration.
fn fingerprint(new: &NewMigration, tables: &[String], sequences: &[String]) -> String {
    let mut hasher = Sha256::new();
    let mut field = |value: &str| {
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    };
    field(new.source_dsn.expose());
    field(new.target_dsn.expose());
    field(new.provider_dsn.expose());
    for table in tables {
        field(table);
    }
    field("--sequences--");
    for sequence in sequences {
        field(sequence);
    }
    field("--roles--");
    for role in &new.frozen_roles {
        field(role);
    }
    let ContextOptions {
        copy_schema,
        verify_checksums,
    } = &new.options;
    field(&format!("copy_schema={} verify_checksums={}", copy_schema, verify_checksums));
    BASE64.encode(hasher.finalize())
}

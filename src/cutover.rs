// ABOUTME: Cutover coordinator - freeze, drain, pointer flip, verification and source teardown
// ABOUTME: Failures before the pointer flip unwind to SteadyState; failures after it leave the context Failed

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::OrchestratorConfig;
use crate::context::{
    CutoverPhase, CutoverState, FailureRecord, FrozenSnapshot, MigrationContext, Stage, SyncState,
    VerificationToken,
};
use crate::error::{MigratorError, Result};
use crate::lsn::Lsn;
use crate::machine::StageMachine;
use crate::remote::TrafficRouter;
use crate::replication::{ObjectNames, PairEndpoints, ReplicationCatalog, ReplicationEndpoint};

#[derive(Debug, Clone, PartialEq)]
pub struct CutoverSettings {
    pub max_lag_bytes: u64,
    pub lag_freshness: chrono::Duration,
    pub drain_timeout: Duration,
    pub drain_poll_interval: Duration,
}

impl From<&OrchestratorConfig> for CutoverSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_lag_bytes: config.max_lag_bytes,
            lag_freshness: config.lag_freshness(),
            drain_timeout: config.drain_timeout(),
            drain_poll_interval: config.drain_poll_interval(),
        }
    }
}

pub struct CutoverCoordinator {
    settings: CutoverSettings,
    router: Arc<dyn TrafficRouter>,
}

impl CutoverCoordinator {
    pub fn new(settings: CutoverSettings, router: Arc<dyn TrafficRouter>) -> Self {
        Self { settings, router }
    }

    /// Start a cutover from `SteadyState`, or resume one from its persisted phase.
    /// Returns the stage the context ends in.
    pub async fn run(
        &self,
        machine: &StageMachine,
        ctx: &mut MigrationContext,
        pair: &PairEndpoints,
        cancel: &CancellationToken,
    ) -> Result<Stage> {
        let resuming = match ctx.stage {
            Stage::SteadyState => {
                self.pre_check(machine, ctx).await?;
                let tables: Vec<String> = ctx.tables.iter().cloned().collect();
                let source_grants = pair
                    .source
                    .write_grants(&tables, &ctx.frozen_roles)
                    .await
                    .map_err(|err| MigratorError::CutoverAborted {
                        phase: CutoverPhase::PreCheck,
                        reason: format!("could not read source write grants: {}", err),
                    })?;
                ctx.cutover = Some(CutoverState::new(CutoverPhase::FreezeSource, source_grants));
                if let Err(err) = machine.commit(ctx, Stage::CutoverInProgress).await {
                    ctx.cutover = None;
                    return Err(err);
                }
                info!(pair = %ctx.pair_id, "Cutover started");
                false
            }
            Stage::CutoverInProgress | Stage::CutoverComplete => {
                info!(pair = %ctx.pair_id, phase = ?ctx.cutover_phase(), "Resuming cutover");
                true
            }
            Stage::TornDown => return Ok(Stage::TornDown),
            other => {
                return Err(MigratorError::CutoverAborted {
                    phase: CutoverPhase::PreCheck,
                    reason: format!("cutover requires steady-state, migration is {}", other),
                })
            }
        };

        let mut first = true;
        loop {
            let Some(state) = ctx.cutover.clone() else {
                return Err(MigratorError::Validation(format!(
                    "{} is {} but has no cutover phase recorded",
                    ctx.pair_id, ctx.stage
                )));
            };
            let resumed_here = resuming && first;
            first = false;

            match state.phase {
                CutoverPhase::PreCheck | CutoverPhase::FreezeSource => {
                    self.freeze(machine, ctx, pair).await?;
                }
                CutoverPhase::DrainVerify { frozen_lsn } => {
                    self.drain(machine, ctx, pair, frozen_lsn, cancel).await?;
                }
                CutoverPhase::PointerFlip { frozen_lsn } => {
                    if resumed_here && !state.operator_resumed {
                        let err = MigratorError::IrreversibleStageFailure {
                            phase: state.phase.clone(),
                            diagnostic: "interrupted during the pointer flip; the router may already \
                                         have redirected traffic. Check the router, then reset to resume"
                                .into(),
                        };
                        return Err(machine.record_failure(ctx, err).await);
                    }
                    self.flip(machine, ctx, frozen_lsn).await?;
                }
                CutoverPhase::PostVerify { frozen_lsn, .. } => {
                    self.post_verify(machine, ctx, pair, frozen_lsn).await?;
                }
                CutoverPhase::TeardownSource { .. } => {
                    self.teardown(machine, ctx, pair).await?;
                    return Ok(ctx.stage);
                }
            }
        }
    }

    /// Every condition for starting a cutover. Reads only; writes nothing on failure.
    pub async fn pre_check(&self, machine: &StageMachine, ctx: &MigrationContext) -> Result<()> {
        let abort = |reason: String| MigratorError::CutoverAborted {
            phase: CutoverPhase::PreCheck,
            reason,
        };
        if ctx.stage != Stage::SteadyState {
            return Err(abort(format!("migration is {}, not steady-state", ctx.stage)));
        }
        if ctx.paused {
            return Err(abort("migration is paused".into()));
        }
        let Some(report) = machine.store().load_report(&ctx.pair_id).await? else {
            return Err(abort("no status report available".into()));
        };
        if report.subscription_down {
            return Err(abort("subscription is down".into()));
        }
        let Some(lag) = &report.lag else {
            return Err(abort("no lag snapshot available".into()));
        };
        if !lag.is_fresh(Utc::now(), self.settings.lag_freshness) {
            return Err(abort(format!(
                "lag snapshot from {} is older than {}s",
                lag.taken_at(),
                self.settings.lag_freshness.num_seconds()
            )));
        }
        if lag.wal_lag_bytes() > self.settings.max_lag_bytes {
            return Err(abort(format!(
                "replication lag {} bytes exceeds limit of {} bytes",
                lag.wal_lag_bytes(),
                self.settings.max_lag_bytes
            )));
        }
        if !report.all_synchronized(&ctx.tables) {
            let lagging: Vec<&String> = ctx
                .tables
                .iter()
                .filter(|t| {
                    report
                        .tables
                        .get(*t)
                        .map(|s| s.state != SyncState::Synchronized)
                        .unwrap_or(true)
                })
                .collect();
            return Err(abort(format!("tables not synchronized: {:?}", lagging)));
        }
        Ok(())
    }

    async fn freeze(
        &self,
        machine: &StageMachine,
        ctx: &mut MigrationContext,
        pair: &PairEndpoints,
    ) -> Result<()> {
        let tables: Vec<String> = ctx.tables.iter().cloned().collect();
        if let Err(err) = pair.source.revoke_writes(&tables, &ctx.frozen_roles).await {
            return Err(self
                .abort(machine, ctx, pair, CutoverPhase::FreezeSource, err.to_string())
                .await);
        }
        // Read after the revoke so every write that got through is at or below this position.
        let frozen_lsn = match pair.source.current_wal_lsn().await {
            Ok(lsn) => lsn,
            Err(err) => {
                return Err(self
                    .abort(machine, ctx, pair, CutoverPhase::FreezeSource, err.to_string())
                    .await)
            }
        };
        info!(pair = %ctx.pair_id, frozen_lsn = %frozen_lsn, roles = ?ctx.frozen_roles, "Source writes frozen");
        self.enter_phase(machine, ctx, pair, CutoverPhase::DrainVerify { frozen_lsn })
            .await
    }

    async fn drain(
        &self,
        machine: &StageMachine,
        ctx: &mut MigrationContext,
        pair: &PairEndpoints,
        frozen_lsn: Lsn,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let phase = CutoverPhase::DrainVerify { frozen_lsn };
        let names = ObjectNames::for_pair(&ctx.pair_id);
        let started = Instant::now();
        let deadline = started + self.settings.drain_timeout;

        let mut last_seen = None;
        loop {
            match pair.target.applied_lsn(&names.subscription).await {
                Ok(Some(applied)) if applied >= frozen_lsn => {
                    info!(
                        pair = %ctx.pair_id,
                        applied = %applied,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Target drained to frozen position"
                    );
                    break;
                }
                Ok(applied) => last_seen = applied,
                Err(err) if err.is_transient() => {
                    warn!(pair = %ctx.pair_id, "Drain poll failed, will retry: {}", err);
                }
                Err(err) => {
                    return Err(self.abort(machine, ctx, pair, phase, err.to_string()).await);
                }
            }

            if Instant::now() >= deadline {
                let reason = format!(
                    "target applied {} but frozen position is {} after {}s",
                    last_seen
                        .map(|l: Lsn| l.to_string())
                        .unwrap_or_else(|| "nothing".into()),
                    frozen_lsn,
                    self.settings.drain_timeout.as_secs()
                );
                return Err(self.abort(machine, ctx, pair, phase, reason).await);
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    let err = self.abort(machine, ctx, pair, phase, "cancelled".into()).await;
                    warn!(pair = %ctx.pair_id, "Cutover cancelled during drain: {}", err);
                    return Err(MigratorError::Cancelled);
                }
                _ = tokio::time::sleep(self.settings.drain_poll_interval) => {}
            }
        }

        if let Err(err) = self.sync_sequences(ctx, pair).await {
            return Err(self.abort(machine, ctx, pair, phase, err.to_string()).await);
        }
        // Source is frozen and the target has applied everything up to the frozen
        // position, and no traffic has moved yet: both ends are at the same snapshot.
        let snapshot = match self.capture_snapshot(ctx, pair).await {
            Ok(snapshot) => snapshot,
            Err(err) => return Err(self.abort(machine, ctx, pair, phase, err.to_string()).await),
        };
        if let Some(state) = ctx.cutover.as_mut() {
            state.snapshot = Some(snapshot);
        }
        self.enter_phase(machine, ctx, pair, CutoverPhase::PointerFlip { frozen_lsn })
            .await
    }

    /// Sequences are not streamed by the subscription; copy their values once writes are frozen.
    async fn sync_sequences(&self, ctx: &MigrationContext, pair: &PairEndpoints) -> Result<()> {
        if ctx.sequences.is_empty() {
            return Ok(());
        }
        let sequences: Vec<String> = ctx.sequences.iter().cloned().collect();
        let values: BTreeMap<String, i64> = pair.source.sequence_values(&sequences).await?;
        pair.target.set_sequence_values(&values).await?;
        info!(pair = %ctx.pair_id, sequences = values.len(), "Sequence values copied to target");
        Ok(())
    }

    async fn flip(
        &self,
        machine: &StageMachine,
        ctx: &mut MigrationContext,
        frozen_lsn: Lsn,
    ) -> Result<()> {
        let phase = CutoverPhase::PointerFlip { frozen_lsn };
        info!(pair = %ctx.pair_id, target = %ctx.target_dsn, "Redirecting traffic to target");
        match self.router.redirect(&ctx.pair_id, &ctx.target_dsn).await {
            Ok(redirect_ack) => {
                if let Some(state) = ctx.cutover.as_mut() {
                    state.phase = CutoverPhase::PostVerify {
                        frozen_lsn,
                        redirect_ack,
                    };
                    state.operator_resumed = false;
                }
                if let Err(err) = machine.store().persist(ctx).await {
                    return Err(self.irreversible(machine, ctx, phase, err).await);
                }
                Ok(())
            }
            Err(err) => Err(self.irreversible(machine, ctx, phase, err).await),
        }
    }

    async fn post_verify(
        &self,
        machine: &StageMachine,
        ctx: &mut MigrationContext,
        pair: &PairEndpoints,
        frozen_lsn: Lsn,
    ) -> Result<()> {
        let phase = ctx
            .cutover_phase()
            .cloned()
            .unwrap_or(CutoverPhase::PostVerify {
                frozen_lsn,
                redirect_ack: String::new(),
            });
        let (recorded, operator_resumed) = match &ctx.cutover {
            Some(state) => (state.snapshot.clone(), state.operator_resumed),
            None => (None, false),
        };

        // After an operator reset the target is read again: the operator has reconciled it.
        let snapshot = match (recorded, operator_resumed) {
            (Some(snapshot), false) => snapshot,
            (_, true) => match self.capture_snapshot(ctx, pair).await {
                Ok(snapshot) => snapshot,
                Err(err) => return Err(self.irreversible(machine, ctx, phase, err).await),
            },
            (None, false) => {
                let err = MigratorError::Validation(
                    "no snapshot was recorded at the frozen position; reconcile the target, \
                     then reset to verify against it"
                        .into(),
                );
                return Err(self.irreversible(machine, ctx, phase, err).await);
            }
        };

        let mismatches = snapshot.mismatches(&ctx.tables);
        if !mismatches.is_empty() {
            let err = MigratorError::Validation(format!(
                "source and target differ at the frozen position: {}",
                mismatches.join("; ")
            ));
            return Err(self.irreversible(machine, ctx, phase, err).await);
        }

        let verified = snapshot.target.len();
        if let Some(state) = ctx.cutover.as_mut() {
            state.phase = CutoverPhase::TeardownSource { frozen_lsn };
            state.operator_resumed = false;
            state.snapshot = Some(snapshot);
        }
        if let Err(err) = machine.commit(ctx, Stage::CutoverComplete).await {
            return Err(self.irreversible(machine, ctx, phase, err).await);
        }
        info!(pair = %ctx.pair_id, tables = verified, "Post-cutover verification passed");
        Ok(())
    }

    /// Verification tokens of every tracked table on both ends.
    async fn capture_snapshot(
        &self,
        ctx: &MigrationContext,
        pair: &PairEndpoints,
    ) -> Result<FrozenSnapshot> {
        let checksum = ctx.options.verify_checksums;
        let mut snapshot = FrozenSnapshot::default();
        for table in &ctx.tables {
            let (source, target): (VerificationToken, VerificationToken) = futures::try_join!(
                pair.source.verification_token(table, checksum),
                pair.target.verification_token(table, checksum)
            )?;
            snapshot.source.insert(table.clone(), source);
            snapshot.target.insert(table.clone(), target);
        }
        Ok(snapshot)
    }

    async fn teardown(
        &self,
        machine: &StageMachine,
        ctx: &mut MigrationContext,
        pair: &PairEndpoints,
    ) -> Result<()> {
        let phase = ctx
            .cutover_phase()
            .cloned()
            .unwrap_or(CutoverPhase::TeardownSource {
                frozen_lsn: Lsn::ZERO,
            });
        if let Err(err) = machine.sets().remove_objects(ctx, pair).await {
            return Err(self.irreversible(machine, ctx, phase, err).await);
        }
        ctx.set_tables.clear();
        ctx.set_sequences.clear();
        machine.commit(ctx, Stage::TornDown).await?;
        info!(pair = %ctx.pair_id, "Cutover complete, replication torn down");
        Ok(())
    }

    /// Persist the next phase. A failed write before the flip unwinds the freeze.
    async fn enter_phase(
        &self,
        machine: &StageMachine,
        ctx: &mut MigrationContext,
        pair: &PairEndpoints,
        next: CutoverPhase,
    ) -> Result<()> {
        let current = ctx
            .cutover_phase()
            .cloned()
            .unwrap_or(CutoverPhase::FreezeSource);
        if let Some(state) = ctx.cutover.as_mut() {
            state.phase = next;
        }
        if let Err(err) = machine.store().persist(ctx).await {
            if let Some(state) = ctx.cutover.as_mut() {
                state.phase = current.clone();
            }
            return Err(self.abort(machine, ctx, pair, current, err.to_string()).await);
        }
        Ok(())
    }

    /// Reversible path: restore source writes and return to `SteadyState`.
    async fn abort(
        &self,
        machine: &StageMachine,
        ctx: &mut MigrationContext,
        pair: &PairEndpoints,
        phase: CutoverPhase,
        reason: String,
    ) -> MigratorError {
        warn!(pair = %ctx.pair_id, phase = %phase, "Aborting cutover: {}", reason);
        let grants = ctx
            .cutover
            .as_ref()
            .map(|state| state.source_grants.clone())
            .unwrap_or_default();
        if let Err(err) = pair.source.grant_writes(&grants).await {
            let failure = MigratorError::precondition(
                ctx.stage,
                format!(
                    "cutover aborted at {} ({}) but source writes could not be restored: {}",
                    phase, reason, err
                ),
            );
            return machine.record_failure(ctx, failure).await;
        }

        let aborted = MigratorError::CutoverAborted { phase, reason };
        let record = FailureRecord {
            stage: ctx.stage,
            message: aborted.to_string(),
            at: Utc::now(),
        };
        let cutover = ctx.cutover.take();
        if let Err(err) = machine.commit_with(ctx, Stage::SteadyState, Some(record)).await {
            ctx.cutover = cutover;
            error!(pair = %ctx.pair_id, "Source writes restored but abort was not persisted: {}", err);
            return err;
        }
        aborted
    }

    /// Past the point of no return: record the failure and stop.
    async fn irreversible(
        &self,
        machine: &StageMachine,
        ctx: &mut MigrationContext,
        phase: CutoverPhase,
        cause: MigratorError,
    ) -> MigratorError {
        error!(pair = %ctx.pair_id, phase = %phase, "Irreversible cutover step failed: {}", cause);
        let err = MigratorError::IrreversibleStageFailure {
            phase,
            diagnostic: cause.to_string(),
        };
        machine.record_failure(ctx, err).await
    }
}

// ABOUTME: Stage state machine - drives a migration context forward one stage at a time
// ABOUTME: Every transition checks its precondition, performs idempotent side effects and persists

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::{CutoverPhase, CutoverState, FailureRecord, MigrationContext, Stage, SyncState};
use crate::error::{MigratorError, Result};
use crate::replication::{
    ObjectNames, PairEndpoints, ReplicationCatalog, ReplicationEndpoint, ReplicationSetManager,
};
use crate::schema::{sync_schema, SchemaCopier};
use crate::store::ContextStore;

/// Result of one `advance` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Transitioned { from: Stage, to: Stage },
    /// The context was already at or past the requested stage; nothing was done.
    AlreadyAt(Stage),
    /// The precondition is not met yet but may become true without operator action.
    Waiting { stage: Stage, reason: String },
}

enum Step {
    Done,
    Waiting(String),
}

pub struct StageMachine {
    store: ContextStore,
    sets: ReplicationSetManager,
    copier: Arc<dyn SchemaCopier>,
    lag_freshness: chrono::Duration,
    max_lag_bytes: u64,
}

impl StageMachine {
    pub fn new(
        store: ContextStore,
        sets: ReplicationSetManager,
        copier: Arc<dyn SchemaCopier>,
        lag_freshness: chrono::Duration,
        max_lag_bytes: u64,
    ) -> Self {
        Self {
            store,
            sets,
            copier,
            lag_freshness,
            max_lag_bytes,
        }
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    pub fn sets(&self) -> &ReplicationSetManager {
        &self.sets
    }

    /// Attempt the single forward transition out of the current stage.
    pub async fn advance(
        &self,
        ctx: &mut MigrationContext,
        pair: &PairEndpoints,
        cancel: &CancellationToken,
    ) -> Result<Advance> {
        match ctx.stage.next() {
            Some(next) => self.advance_to(ctx, pair, next, cancel).await,
            None => Ok(Advance::AlreadyAt(ctx.stage)),
        }
    }

    /// Move to `target`, which must be the successor of the current stage.
    /// A context already at or past `target` is left untouched.
    pub async fn advance_to(
        &self,
        ctx: &mut MigrationContext,
        pair: &PairEndpoints,
        target: Stage,
        cancel: &CancellationToken,
    ) -> Result<Advance> {
        if ctx.stage == Stage::Failed {
            let detail = ctx
                .last_error
                .as_ref()
                .map(|e| format!(" at {}: {}", e.stage, e.message))
                .unwrap_or_default();
            return Err(MigratorError::Validation(format!(
                "migration {} failed{}; reset it before advancing",
                ctx.pair_id, detail
            )));
        }
        if target == Stage::Failed || target.is_cutover() || target == Stage::TornDown {
            if ctx.stage >= target && target != Stage::Failed {
                return Ok(Advance::AlreadyAt(ctx.stage));
            }
            return Err(MigratorError::Validation(format!(
                "{} is reached through the cutover command, not advance",
                target
            )));
        }
        if ctx.stage >= target {
            return Ok(Advance::AlreadyAt(ctx.stage));
        }
        if ctx.stage.next() != Some(target) {
            return Err(MigratorError::Validation(format!(
                "cannot advance {} from {} to {}; stages cannot be skipped",
                ctx.pair_id, ctx.stage, target
            )));
        }
        if ctx.paused {
            return Ok(Advance::Waiting {
                stage: ctx.stage,
                reason: "migration is paused".into(),
            });
        }

        let from = ctx.stage;
        let step = match target {
            Stage::SchemaSynced => sync_schema(ctx, pair, self.copier.as_ref())
                .await
                .map(|_| Step::Done),
            Stage::NodesProvisioned => self.provision_nodes(ctx, pair).await,
            Stage::SetPopulating => self.create_set(ctx, pair).await,
            Stage::InitialSyncing => self.populate(ctx, pair, cancel).await,
            Stage::SteadyState => self.check_synchronized(ctx).await,
            other => Err(MigratorError::Validation(format!(
                "no transition into {}",
                other
            ))),
        };

        match step {
            Ok(Step::Done) => {
                self.commit(ctx, target).await?;
                Ok(Advance::Transitioned { from, to: target })
            }
            Ok(Step::Waiting(reason)) => Ok(Advance::Waiting {
                stage: from,
                reason,
            }),
            Err(err) => Err(self.record_failure(ctx, err).await),
        }
    }

    /// The only path that changes a persisted stage outside of reset.
    pub async fn commit(&self, ctx: &mut MigrationContext, to: Stage) -> Result<()> {
        self.commit_with(ctx, to, None).await
    }

    /// Transition and replace `last_error` with `error` in the same write.
    pub async fn commit_with(
        &self,
        ctx: &mut MigrationContext,
        to: Stage,
        error: Option<FailureRecord>,
    ) -> Result<()> {
        if !ctx.stage.can_transition_to(to) {
            return Err(MigratorError::Validation(format!(
                "illegal transition {} -> {} for {}",
                ctx.stage, to, ctx.pair_id
            )));
        }
        let from = ctx.stage;
        let previous_error = std::mem::replace(&mut ctx.last_error, error);
        ctx.stage = to;
        if let Err(err) = self.store.persist(ctx).await {
            ctx.stage = from;
            ctx.last_error = previous_error;
            return Err(err);
        }
        info!(pair = %ctx.pair_id, from = %from, to = %to, revision = ctx.revision, "Stage transition");
        Ok(())
    }

    /// Persist `err` against the context. Fatal errors move it to `Failed`;
    /// anything else leaves the stage alone so a retry resumes.
    pub async fn record_failure(&self, ctx: &mut MigrationContext, err: MigratorError) -> MigratorError {
        if err == MigratorError::Cancelled {
            return err;
        }
        let record = FailureRecord {
            stage: ctx.stage,
            message: err.to_string(),
            at: Utc::now(),
        };
        let fatal = err.is_fatal() && ctx.stage.can_transition_to(Stage::Failed);
        let previous = (ctx.stage, ctx.last_error.clone());
        ctx.last_error = Some(record);
        if fatal {
            ctx.stage = Stage::Failed;
        }

        match self.store.persist(ctx).await {
            Ok(()) if fatal => {
                warn!(pair = %ctx.pair_id, stage = %previous.0, "Migration failed: {}", err)
            }
            Ok(()) => warn!(pair = %ctx.pair_id, stage = %ctx.stage, "Transition attempt failed: {}", err),
            Err(persist_err) => {
                warn!(pair = %ctx.pair_id, "Could not record failure ({}): {}", persist_err, err);
                ctx.stage = previous.0;
                ctx.last_error = previous.1;
            }
        }
        err
    }

    async fn provision_nodes(&self, ctx: &MigrationContext, pair: &PairEndpoints) -> Result<Step> {
        let names = ObjectNames::for_pair(&ctx.pair_id);
        let ends: [(&Arc<dyn ReplicationEndpoint>, &str, &crate::config::Dsn); 2] = [
            (&pair.source, names.provider_node.as_str(), &ctx.provider_dsn),
            (&pair.target, names.subscriber_node.as_str(), &ctx.target_dsn),
        ];
        for (endpoint, node, dsn) in ends {
            endpoint.ensure_extension().await?;
            if endpoint.node_exists(node).await? {
                info!(pair = %ctx.pair_id, node, "Node already exists");
            } else {
                info!(pair = %ctx.pair_id, node, "Creating node");
                endpoint.create_node(node, dsn).await?;
            }
        }
        Ok(Step::Done)
    }

    async fn create_set(&self, ctx: &MigrationContext, pair: &PairEndpoints) -> Result<Step> {
        let names = ObjectNames::for_pair(&ctx.pair_id);
        if !pair.source.replication_set_exists(&names.set).await? {
            info!(pair = %ctx.pair_id, set = %names.set, "Creating replication set");
            pair.source.create_replication_set(&names.set).await?;
        }
        Ok(Step::Done)
    }

    /// Add every tracked object in bounded batches, persisting after each batch,
    /// then subscribe the target. Cancellation is honoured between batches.
    async fn populate(
        &self,
        ctx: &mut MigrationContext,
        pair: &PairEndpoints,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        loop {
            let batch = self.sets.next_table_batch(ctx);
            if batch.is_empty() {
                break;
            }
            if cancel.is_cancelled() {
                return Err(MigratorError::Cancelled);
            }
            match self.sets.add_tables(ctx, pair.source.as_ref(), &batch).await {
                Ok(members) => {
                    ctx.set_tables = members;
                    self.store.persist(ctx).await?;
                }
                Err(MigratorError::PartialBatchFailure {
                    completed,
                    remaining,
                    cause,
                }) => {
                    ctx.set_tables = completed.iter().cloned().collect();
                    self.store.persist(ctx).await?;
                    return Err(MigratorError::PartialBatchFailure {
                        completed,
                        remaining,
                        cause,
                    });
                }
                Err(err) => return Err(err),
            }
        }

        loop {
            let batch = self.sets.next_sequence_batch(ctx);
            if batch.is_empty() {
                break;
            }
            if cancel.is_cancelled() {
                return Err(MigratorError::Cancelled);
            }
            match self.sets.add_sequences(ctx, pair.source.as_ref(), &batch).await {
                Ok(members) => {
                    ctx.set_sequences = members;
                    self.store.persist(ctx).await?;
                }
                Err(MigratorError::PartialBatchFailure {
                    completed,
                    remaining,
                    cause,
                }) => {
                    ctx.set_sequences = completed.iter().cloned().collect();
                    self.store.persist(ctx).await?;
                    return Err(MigratorError::PartialBatchFailure {
                        completed,
                        remaining,
                        cause,
                    });
                }
                Err(err) => return Err(err),
            }
        }

        let names = ObjectNames::for_pair(&ctx.pair_id);
        let members = pair.source.set_tables(&names.set).await?;
        let missing: Vec<&String> = ctx.tables.difference(&members).collect();
        if !missing.is_empty() {
            return Ok(Step::Waiting(format!(
                "tables {:?} not yet visible in replication set",
                missing
            )));
        }

        if cancel.is_cancelled() {
            return Err(MigratorError::Cancelled);
        }
        if !pair.target.subscription_exists(&names.subscription).await? {
            info!(pair = %ctx.pair_id, subscription = %names.subscription, "Creating subscription");
            pair.target
                .create_subscription(&names.subscription, &ctx.provider_dsn, &names.set)
                .await?;
        }
        Ok(Step::Done)
    }

    async fn check_synchronized(&self, ctx: &MigrationContext) -> Result<Step> {
        let Some(report) = self.store.load_report(&ctx.pair_id).await? else {
            return Ok(Step::Waiting("no status report yet".into()));
        };
        if report.subscription_down {
            return Err(MigratorError::precondition(
                ctx.stage,
                "subscription is down",
            ));
        }
        let errored: Vec<String> = report
            .tables_in(SyncState::Error)
            .into_iter()
            .filter(|t| ctx.tables.contains(t))
            .collect();
        if !errored.is_empty() {
            return Err(MigratorError::precondition(
                ctx.stage,
                format!("tables in error state: {:?}", errored),
            ));
        }
        if !report.all_synchronized(&ctx.tables) {
            let waiting = ctx
                .tables
                .iter()
                .filter(|t| {
                    report
                        .tables
                        .get(*t)
                        .map(|s| s.state != SyncState::Synchronized)
                        .unwrap_or(true)
                })
                .count();
            return Ok(Step::Waiting(format!(
                "{} of {} tables not yet synchronized",
                waiting,
                ctx.tables.len()
            )));
        }
        let Some(lag) = &report.lag else {
            return Ok(Step::Waiting("no lag snapshot yet".into()));
        };
        if !lag.is_fresh(Utc::now(), self.lag_freshness) {
            return Ok(Step::Waiting("lag snapshot is stale".into()));
        }
        if lag.wal_lag_bytes() > self.max_lag_bytes {
            return Ok(Step::Waiting(format!(
                "replication lag {} bytes exceeds limit of {} bytes",
                lag.wal_lag_bytes(),
                self.max_lag_bytes
            )));
        }
        Ok(Step::Done)
    }

    /// Operator reset of a failed context.
    ///
    /// Past the point of no return the cutover phase is kept and marked for a
    /// one-time resume. Otherwise any write freeze is lifted and the stage is
    /// re-derived from what actually exists on the endpoints.
    pub async fn reset(&self, ctx: &mut MigrationContext, pair: &PairEndpoints) -> Result<Stage> {
        if ctx.stage != Stage::Failed {
            return Err(MigratorError::Validation(format!(
                "only failed migrations can be reset; {} is {}",
                ctx.pair_id, ctx.stage
            )));
        }

        let stage = match ctx.cutover.clone() {
            Some(state) if state.phase.is_past_point_of_no_return() => {
                let stage = match state.phase {
                    CutoverPhase::TeardownSource { .. } => Stage::CutoverComplete,
                    _ => Stage::CutoverInProgress,
                };
                ctx.cutover = Some(CutoverState {
                    operator_resumed: true,
                    ..state
                });
                stage
            }
            frozen => {
                if let Some(state) = frozen {
                    pair.source.grant_writes(&state.source_grants).await?;
                    ctx.cutover = None;
                }
                self.derive_stage(ctx, pair).await?
            }
        };

        ctx.stage = stage;
        ctx.last_error = None;
        self.store.persist(ctx).await?;
        info!(pair = %ctx.pair_id, stage = %stage, "Migration reset");
        Ok(stage)
    }

    async fn derive_stage(&self, ctx: &mut MigrationContext, pair: &PairEndpoints) -> Result<Stage> {
        let names = ObjectNames::for_pair(&ctx.pair_id);
        let source_ext = pair.source.extension_installed().await?;
        let target_ext = pair.target.extension_installed().await?;

        let set_exists = source_ext && pair.source.replication_set_exists(&names.set).await?;
        if set_exists {
            let tables = pair.source.set_tables(&names.set).await?;
            let sequences = pair.source.set_sequences(&names.set).await?;
            ctx.set_tables = tables.intersection(&ctx.tables).cloned().collect();
            ctx.set_sequences = sequences.intersection(&ctx.sequences).cloned().collect();
        } else {
            ctx.set_tables.clear();
            ctx.set_sequences.clear();
        }

        let subscribed = target_ext && pair.target.subscription_exists(&names.subscription).await?;
        let provider = source_ext && pair.source.node_exists(&names.provider_node).await?;
        let subscriber = target_ext && pair.target.node_exists(&names.subscriber_node).await?;

        Ok(if set_exists && subscribed && ctx.is_fully_populated() {
            Stage::InitialSyncing
        } else if set_exists {
            Stage::SetPopulating
        } else if provider && subscriber {
            Stage::NodesProvisioned
        } else if provider || subscriber {
            Stage::SchemaSynced
        } else {
            Stage::Uninitialized
        })
    }

    /// Remove replication objects for a failed context that never flipped traffic.
    pub async fn rollback(&self, ctx: &mut MigrationContext, pair: &PairEndpoints) -> Result<()> {
        if ctx.stage != Stage::Failed {
            return Err(MigratorError::Validation(format!(
                "only failed migrations can be rolled back; {} is {}",
                ctx.pair_id, ctx.stage
            )));
        }
        if let Some(state) = &ctx.cutover {
            if state.phase.is_past_point_of_no_return() {
                return Err(MigratorError::Validation(format!(
                    "traffic for {} was already redirected ({}); reset and resume instead",
                    ctx.pair_id, state.phase
                )));
            }
            pair.source.grant_writes(&state.source_grants).await?;
            ctx.cutover = None;
        }

        self.sets.remove_objects(ctx, pair).await?;
        ctx.set_tables.clear();
        ctx.set_sequences.clear();
        self.store.persist(ctx).await?;
        info!(pair = %ctx.pair_id, "Replication objects removed");
        Ok(())
    }
}

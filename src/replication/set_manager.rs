// ABOUTME: Replication set manager: bounded, verified, add-if-absent set population
// ABOUTME: Also tears replication objects down on both ends of a pair

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{ObjectNames, PairEndpoints, ReplicationCatalog, ReplicationEndpoint};
use crate::context::MigrationContext;
use crate::error::{MigratorError, Result};
use crate::gateway::{with_backoff, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    Table,
    Sequence,
}

impl ObjectKind {
    fn label(self) -> &'static str {
        match self {
            ObjectKind::Table => "tables",
            ObjectKind::Sequence => "sequences",
        }
    }

    fn tracked(self, ctx: &MigrationContext) -> &BTreeSet<String> {
        match self {
            ObjectKind::Table => &ctx.tables,
            ObjectKind::Sequence => &ctx.sequences,
        }
    }

    async fn members(self, source: &dyn ReplicationEndpoint, set: &str) -> Result<BTreeSet<String>> {
        match self {
            ObjectKind::Table => source.set_tables(set).await,
            ObjectKind::Sequence => source.set_sequences(set).await,
        }
    }

    async fn add(self, source: &dyn ReplicationEndpoint, set: &str, name: &str) -> Result<()> {
        match self {
            ObjectKind::Table => source.add_table_to_set(set, name).await,
            ObjectKind::Sequence => source.add_sequence_to_set(set, name).await,
        }
    }

    async fn remove(self, source: &dyn ReplicationEndpoint, set: &str, name: &str) -> Result<()> {
        match self {
            ObjectKind::Table => source.remove_table_from_set(set, name).await,
            ObjectKind::Sequence => source.remove_sequence_from_set(set, name).await,
        }
    }
}

pub struct ReplicationSetManager {
    batch_size: usize,
    retry: RetryPolicy,
    /// Re-reads of the catalog while waiting for freshly added members to become visible.
    verify: RetryPolicy,
}

impl ReplicationSetManager {
    pub fn new(batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            batch_size: batch_size.max(1),
            retry,
            verify: RetryPolicy {
                max_attempts: 5,
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(2),
            },
        }
    }

    pub fn with_verify_policy(mut self, verify: RetryPolicy) -> Self {
        self.verify = verify;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn next_table_batch(&self, ctx: &MigrationContext) -> Vec<String> {
        ctx.pending_tables().into_iter().take(self.batch_size).collect()
    }

    pub fn next_sequence_batch(&self, ctx: &MigrationContext) -> Vec<String> {
        ctx.pending_sequences()
            .into_iter()
            .take(self.batch_size)
            .collect()
    }

    /// Add one batch of tables. Returns the verified tracked membership of the set.
    pub async fn add_tables(
        &self,
        ctx: &MigrationContext,
        source: &dyn ReplicationEndpoint,
        batch: &[String],
    ) -> Result<BTreeSet<String>> {
        self.add_batch(ObjectKind::Table, ctx, source, batch).await
    }

    /// Add one batch of sequences. Returns the verified tracked membership of the set.
    pub async fn add_sequences(
        &self,
        ctx: &MigrationContext,
        source: &dyn ReplicationEndpoint,
        batch: &[String],
    ) -> Result<BTreeSet<String>> {
        self.add_batch(ObjectKind::Sequence, ctx, source, batch).await
    }

    async fn add_batch(
        &self,
        kind: ObjectKind,
        ctx: &MigrationContext,
        source: &dyn ReplicationEndpoint,
        batch: &[String],
    ) -> Result<BTreeSet<String>> {
        let names = ObjectNames::for_pair(&ctx.pair_id);
        let tracked = kind.tracked(ctx);

        if batch.len() > self.batch_size {
            return Err(MigratorError::Validation(format!(
                "batch of {} {} exceeds limit of {}",
                batch.len(),
                kind.label(),
                self.batch_size
            )));
        }
        let untracked: Vec<&String> = batch.iter().filter(|o| !tracked.contains(*o)).collect();
        if !untracked.is_empty() {
            return Err(MigratorError::precondition(
                ctx.stage,
                format!("refusing to add untracked {} {:?}", kind.label(), untracked),
            ));
        }

        let applied = with_backoff(&self.retry, "replication set batch", || async {
            let members = kind.members(source, &names.set).await?;
            ensure_subset(ctx, kind, &members)?;
            for object in batch {
                if members.contains(object) {
                    debug!(pair = %ctx.pair_id, object = %object, "Already a member, skipping");
                    continue;
                }
                kind.add(source, &names.set, object).await?;
            }
            Ok(())
        })
        .await;

        let verified = match applied {
            Ok(()) => self.verify_members(kind, ctx, source, &names.set, batch).await,
            Err(err) => Err(err),
        };

        match verified {
            Ok(members) => {
                info!(
                    pair = %ctx.pair_id,
                    kind = kind.label(),
                    batch = batch.len(),
                    members = members.len(),
                    tracked = tracked.len(),
                    "Replication set batch applied"
                );
                Ok(members)
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => Err(self.partial_failure(kind, ctx, source, &names.set, err).await),
        }
    }

    /// Membership is only trusted once the catalog shows it; control functions can
    /// return before the metadata is visible.
    async fn verify_members(
        &self,
        kind: ObjectKind,
        ctx: &MigrationContext,
        source: &dyn ReplicationEndpoint,
        set: &str,
        batch: &[String],
    ) -> Result<BTreeSet<String>> {
        with_backoff(&self.verify, "replication set verification", || async {
            let members = kind.members(source, set).await?;
            let missing: Vec<&String> = batch.iter().filter(|o| !members.contains(*o)).collect();
            if missing.is_empty() {
                Ok(tracked_members(ctx, kind, &members))
            } else {
                Err(MigratorError::Timeout(format!(
                    "{} {:?} not yet visible in set {}",
                    kind.label(),
                    missing,
                    set
                )))
            }
        })
        .await
    }

    async fn partial_failure(
        &self,
        kind: ObjectKind,
        ctx: &MigrationContext,
        source: &dyn ReplicationEndpoint,
        set: &str,
        cause: MigratorError,
    ) -> MigratorError {
        let confirmed = match kind.members(source, set).await {
            Ok(members) => tracked_members(ctx, kind, &members),
            Err(err) => {
                warn!(pair = %ctx.pair_id, "Could not re-read set membership: {}", err);
                match kind {
                    ObjectKind::Table => ctx.set_tables.clone(),
                    ObjectKind::Sequence => ctx.set_sequences.clone(),
                }
            }
        };
        let remaining = kind
            .tracked(ctx)
            .difference(&confirmed)
            .cloned()
            .collect();
        MigratorError::PartialBatchFailure {
            completed: confirmed.into_iter().collect(),
            remaining,
            cause: cause.to_string(),
        }
    }

    /// Remove every replication object this pair created, in dependency order.
    /// Each step checks the catalog first so a repeated call is harmless.
    pub async fn remove_objects(&self, ctx: &MigrationContext, pair: &PairEndpoints) -> Result<()> {
        let names = ObjectNames::for_pair(&ctx.pair_id);

        if pair.target.extension_installed().await? {
            if pair.target.subscription_exists(&names.subscription).await? {
                info!(pair = %ctx.pair_id, subscription = %names.subscription, "Dropping subscription");
                pair.target.drop_subscription(&names.subscription).await?;
            }
            if pair.target.node_exists(&names.subscriber_node).await? {
                pair.target.drop_node(&names.subscriber_node).await?;
            }
        }

        if pair.source.extension_installed().await? {
            if pair.source.replication_set_exists(&names.set).await? {
                for kind in [ObjectKind::Table, ObjectKind::Sequence] {
                    let members = kind.members(pair.source.as_ref(), &names.set).await?;
                    for object in members.intersection(kind.tracked(ctx)) {
                        kind.remove(pair.source.as_ref(), &names.set, object).await?;
                    }
                }
                info!(pair = %ctx.pair_id, set = %names.set, "Dropping replication set");
                pair.source.drop_replication_set(&names.set).await?;
            }
            if pair.source.node_exists(&names.provider_node).await? {
                pair.source.drop_node(&names.provider_node).await?;
            }
        }
        Ok(())
    }
}

fn tracked_members(
    ctx: &MigrationContext,
    kind: ObjectKind,
    members: &BTreeSet<String>,
) -> BTreeSet<String> {
    members.intersection(kind.tracked(ctx)).cloned().collect()
}

fn ensure_subset(ctx: &MigrationContext, kind: ObjectKind, members: &BTreeSet<String>) -> Result<()> {
    let foreign: Vec<&String> = members.difference(kind.tracked(ctx)).collect();
    if foreign.is_empty() {
        Ok(())
    } else {
        Err(MigratorError::precondition(
            ctx.stage,
            format!(
                "replication set contains untracked {} {:?}",
                kind.label(),
                foreign
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Dsn;
    use crate::context::{ContextOptions, Stage};
    use crate::replication::{InMemoryEndpoint, ReplicationEndpoint};
    use chrono::Utc;

    fn context(tables: &[&str]) -> MigrationContext {
        MigrationContext {
            pair_id: "dc/app".into(),
            source_dsn: Dsn::new("src"),
            target_dsn: Dsn::new("dst"),
            provider_dsn: Dsn::new("src"),
            stage: Stage::SetPopulating,
            tables: tables.iter().map(|t| t.to_string()).collect(),
            sequences: BTreeSet::new(),
            set_tables: BTreeSet::new(),
            set_sequences: BTreeSet::new(),
            frozen_roles: vec![],
            options: ContextOptions::default(),
            cutover: None,
            paused: false,
            last_error: None,
            fingerprint: String::new(),
            revision: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn set_name() -> String {
        ObjectNames::for_pair("dc/app").set
    }

    async fn source_with(tables: &[&str]) -> InMemoryEndpoint {
        let mut endpoint = InMemoryEndpoint::new();
        for t in tables {
            endpoint = endpoint.with_table(t, 10);
        }
        endpoint.ensure_extension().await.unwrap();
        endpoint.create_replication_set(&set_name()).await.unwrap();
        endpoint
    }

    fn manager(batch: usize) -> ReplicationSetManager {
        ReplicationSetManager::new(batch, RetryPolicy::none()).with_verify_policy(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        })
    }

    #[tokio::test]
    async fn test_batches_are_bounded_and_in_order() {
        let ctx = context(&["public.t1", "public.t2", "public.t3"]);
        let m = manager(2);
        assert_eq!(m.next_table_batch(&ctx), vec!["public.t1", "public.t2"]);

        let oversized: Vec<String> = ctx.tables.iter().cloned().collect();
        let source = source_with(&["public.t1", "public.t2", "public.t3"]).await;
        let err = m.add_tables(&ctx, &source, &oversized).await.unwrap_err();
        assert!(matches!(err, MigratorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_add_if_absent() {
        let ctx = context(&["public.t1", "public.t2"]);
        let source = source_with(&["public.t1", "public.t2"]).await;
        source.add_table_to_set(&set_name(), "public.t1").await.unwrap();

        let members = manager(2)
            .add_tables(&ctx, &source, &["public.t1".into(), "public.t2".into()])
            .await
            .unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(source.call_count("add_table:public.t1"), 1);
        assert_eq!(source.call_count("add_table:public.t2"), 1);
    }

    #[tokio::test]
    async fn test_membership_verified_after_visibility_lag() {
        let ctx = context(&["public.t1"]);
        let source = source_with(&["public.t1"]).await;
        // First read (before the add) and first verification read hide the member.
        source.state().invisible_reads = 2;

        let members = manager(1)
            .add_tables(&ctx, &source, &["public.t1".into()])
            .await
            .unwrap();
        assert!(members.contains("public.t1"));
        assert_eq!(source.call_count("add_table:public.t1"), 1);
    }

    #[tokio::test]
    async fn test_failure_reports_partial_progress() {
        let ctx = context(&["public.t1", "public.t2"]);
        let source = source_with(&["public.t1", "public.t2"]).await;
        source.fail_next(
            "add_table:public.t2",
            MigratorError::Connection("lock timeout".into()),
        );

        let err = manager(2)
            .add_tables(&ctx, &source, &["public.t1".into(), "public.t2".into()])
            .await
            .unwrap_err();
        match err {
            MigratorError::PartialBatchFailure {
                completed,
                remaining,
                ..
            } => {
                assert_eq!(completed, vec!["public.t1"]);
                assert_eq!(remaining, vec!["public.t2"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_untracked_member_is_precondition_violation() {
        let ctx = context(&["public.t1"]);
        let source = source_with(&["public.t1", "public.rogue"]).await;
        source.add_table_to_set(&set_name(), "public.rogue").await.unwrap();

        let err = manager(1)
            .add_tables(&ctx, &source, &["public.t1".into()])
            .await
            .unwrap_err();
        assert!(err.is_fatal(), "{:?}", err);
        assert_eq!(source.call_count("add_table:public.t1"), 0);
    }
}

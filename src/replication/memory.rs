// ABOUTME: In-memory replication endpoint for tests - no database required
// ABOUTME: Mimics pglogical catalog semantics and supports scripted failures per operation

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    Column, EndpointFactory, RemoteTableState, ReplicationCatalog, ReplicationEndpoint,
    SubscriptionStatus,
};
use crate::config::Dsn;
use crate::context::{VerificationToken, WriteGrants, WRITE_PRIVILEGES};
use crate::error::{MigratorError, Result};
use crate::lsn::Lsn;

#[derive(Debug, Clone, Default)]
pub struct TableState {
    pub columns: Vec<Column>,
    pub has_pk: bool,
    pub rows: i64,
    pub checksum: String,
    pub changes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SetState {
    pub tables: BTreeSet<String>,
    pub sequences: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionState {
    pub provider: Dsn,
    pub set: String,
    pub status: SubscriptionStatus,
}

#[derive(Debug, Default)]
pub struct InMemoryState {
    pub extension: bool,
    pub nodes: BTreeMap<String, Dsn>,
    pub sets: BTreeMap<String, SetState>,
    pub subscriptions: BTreeMap<String, SubscriptionState>,
    pub tables: BTreeMap<String, TableState>,
    pub sequences: BTreeMap<String, Option<i64>>,
    pub wal_lsn: Lsn,
    pub applied_lsn: Option<Lsn>,
    pub replay_lag_secs: Option<f64>,
    pub sync_states: BTreeMap<String, RemoteTableState>,
    /// Write privileges per (table, role).
    pub grants: BTreeMap<(String, String), BTreeSet<String>>,
    /// Number of membership reads that still hide freshly added objects.
    pub invisible_reads: u32,
    pub failures: HashMap<String, VecDeque<MigratorError>>,
    pub calls: Vec<String>,
}

/// In-memory endpoint. Test-only; do not use against real migrations.
#[derive(Debug, Default)]
pub struct InMemoryEndpoint {
    state: Mutex<InMemoryState>,
}

impl InMemoryEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a table with a primary key and one `id bigint` column.
    pub fn with_table(self, name: &str, rows: i64) -> Self {
        self.state().tables.insert(
            name.to_string(),
            TableState {
                columns: vec![Column::new("id", "bigint")],
                has_pk: true,
                rows,
                checksum: format!("md5-{}-{}", name, rows),
                changes: 0,
            },
        );
        self
    }

    pub fn with_grant(self, table: &str, role: &str, privileges: &[&str]) -> Self {
        self.state()
            .grants
            .entry((table.to_string(), role.to_string()))
            .or_default()
            .extend(privileges.iter().map(|p| p.to_string()));
        self
    }

    /// Write privileges `role` currently holds on `table`.
    pub fn privileges(&self, table: &str, role: &str) -> BTreeSet<String> {
        self.state()
            .grants
            .get(&(table.to_string(), role.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Rows committed by an application: row count, checksum and change counter all move.
    pub fn insert_rows(&self, table: &str, rows: i64) {
        if let Some(t) = self.state().tables.get_mut(table) {
            t.rows += rows;
            t.checksum = format!("md5-{}-{}", table, t.rows);
            t.changes += rows.max(0) as u64;
        }
    }

    pub fn with_sequence(self, name: &str, value: i64) -> Self {
        self.state().sequences.insert(name.to_string(), Some(value));
        self
    }

    /// Queue `err` to be returned by the next call of `operation` (e.g. `add_table:public.t3`).
    pub fn fail_next(&self, operation: &str, err: MigratorError) {
        self.state()
            .failures
            .entry(operation.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == operation).count()
    }

    pub fn set_sync_state(&self, tables: &[&str], state: RemoteTableState) {
        let mut guard = self.state();
        for table in tables {
            guard.sync_states.insert(table.to_string(), state);
        }
    }

    pub fn add_changes(&self, table: &str, changes: u64) {
        if let Some(t) = self.state().tables.get_mut(table) {
            t.changes += changes;
        }
    }

    fn enter(&self, operation: String) -> Result<MutexGuard<'_, InMemoryState>> {
        let mut guard = self.state();
        guard.calls.push(operation.clone());
        if let Some(err) = guard
            .failures
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }
        Ok(guard)
    }

    fn membership_read(guard: &mut InMemoryState) -> bool {
        if guard.invisible_reads > 0 {
            guard.invisible_reads -= 1;
            false
        } else {
            true
        }
    }
}

#[async_trait]
impl ReplicationCatalog for InMemoryEndpoint {
    async fn extension_installed(&self) -> Result<bool> {
        Ok(self.enter("extension_installed".into())?.extension)
    }

    async fn current_wal_lsn(&self) -> Result<Lsn> {
        Ok(self.enter("current_wal_lsn".into())?.wal_lsn)
    }

    async fn applied_lsn(&self, _subscription: &str) -> Result<Option<Lsn>> {
        Ok(self.enter("applied_lsn".into())?.applied_lsn)
    }

    async fn replay_lag_secs(&self, _subscription: &str) -> Result<Option<f64>> {
        Ok(self.enter("replay_lag_secs".into())?.replay_lag_secs)
    }

    async fn subscription_status(&self, subscription: &str) -> Result<Option<SubscriptionStatus>> {
        let guard = self.enter("subscription_status".into())?;
        Ok(guard
            .subscriptions
            .get(subscription)
            .map(|s| s.status.clone()))
    }

    async fn table_sync_states(
        &self,
        _subscription: &str,
    ) -> Result<BTreeMap<String, RemoteTableState>> {
        Ok(self.enter("table_sync_states".into())?.sync_states.clone())
    }

    async fn change_counters(&self, tables: &[String]) -> Result<BTreeMap<String, u64>> {
        let guard = self.enter("change_counters".into())?;
        Ok(tables
            .iter()
            .filter_map(|t| guard.tables.get(t).map(|s| (t.clone(), s.changes)))
            .collect())
    }

    async fn node_exists(&self, node: &str) -> Result<bool> {
        Ok(self.enter("node_exists".into())?.nodes.contains_key(node))
    }

    async fn replication_set_exists(&self, set: &str) -> Result<bool> {
        Ok(self.enter("replication_set_exists".into())?.sets.contains_key(set))
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool> {
        Ok(self
            .enter("subscription_exists".into())?
            .subscriptions
            .contains_key(subscription))
    }

    async fn set_tables(&self, set: &str) -> Result<BTreeSet<String>> {
        let mut guard = self.enter("set_tables".into())?;
        if !Self::membership_read(&mut guard) {
            return Ok(BTreeSet::new());
        }
        Ok(guard
            .sets
            .get(set)
            .map(|s| s.tables.clone())
            .unwrap_or_default())
    }

    async fn set_sequences(&self, set: &str) -> Result<BTreeSet<String>> {
        let mut guard = self.enter("set_sequences".into())?;
        if !Self::membership_read(&mut guard) {
            return Ok(BTreeSet::new());
        }
        Ok(guard
            .sets
            .get(set)
            .map(|s| s.sequences.clone())
            .unwrap_or_default())
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        let prefix = format!("{}.", schema);
        let guard = self.enter("list_tables".into())?;
        Ok(guard
            .tables
            .keys()
            .filter(|t| t.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn list_sequences(&self, schema: &str) -> Result<Vec<String>> {
        let prefix = format!("{}.", schema);
        let guard = self.enter("list_sequences".into())?;
        Ok(guard
            .sequences
            .keys()
            .filter(|s| s.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn table_columns(&self, tables: &[String]) -> Result<BTreeMap<String, Vec<Column>>> {
        let guard = self.enter("table_columns".into())?;
        Ok(tables
            .iter()
            .filter_map(|t| guard.tables.get(t).map(|s| (t.clone(), s.columns.clone())))
            .collect())
    }

    async fn tables_without_primary_key(&self, tables: &[String]) -> Result<Vec<String>> {
        let guard = self.enter("tables_without_primary_key".into())?;
        Ok(tables
            .iter()
            .filter(|t| guard.tables.get(*t).map(|s| !s.has_pk).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn sequence_values(&self, sequences: &[String]) -> Result<BTreeMap<String, i64>> {
        let guard = self.enter("sequence_values".into())?;
        Ok(sequences
            .iter()
            .filter_map(|s| guard.sequences.get(s).copied().flatten().map(|v| (s.clone(), v)))
            .collect())
    }

    async fn verification_token(&self, table: &str, checksum: bool) -> Result<VerificationToken> {
        let guard = self.enter(format!("verification_token:{}", table))?;
        let state = guard
            .tables
            .get(table)
            .ok_or_else(|| MigratorError::Connection(format!("relation {} does not exist", table)))?;
        Ok(VerificationToken {
            row_count: state.rows,
            checksum: checksum.then(|| state.checksum.clone()),
        })
    }

    async fn write_grants(&self, tables: &[String], roles: &[String]) -> Result<WriteGrants> {
        let guard = self.enter("write_grants".into())?;
        let mut grants = WriteGrants::new();
        for table in tables {
            for role in roles {
                let held: BTreeSet<String> = guard
                    .grants
                    .get(&(table.clone(), role.clone()))
                    .map(|set| {
                        set.iter()
                            .filter(|p| WRITE_PRIVILEGES.contains(&p.as_str()))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                if !held.is_empty() {
                    grants
                        .entry(table.clone())
                        .or_default()
                        .insert(role.clone(), held);
                }
            }
        }
        Ok(grants)
    }
}

#[async_trait]
impl ReplicationEndpoint for InMemoryEndpoint {
    async fn ensure_extension(&self) -> Result<()> {
        self.enter("ensure_extension".into())?.extension = true;
        Ok(())
    }

    async fn create_node(&self, node: &str, dsn: &Dsn) -> Result<()> {
        let mut guard = self.enter(format!("create_node:{}", node))?;
        if !guard.extension {
            return Err(MigratorError::Connection("schema \"pglogical\" does not exist".into()));
        }
        if guard.nodes.contains_key(node) {
            return Err(MigratorError::Connection(format!("node {} already exists", node)));
        }
        guard.nodes.insert(node.to_string(), dsn.clone());
        Ok(())
    }

    async fn create_replication_set(&self, set: &str) -> Result<()> {
        let mut guard = self.enter(format!("create_replication_set:{}", set))?;
        if guard.sets.contains_key(set) {
            return Err(MigratorError::Connection(format!("set {} already exists", set)));
        }
        guard.sets.insert(set.to_string(), SetState::default());
        Ok(())
    }

    async fn create_subscription(
        &self,
        subscription: &str,
        provider: &Dsn,
        set: &str,
    ) -> Result<()> {
        let mut guard = self.enter(format!("create_subscription:{}", subscription))?;
        if guard.subscriptions.contains_key(subscription) {
            return Err(MigratorError::Connection(format!(
                "subscription {} already exists",
                subscription
            )));
        }
        guard.subscriptions.insert(
            subscription.to_string(),
            SubscriptionState {
                provider: provider.clone(),
                set: set.to_string(),
                status: SubscriptionStatus::Initializing,
            },
        );
        Ok(())
    }

    async fn add_table_to_set(&self, set: &str, table: &str) -> Result<()> {
        let mut guard = self.enter(format!("add_table:{}", table))?;
        if !guard.tables.contains_key(table) {
            return Err(MigratorError::Connection(format!("relation {} does not exist", table)));
        }
        let set_state = guard
            .sets
            .get_mut(set)
            .ok_or_else(|| MigratorError::Connection(format!("set {} not found", set)))?;
        if !set_state.tables.insert(table.to_string()) {
            return Err(MigratorError::Connection(format!(
                "duplicate key value violates unique constraint (table {} already in set)",
                table
            )));
        }
        Ok(())
    }

    async fn add_sequence_to_set(&self, set: &str, sequence: &str) -> Result<()> {
        let mut guard = self.enter(format!("add_sequence:{}", sequence))?;
        let set_state = guard
            .sets
            .get_mut(set)
            .ok_or_else(|| MigratorError::Connection(format!("set {} not found", set)))?;
        if !set_state.sequences.insert(sequence.to_string()) {
            return Err(MigratorError::Connection(format!(
                "sequence {} already in set",
                sequence
            )));
        }
        Ok(())
    }

    async fn remove_table_from_set(&self, set: &str, table: &str) -> Result<()> {
        let mut guard = self.enter(format!("remove_table:{}", table))?;
        if let Some(s) = guard.sets.get_mut(set) {
            s.tables.remove(table);
        }
        Ok(())
    }

    async fn remove_sequence_from_set(&self, set: &str, sequence: &str) -> Result<()> {
        let mut guard = self.enter(format!("remove_sequence:{}", sequence))?;
        if let Some(s) = guard.sets.get_mut(set) {
            s.sequences.remove(sequence);
        }
        Ok(())
    }

    async fn drop_subscription(&self, subscription: &str) -> Result<()> {
        self.enter("drop_subscription".into())?
            .subscriptions
            .remove(subscription);
        Ok(())
    }

    async fn drop_replication_set(&self, set: &str) -> Result<()> {
        self.enter("drop_replication_set".into())?.sets.remove(set);
        Ok(())
    }

    async fn drop_node(&self, node: &str) -> Result<()> {
        self.enter(format!("drop_node:{}", node))?.nodes.remove(node);
        Ok(())
    }

    async fn revoke_writes(&self, tables: &[String], roles: &[String]) -> Result<()> {
        let mut guard = self.enter("revoke_writes".into())?;
        for table in tables {
            for role in roles {
                if let Some(held) = guard.grants.get_mut(&(table.clone(), role.clone())) {
                    held.retain(|p| !WRITE_PRIVILEGES.contains(&p.as_str()));
                }
            }
        }
        Ok(())
    }

    async fn grant_writes(&self, grants: &WriteGrants) -> Result<()> {
        let mut guard = self.enter("grant_writes".into())?;
        for (table, roles) in grants {
            for (role, privileges) in roles {
                guard
                    .grants
                    .entry((table.clone(), role.clone()))
                    .or_default()
                    .extend(privileges.iter().cloned());
            }
        }
        Ok(())
    }

    async fn set_sequence_values(&self, values: &BTreeMap<String, i64>) -> Result<()> {
        let mut guard = self.enter("set_sequence_values".into())?;
        for (sequence, value) in values {
            guard.sequences.insert(sequence.clone(), Some(*value));
        }
        Ok(())
    }
}

/// Hands out in-memory endpoints keyed by DSN, creating empty ones on first use.
#[derive(Default)]
pub struct InMemoryFactory {
    endpoints: Mutex<HashMap<String, Arc<InMemoryEndpoint>>>,
}

impl InMemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, dsn: &Dsn, endpoint: Arc<InMemoryEndpoint>) {
        self.endpoints
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(dsn.expose().to_string(), endpoint);
    }

    pub fn get(&self, dsn: &Dsn) -> Arc<InMemoryEndpoint> {
        self.endpoints
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(dsn.expose().to_string())
            .or_insert_with(|| Arc::new(InMemoryEndpoint::new()))
            .clone()
    }
}

impl EndpointFactory for InMemoryFactory {
    fn endpoint(&self, dsn: &Dsn) -> Arc<dyn ReplicationEndpoint> {
        self.get(dsn)
    }
}

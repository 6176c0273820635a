// ABOUTME: Boundary to the pglogical extension: read-only catalog and control-function traits
// ABOUTME: The orchestrator only observes and drives replication through these two surfaces

pub mod memory;
pub mod naming;
pub mod pglogical;
pub mod set_manager;

pub use memory::{InMemoryEndpoint, InMemoryFactory};
pub use naming::ObjectNames;
pub use pglogical::{PgEndpoint, PgEndpointFactory};
pub use set_manager::ReplicationSetManager;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Dsn;
use crate::context::{MigrationContext, VerificationToken, WriteGrants};
use crate::error::Result;
use crate::lsn::Lsn;

/// Per-table progress as the subscriber reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteTableState {
    /// Queued for initial copy.
    Pending,
    Copying,
    CatchingUp,
    Ready,
}

impl RemoteTableState {
    /// Map pglogical's `local_sync_status.sync_status` code.
    pub fn from_sync_code(code: &str) -> Self {
        match code {
            "r" => RemoteTableState::Ready,
            "u" => RemoteTableState::CatchingUp,
            "s" | "d" | "c" | "w" => RemoteTableState::Copying,
            _ => RemoteTableState::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Initializing,
    Replicating,
    Down,
    Other(String),
}

impl SubscriptionStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "initializing" => SubscriptionStatus::Initializing,
            "replicating" => SubscriptionStatus::Replicating,
            "down" => SubscriptionStatus::Down,
            other => SubscriptionStatus::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Read-only view of an endpoint. The status monitor only ever holds this.
#[async_trait]
pub trait ReplicationCatalog: Send + Sync {
    async fn extension_installed(&self) -> Result<bool>;
    async fn current_wal_lsn(&self) -> Result<Lsn>;
    /// Source position the subscription has applied up to (target side).
    async fn applied_lsn(&self, subscription: &str) -> Result<Option<Lsn>>;
    /// Walsender replay lag for the subscription (source side).
    async fn replay_lag_secs(&self, subscription: &str) -> Result<Option<f64>>;
    async fn subscription_status(&self, subscription: &str) -> Result<Option<SubscriptionStatus>>;
    async fn table_sync_states(
        &self,
        subscription: &str,
    ) -> Result<BTreeMap<String, RemoteTableState>>;
    /// Cumulative insert+update+delete counters per table.
    async fn change_counters(&self, tables: &[String]) -> Result<BTreeMap<String, u64>>;
    async fn node_exists(&self, node: &str) -> Result<bool>;
    async fn replication_set_exists(&self, set: &str) -> Result<bool>;
    async fn subscription_exists(&self, subscription: &str) -> Result<bool>;
    async fn set_tables(&self, set: &str) -> Result<BTreeSet<String>>;
    async fn set_sequences(&self, set: &str) -> Result<BTreeSet<String>>;
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>>;
    async fn list_sequences(&self, schema: &str) -> Result<Vec<String>>;
    async fn table_columns(&self, tables: &[String]) -> Result<BTreeMap<String, Vec<Column>>>;
    async fn tables_without_primary_key(&self, tables: &[String]) -> Result<Vec<String>>;
    async fn sequence_values(&self, sequences: &[String]) -> Result<BTreeMap<String, i64>>;
    async fn verification_token(&self, table: &str, checksum: bool) -> Result<VerificationToken>;
    /// Write privileges granted directly to `roles` on `tables`, including an owner's implicit ones.
    async fn write_grants(&self, tables: &[String], roles: &[String]) -> Result<WriteGrants>;
}

/// Control functions and privilege changes. Every call must be safe to repeat.
#[async_trait]
pub trait ReplicationEndpoint: ReplicationCatalog {
    async fn ensure_extension(&self) -> Result<()>;
    async fn create_node(&self, node: &str, dsn: &Dsn) -> Result<()>;
    async fn create_replication_set(&self, set: &str) -> Result<()>;
    async fn create_subscription(&self, subscription: &str, provider: &Dsn, set: &str)
        -> Result<()>;
    async fn add_table_to_set(&self, set: &str, table: &str) -> Result<()>;
    async fn add_sequence_to_set(&self, set: &str, sequence: &str) -> Result<()>;
    async fn remove_table_from_set(&self, set: &str, table: &str) -> Result<()>;
    async fn remove_sequence_from_set(&self, set: &str, sequence: &str) -> Result<()>;
    async fn drop_subscription(&self, subscription: &str) -> Result<()>;
    async fn drop_replication_set(&self, set: &str) -> Result<()>;
    async fn drop_node(&self, node: &str) -> Result<()>;
    async fn revoke_writes(&self, tables: &[String], roles: &[String]) -> Result<()>;
    /// Re-grant exactly what `write_grants` recorded.
    async fn grant_writes(&self, grants: &WriteGrants) -> Result<()>;
    async fn set_sequence_values(&self, values: &BTreeMap<String, i64>) -> Result<()>;
}

/// Both ends of one migration pair.
#[derive(Clone)]
pub struct PairEndpoints {
    pub source: Arc<dyn ReplicationEndpoint>,
    pub target: Arc<dyn ReplicationEndpoint>,
}

pub trait EndpointFactory: Send + Sync {
    fn endpoint(&self, dsn: &Dsn) -> Arc<dyn ReplicationEndpoint>;

    fn pair(&self, ctx: &MigrationContext) -> PairEndpoints {
        PairEndpoints {
            source: self.endpoint(&ctx.source_dsn),
            target: self.endpoint(&ctx.target_dsn),
        }
    }
}

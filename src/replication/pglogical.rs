// ABOUTME: pglogical implementation of the replication traits over the connection gateway
// ABOUTME: Control functions, catalog views and privilege statements for one endpoint

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::naming::{quote_ident, quote_qualified};
use super::{
    Column, EndpointFactory, RemoteTableState, ReplicationCatalog, ReplicationEndpoint,
    SubscriptionStatus,
};
use crate::config::Dsn;
use crate::context::{VerificationToken, WriteGrants, WRITE_PRIVILEGES};
use crate::error::Result;
use crate::gateway::Gateway;
use crate::lsn::Lsn;

pub struct PgEndpoint {
    gateway: Arc<Gateway>,
    dsn: Dsn,
}

impl PgEndpoint {
    pub fn new(gateway: Arc<Gateway>, dsn: Dsn) -> Self {
        Self { gateway, dsn }
    }

    async fn exists(&self, sql: &str, name: &str) -> Result<bool> {
        let row = self.gateway.query_one(&self.dsn, sql, &[&name]).await?;
        Ok(row.get(0))
    }

    async fn names(&self, sql: &str, arg: &str) -> Result<Vec<String>> {
        let rows = self.gateway.query(&self.dsn, sql, &[&arg]).await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }
}

fn parse_lsn(text: Option<String>) -> Result<Option<Lsn>> {
    text.map(|t| t.parse()).transpose()
}

#[async_trait]
impl ReplicationCatalog for PgEndpoint {
    async fn extension_installed(&self) -> Result<bool> {
        self.exists(
            "SELECT EXISTS(SELECT 1 FROM pg_extension WHERE extname = $1)",
            "pglogical",
        )
        .await
    }

    async fn current_wal_lsn(&self) -> Result<Lsn> {
        let row = self
            .gateway
            .query_one(&self.dsn, "SELECT pg_current_wal_lsn()::text", &[])
            .await?;
        let text: String = row.get(0);
        text.parse()
    }

    async fn applied_lsn(&self, subscription: &str) -> Result<Option<Lsn>> {
        // pglogical names the replication origin after the subscription's slot.
        let row = self
            .gateway
            .query_opt(
                &self.dsn,
                "SELECT ros.remote_lsn::text
                 FROM pglogical.subscription s
                 JOIN pg_replication_origin ro ON ro.roname = s.sub_slot_name
                 JOIN pg_replication_origin_status ros ON ros.local_id = ro.roident
                 WHERE s.sub_name = $1",
                &[&subscription],
            )
            .await?;
        parse_lsn(row.and_then(|r| r.get::<_, Option<String>>(0)))
    }

    async fn replay_lag_secs(&self, subscription: &str) -> Result<Option<f64>> {
        let rows = self
            .gateway
            .query(
                &self.dsn,
                "SELECT EXTRACT(EPOCH FROM replay_lag)::float8
                 FROM pg_stat_replication
                 WHERE application_name = $1",
                &[&subscription],
            )
            .await?;
        Ok(rows.first().and_then(|r| r.get::<_, Option<f64>>(0)))
    }

    async fn subscription_status(&self, subscription: &str) -> Result<Option<SubscriptionStatus>> {
        if !self.subscription_exists(subscription).await? {
            return Ok(None);
        }
        let row = self
            .gateway
            .query_one(
                &self.dsn,
                "SELECT status FROM pglogical.show_subscription_status($1)",
                &[&subscription],
            )
            .await?;
        let status: String = row.get(0);
        Ok(Some(SubscriptionStatus::parse(&status)))
    }

    async fn table_sync_states(
        &self,
        subscription: &str,
    ) -> Result<BTreeMap<String, RemoteTableState>> {
        let rows = self
            .gateway
            .query(
                &self.dsn,
                "SELECT ss.sync_nspname || '.' || ss.sync_relname, ss.sync_status::text
                 FROM pglogical.local_sync_status ss
                 JOIN pglogical.subscription s ON s.sub_id = ss.sync_subid
                 WHERE s.sub_name = $1 AND ss.sync_relname IS NOT NULL",
                &[&subscription],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let table: String = row.get(0);
                let code: String = row.get(1);
                (table, RemoteTableState::from_sync_code(&code))
            })
            .collect())
    }

    async fn change_counters(&self, tables: &[String]) -> Result<BTreeMap<String, u64>> {
        let tables = tables.to_vec();
        let rows = self
            .gateway
            .query(
                &self.dsn,
                "SELECT schemaname || '.' || relname,
                        (n_tup_ins + n_tup_upd + n_tup_del)::int8
                 FROM pg_stat_user_tables
                 WHERE schemaname || '.' || relname = ANY($1)",
                &[&tables],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let table: String = row.get(0);
                let changes: i64 = row.get(1);
                (table, changes.max(0) as u64)
            })
            .collect())
    }

    async fn node_exists(&self, node: &str) -> Result<bool> {
        self.exists(
            "SELECT EXISTS(SELECT 1 FROM pglogical.node WHERE node_name = $1)",
            node,
        )
        .await
    }

    async fn replication_set_exists(&self, set: &str) -> Result<bool> {
        self.exists(
            "SELECT EXISTS(SELECT 1 FROM pglogical.replication_set WHERE set_name = $1)",
            set,
        )
        .await
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool> {
        self.exists(
            "SELECT EXISTS(SELECT 1 FROM pglogical.subscription WHERE sub_name = $1)",
            subscription,
        )
        .await
    }

    async fn set_tables(&self, set: &str) -> Result<BTreeSet<String>> {
        let names = self
            .names(
                "SELECT n.nspname || '.' || c.relname
                 FROM pglogical.replication_set_table rst
                 JOIN pglogical.replication_set rs ON rs.set_id = rst.set_id
                 JOIN pg_class c ON c.oid = rst.set_reloid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE rs.set_name = $1",
                set,
            )
            .await?;
        Ok(names.into_iter().collect())
    }

    async fn set_sequences(&self, set: &str) -> Result<BTreeSet<String>> {
        let names = self
            .names(
                "SELECT n.nspname || '.' || c.relname
                 FROM pglogical.replication_set_seq rss
                 JOIN pglogical.replication_set rs ON rs.set_id = rss.set_id
                 JOIN pg_class c ON c.oid = rss.set_seqoid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE rs.set_name = $1",
                set,
            )
            .await?;
        Ok(names.into_iter().collect())
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        self.names(
            "SELECT schemaname || '.' || tablename FROM pg_tables
             WHERE schemaname = $1 ORDER BY 1",
            schema,
        )
        .await
    }

    async fn list_sequences(&self, schema: &str) -> Result<Vec<String>> {
        self.names(
            "SELECT schemaname || '.' || sequencename FROM pg_sequences
             WHERE schemaname = $1 ORDER BY 1",
            schema,
        )
        .await
    }

    async fn table_columns(&self, tables: &[String]) -> Result<BTreeMap<String, Vec<Column>>> {
        let tables = tables.to_vec();
        let rows = self
            .gateway
            .query(
                &self.dsn,
                "SELECT n.nspname || '.' || c.relname, a.attname,
                        format_type(a.atttypid, a.atttypmod)
                 FROM pg_attribute a
                 JOIN pg_class c ON c.oid = a.attrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname || '.' || c.relname = ANY($1)
                   AND a.attnum > 0 AND NOT a.attisdropped
                 ORDER BY 1, a.attnum",
                &[&tables],
            )
            .await?;
        let mut out: BTreeMap<String, Vec<Column>> = BTreeMap::new();
        for row in rows {
            let table: String = row.get(0);
            out.entry(table)
                .or_default()
                .push(Column::new(row.get::<_, String>(1), row.get::<_, String>(2)));
        }
        Ok(out)
    }

    async fn tables_without_primary_key(&self, tables: &[String]) -> Result<Vec<String>> {
        let tables = tables.to_vec();
        let rows = self
            .gateway
            .query(
                &self.dsn,
                "SELECT n.nspname || '.' || c.relname
                 FROM pg_class c
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname || '.' || c.relname = ANY($1)
                   AND c.relkind IN ('r', 'p')
                   AND NOT EXISTS (
                       SELECT 1 FROM pg_index i WHERE i.indrelid = c.oid AND i.indisprimary
                   )
                 ORDER BY 1",
                &[&tables],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn sequence_values(&self, sequences: &[String]) -> Result<BTreeMap<String, i64>> {
        let sequences = sequences.to_vec();
        let rows = self
            .gateway
            .query(
                &self.dsn,
                "SELECT schemaname || '.' || sequencename, last_value
                 FROM pg_sequences
                 WHERE schemaname || '.' || sequencename = ANY($1)",
                &[&sequences],
            )
            .await?;
        // last_value is NULL until nextval() has been called once.
        Ok(rows
            .iter()
            .filter_map(|row| {
                let value: Option<i64> = row.get(1);
                value.map(|v| (row.get::<_, String>(0), v))
            })
            .collect())
    }

    async fn verification_token(&self, table: &str, checksum: bool) -> Result<VerificationToken> {
        let quoted = quote_qualified(table);
        let row = self
            .gateway
            .query_one(&self.dsn, &format!("SELECT count(*) FROM {}", quoted), &[])
            .await?;
        let row_count: i64 = row.get(0);

        let checksum = if checksum {
            let row = self
                .gateway
                .query_one(
                    &self.dsn,
                    &format!(
                        "SELECT md5(coalesce(string_agg(t::text, '' ORDER BY t::text), '')) FROM {} t",
                        quoted
                    ),
                    &[],
                )
                .await?;
            Some(row.get::<_, String>(0))
        } else {
            None
        };
        Ok(VerificationToken {
            row_count,
            checksum,
        })
    }

    async fn write_grants(&self, tables: &[String], roles: &[String]) -> Result<WriteGrants> {
        let names = tables.to_vec();
        let relations: Vec<String> = tables.iter().map(|t| quote_qualified(t)).collect();
        let roles = roles.to_vec();
        let privileges: Vec<String> = WRITE_PRIVILEGES.iter().map(|p| p.to_string()).collect();
        // A NULL relacl means the owner still holds its implicit default privileges.
        let rows = self
            .gateway
            .query(
                &self.dsn,
                "SELECT t.name, r.rolname::text, a.privilege_type
                 FROM unnest($1::text[], $2::text[]) AS t(name, relation)
                 JOIN pg_class c ON c.oid = t.relation::regclass
                 CROSS JOIN LATERAL aclexplode(COALESCE(c.relacl, acldefault('r', c.relowner))) AS a
                 JOIN pg_roles r ON r.oid = a.grantee
                 WHERE r.rolname = ANY($3) AND a.privilege_type = ANY($4)",
                &[&names, &relations, &roles, &privileges],
            )
            .await?;
        let mut grants = WriteGrants::new();
        for row in &rows {
            let (table, role, privilege): (String, String, String) =
                (row.get(0), row.get(1), row.get(2));
            grants
                .entry(table)
                .or_default()
                .entry(role)
                .or_default()
                .insert(privilege);
        }
        Ok(grants)
    }
}

#[async_trait]
impl ReplicationEndpoint for PgEndpoint {
    async fn ensure_extension(&self) -> Result<()> {
        self.gateway
            .batch_execute(&self.dsn, "CREATE EXTENSION IF NOT EXISTS pglogical")
            .await
    }

    async fn create_node(&self, node: &str, dsn: &Dsn) -> Result<()> {
        info!(endpoint = %self.dsn, node, "Creating pglogical node");
        self.gateway
            .query(
                &self.dsn,
                "SELECT pglogical.create_node(node_name := $1, dsn := $2)",
                &[&node, &dsn.expose()],
            )
            .await?;
        Ok(())
    }

    async fn create_replication_set(&self, set: &str) -> Result<()> {
        info!(endpoint = %self.dsn, set, "Creating replication set");
        self.gateway
            .query(
                &self.dsn,
                "SELECT pglogical.create_replication_set(
                     set_name := $1,
                     replicate_insert := true,
                     replicate_update := true,
                     replicate_delete := true,
                     replicate_truncate := true)",
                &[&set],
            )
            .await?;
        Ok(())
    }

    async fn create_subscription(
        &self,
        subscription: &str,
        provider: &Dsn,
        set: &str,
    ) -> Result<()> {
        info!(endpoint = %self.dsn, subscription, set, "Creating subscription");
        self.gateway
            .query(
                &self.dsn,
                "SELECT pglogical.create_subscription(
                     subscription_name := $1,
                     provider_dsn := $2,
                     replication_sets := ARRAY[$3::text],
                     synchronize_structure := false,
                     synchronize_data := true,
                     forward_origins := '{}')",
                &[&subscription, &provider.expose(), &set],
            )
            .await?;
        Ok(())
    }

    async fn add_table_to_set(&self, set: &str, table: &str) -> Result<()> {
        debug!(set, table, "Adding table to replication set");
        let relation = quote_qualified(table);
        self.gateway
            .query(
                &self.dsn,
                "SELECT pglogical.replication_set_add_table(
                     set_name := $1, relation := $2::text::regclass, synchronize_data := true)",
                &[&set, &relation],
            )
            .await?;
        Ok(())
    }

    async fn add_sequence_to_set(&self, set: &str, sequence: &str) -> Result<()> {
        debug!(set, sequence, "Adding sequence to replication set");
        let relation = quote_qualified(sequence);
        self.gateway
            .query(
                &self.dsn,
                "SELECT pglogical.replication_set_add_sequence(
                     set_name := $1, relation := $2::text::regclass, synchronize_data := true)",
                &[&set, &relation],
            )
            .await?;
        Ok(())
    }

    async fn remove_table_from_set(&self, set: &str, table: &str) -> Result<()> {
        let relation = quote_qualified(table);
        self.gateway
            .query(
                &self.dsn,
                "SELECT pglogical.replication_set_remove_table(
                     set_name := $1, relation := $2::text::regclass)",
                &[&set, &relation],
            )
            .await?;
        Ok(())
    }

    async fn remove_sequence_from_set(&self, set: &str, sequence: &str) -> Result<()> {
        let relation = quote_qualified(sequence);
        self.gateway
            .query(
                &self.dsn,
                "SELECT pglogical.replication_set_remove_sequence(
                     set_name := $1, relation := $2::text::regclass)",
                &[&set, &relation],
            )
            .await?;
        Ok(())
    }

    async fn drop_subscription(&self, subscription: &str) -> Result<()> {
        self.gateway
            .query(
                &self.dsn,
                "SELECT pglogical.drop_subscription(subscription_name := $1, ifexists := true)",
                &[&subscription],
            )
            .await?;
        Ok(())
    }

    async fn drop_replication_set(&self, set: &str) -> Result<()> {
        self.gateway
            .query(
                &self.dsn,
                "SELECT pglogical.drop_replication_set(set_name := $1, ifexists := true)",
                &[&set],
            )
            .await?;
        Ok(())
    }

    async fn drop_node(&self, node: &str) -> Result<()> {
        self.gateway
            .query(
                &self.dsn,
                "SELECT pglogical.drop_node(node_name := $1, ifexists := true)",
                &[&node],
            )
            .await?;
        Ok(())
    }

    async fn revoke_writes(&self, tables: &[String], roles: &[String]) -> Result<()> {
        if let Some(sql) = revoke_statement(tables, roles) {
            info!(endpoint = %self.dsn, roles = ?roles, "Revoking write privileges");
            self.gateway.batch_execute(&self.dsn, &sql).await?;
        }
        Ok(())
    }

    async fn grant_writes(&self, grants: &WriteGrants) -> Result<()> {
        let statements = grant_statements(grants);
        if !statements.is_empty() {
            info!(endpoint = %self.dsn, grants = statements.len(), "Restoring write privileges");
            self.gateway
                .batch_execute(&self.dsn, &statements.join(";\n"))
                .await?;
        }
        Ok(())
    }

    async fn set_sequence_values(&self, values: &BTreeMap<String, i64>) -> Result<()> {
        for (sequence, value) in values {
            let relation = quote_qualified(sequence);
            self.gateway
                .query(
                    &self.dsn,
                    "SELECT setval($1::text::regclass, $2)",
                    &[&relation, value],
                )
                .await?;
        }
        Ok(())
    }
}

fn revoke_statement(tables: &[String], roles: &[String]) -> Option<String> {
    if tables.is_empty() || roles.is_empty() {
        return None;
    }
    let tables: Vec<String> = tables.iter().map(|t| quote_qualified(t)).collect();
    let roles: Vec<String> = roles.iter().map(|r| quote_ident(r)).collect();
    Some(format!(
        "REVOKE {} ON TABLE {} FROM {}",
        WRITE_PRIVILEGES.join(", "),
        tables.join(", "),
        roles.join(", ")
    ))
}

/// One GRANT per table and role. Privileges outside the write set are never emitted.
fn grant_statements(grants: &WriteGrants) -> Vec<String> {
    let mut statements = Vec::new();
    for (table, roles) in grants {
        for (role, privileges) in roles {
            let privileges: Vec<&str> = WRITE_PRIVILEGES
                .iter()
                .copied()
                .filter(|p| privileges.contains(*p))
                .collect();
            if privileges.is_empty() {
                continue;
            }
            statements.push(format!(
                "GRANT {} ON TABLE {} TO {}",
                privileges.join(", "),
                quote_qualified(table),
                quote_ident(role)
            ));
        }
    }
    statements
}

pub struct PgEndpointFactory {
    gateway: Arc<Gateway>,
}

impl PgEndpointFactory {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

impl EndpointFactory for PgEndpointFactory {
    fn endpoint(&self, dsn: &Dsn) -> Arc<dyn ReplicationEndpoint> {
        Arc::new(PgEndpoint::new(self.gateway.clone(), dsn.clone()))
    }
}

// ABOUTME: Schema sync checks between source and target before replication is provisioned
// ABOUTME: Optionally copies missing table definitions with pg_dump --schema-only and psql

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::Dsn;
use crate::context::{MigrationContext, Stage};
use crate::error::{MigratorError, Result};
use crate::replication::{Column, PairEndpoints, ReplicationCatalog};

/// Copies table definitions from source to target.
#[async_trait]
pub trait SchemaCopier: Send + Sync {
    async fn copy_tables(&self, source: &Dsn, target: &Dsn, tables: &[String]) -> Result<()>;
}

/// `pg_dump --schema-only` piped through a temp file into `psql`.
pub struct PgDumpCopier;

impl PgDumpCopier {
    fn locate(binary: &str) -> Result<PathBuf> {
        which::which(binary).map_err(|_| {
            MigratorError::Validation(format!(
                "{} not found on PATH; install the PostgreSQL client tools or disable copy_schema",
                binary
            ))
        })
    }
}

#[async_trait]
impl SchemaCopier for PgDumpCopier {
    async fn copy_tables(&self, source: &Dsn, target: &Dsn, tables: &[String]) -> Result<()> {
        let pg_dump = Self::locate("pg_dump")?;
        let psql = Self::locate("psql")?;
        let dump = tempfile::Builder::new()
            .prefix("schema-")
            .suffix(".sql")
            .tempfile()
            .map_err(|e| MigratorError::Validation(format!("temp file: {}", e)))?;

        let mut cmd = Command::new(&pg_dump);
        cmd.arg("--schema-only")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--file")
            .arg(dump.path())
            .arg("--dbname")
            .arg(source.expose());
        for table in tables {
            cmd.arg("--table").arg(table);
        }
        info!(tables = tables.len(), "Dumping table definitions from source");
        run(cmd, "pg_dump").await?;

        let mut cmd = Command::new(&psql);
        cmd.arg("--no-psqlrc")
            .arg("--set")
            .arg("ON_ERROR_STOP=1")
            .arg("--single-transaction")
            .arg("--file")
            .arg(dump.path())
            .arg("--dbname")
            .arg(target.expose());
        info!("Restoring table definitions on target");
        run(cmd, "psql").await
    }
}

async fn run(mut cmd: Command, tool: &str) -> Result<()> {
    let output = cmd
        .output()
        .await
        .map_err(|e| MigratorError::Validation(format!("failed to start {}: {}", tool, e)))?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(MigratorError::Connection(format!(
            "{} exited with {}: {}",
            tool,
            output.status,
            stderr.trim()
        )))
    }
}

/// Per-table column differences between two endpoints.
pub fn column_mismatches(
    source: &BTreeMap<String, Vec<Column>>,
    target: &BTreeMap<String, Vec<Column>>,
) -> Vec<String> {
    let mut problems = Vec::new();
    for (table, columns) in source {
        match target.get(table) {
            None => problems.push(format!("{} missing on target", table)),
            Some(other) if other != columns => {
                let describe = |cols: &[Column]| {
                    cols.iter()
                        .map(|c| format!("{} {}", c.name, c.data_type))
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                problems.push(format!(
                    "{} differs: source ({}) vs target ({})",
                    table,
                    describe(columns),
                    describe(other)
                ));
            }
            Some(_) => {}
        }
    }
    problems
}

/// Verify the tracked objects exist and are replicable, copying missing tables when enabled.
pub async fn sync_schema(
    ctx: &MigrationContext,
    pair: &PairEndpoints,
    copier: &dyn SchemaCopier,
) -> Result<()> {
    let tables: Vec<String> = ctx.tables.iter().cloned().collect();
    let stage = Stage::Uninitialized;

    let source_columns = pair.source.table_columns(&tables).await?;
    let missing: Vec<&String> = tables
        .iter()
        .filter(|t| !source_columns.contains_key(*t))
        .collect();
    if !missing.is_empty() {
        return Err(MigratorError::precondition(
            stage,
            format!("tracked tables missing on source: {:?}", missing),
        ));
    }

    let without_pk = pair.source.tables_without_primary_key(&tables).await?;
    if !without_pk.is_empty() {
        return Err(MigratorError::precondition(
            stage,
            format!(
                "tables without a primary key cannot replicate updates and deletes: {:?}",
                without_pk
            ),
        ));
    }

    if !ctx.sequences.is_empty() {
        let schemas: std::collections::BTreeSet<&str> = ctx
            .sequences
            .iter()
            .filter_map(|s| s.split_once('.').map(|(schema, _)| schema))
            .collect();
        let mut present = Vec::new();
        for schema in schemas {
            present.extend(pair.source.list_sequences(schema).await?);
        }
        let missing: Vec<&String> = ctx
            .sequences
            .iter()
            .filter(|s| !present.contains(*s))
            .collect();
        if !missing.is_empty() {
            return Err(MigratorError::precondition(
                stage,
                format!("tracked sequences missing on source: {:?}", missing),
            ));
        }
    }

    let mut target_columns = pair.target.table_columns(&tables).await?;
    let absent: Vec<String> = tables
        .iter()
        .filter(|t| !target_columns.contains_key(*t))
        .cloned()
        .collect();
    if !absent.is_empty() {
        if ctx.options.copy_schema {
            info!(pair = %ctx.pair_id, tables = ?absent, "Copying missing table definitions");
            copier
                .copy_tables(&ctx.source_dsn, &ctx.target_dsn, &absent)
                .await?;
            target_columns = pair.target.table_columns(&tables).await?;
        } else {
            warn!(pair = %ctx.pair_id, tables = ?absent, "Tables missing on target and copy_schema is off");
        }
    }

    let problems = column_mismatches(&source_columns, &target_columns);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(MigratorError::precondition(stage, problems.join("; ")))
    }
}

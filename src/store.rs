// ABOUTME: Durable migration context store backed by a local SQLite file
// ABOUTME: Optimistic revision checks detect lost updates; monitor reports live in their own table

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::context::{MigrationContext, MonitorReport};
use crate::error::{MigratorError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS migration_contexts (
    pair_id   TEXT PRIMARY KEY,
    revision  INTEGER NOT NULL,
    stage     TEXT NOT NULL,
    body      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS monitor_reports (
    pair_id   TEXT PRIMARY KEY,
    body      TEXT NOT NULL
);
";

#[derive(Clone)]
pub struct ContextStore {
    conn: Arc<Mutex<Connection>>,
}

impl ContextStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|p| p.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| MigratorError::Store(format!("store task failed: {}", e)))?
    }

    /// Insert a new context at revision 1. Fails if the pair already exists.
    pub async fn insert(&self, ctx: &mut MigrationContext) -> Result<()> {
        ctx.revision = 1;
        let pair_id = ctx.pair_id.clone();
        let stage = ctx.stage.to_string();
        let body = serde_json::to_string(ctx)?;
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO migration_contexts (pair_id, revision, stage, body)
                 VALUES (?1, 1, ?2, ?3)
                 ON CONFLICT (pair_id) DO NOTHING",
                params![pair_id, stage, body],
            )?;
            if inserted == 0 {
                return Err(MigratorError::Validation(format!(
                    "migration {} already exists",
                    pair_id
                )));
            }
            Ok(())
        })
        .await
    }

    pub async fn get(&self, pair_id: &str) -> Result<Option<MigrationContext>> {
        let pair_id = pair_id.to_string();
        let body: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT body FROM migration_contexts WHERE pair_id = ?1",
                        params![pair_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        body.map(|b| serde_json::from_str(&b).map_err(MigratorError::from))
            .transpose()
    }

    pub async fn load(&self, pair_id: &str) -> Result<MigrationContext> {
        self.get(pair_id)
            .await?
            .ok_or_else(|| MigratorError::NotFound(format!("migration {}", pair_id)))
    }

    pub async fn list(&self) -> Result<Vec<MigrationContext>> {
        let bodies: Vec<String> = self
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT body FROM migration_contexts ORDER BY pair_id")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
            })
            .await?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(MigratorError::from))
            .collect()
    }

    /// Write `ctx` if the stored revision still matches, then bump `ctx.revision`.
    pub async fn persist(&self, ctx: &mut MigrationContext) -> Result<()> {
        let expected = ctx.revision;
        let mut next = ctx.clone();
        next.revision = expected + 1;
        next.updated_at = Utc::now();

        let pair_id = next.pair_id.clone();
        let stage = next.stage.to_string();
        let body = serde_json::to_string(&next)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE migration_contexts SET revision = ?1, stage = ?2, body = ?3
                 WHERE pair_id = ?4 AND revision = ?5",
                params![(expected + 1) as i64, stage, body, pair_id, expected as i64],
            )?;
            if updated == 0 {
                let found: Option<i64> = tx
                    .query_row(
                        "SELECT revision FROM migration_contexts WHERE pair_id = ?1",
                        params![pair_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                return Err(match found {
                    Some(found) => MigratorError::StaleRevision {
                        pair: pair_id,
                        expected,
                        found: found as u64,
                    },
                    None => MigratorError::NotFound(format!("migration {}", pair_id)),
                });
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        debug!(pair = %next.pair_id, revision = next.revision, stage = %next.stage, "Persisted context");
        *ctx = next;
        Ok(())
    }

    pub async fn save_report(&self, report: &MonitorReport) -> Result<()> {
        let pair_id = report.pair_id.clone();
        let body = serde_json::to_string(report)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO monitor_reports (pair_id, body) VALUES (?1, ?2)
                 ON CONFLICT (pair_id) DO UPDATE SET body = excluded.body",
                params![pair_id, body],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn load_report(&self, pair_id: &str) -> Result<Option<MonitorReport>> {
        let pair_id = pair_id.to_string();
        let body: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT body FROM monitor_reports WHERE pair_id = ?1",
                        params![pair_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        body.map(|b| serde_json::from_str(&b).map_err(MigratorError::from))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Dsn;
    use crate::context::{ContextOptions, Stage};
    use std::collections::{BTreeMap, BTreeSet};

    fn context(pair_id: &str) -> MigrationContext {
        MigrationContext {
            pair_id: pair_id.into(),
            source_dsn: Dsn::new("host=src password=secret"),
            target_dsn: Dsn::new("host=dst"),
            provider_dsn: Dsn::new("host=src"),
            stage: Stage::Uninitialized,
            tables: ["public.a".to_string()].into_iter().collect(),
            sequences: BTreeSet::new(),
            set_tables: BTreeSet::new(),
            set_sequences: BTreeSet::new(),
            frozen_roles: vec!["app".into()],
            options: ContextOptions::default(),
            cutover: None,
            paused: false,
            last_error: None,
            fingerprint: "fp".into(),
            revision: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_load_persist() {
        let store = ContextStore::open_in_memory().unwrap();
        let mut ctx = context("dc/a");
        store.insert(&mut ctx).await.unwrap();
        assert_eq!(ctx.revision, 1);

        ctx.stage = Stage::SchemaSynced;
        store.persist(&mut ctx).await.unwrap();
        assert_eq!(ctx.revision, 2);

        let loaded = store.load("dc/a").await.unwrap();
        assert_eq!(loaded.stage, Stage::SchemaSynced);
        assert_eq!(loaded.revision, 2);
        assert_eq!(loaded.source_dsn.expose(), "host=src password=secret");
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = ContextStore::open_in_memory().unwrap();
        store.insert(&mut context("dc/a")).await.unwrap();
        let err = store.insert(&mut context("dc/a")).await.unwrap_err();
        assert!(matches!(err, MigratorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_lost_update_detected() {
        let store = ContextStore::open_in_memory().unwrap();
        let mut ctx = context("dc/a");
        store.insert(&mut ctx).await.unwrap();

        let mut writer_a = store.load("dc/a").await.unwrap();
        let mut writer_b = store.load("dc/a").await.unwrap();
        writer_a.paused = true;
        store.persist(&mut writer_a).await.unwrap();

        writer_b.stage = Stage::SchemaSynced;
        let err = store.persist(&mut writer_b).await.unwrap_err();
        assert_eq!(
            err,
            MigratorError::StaleRevision {
                pair: "dc/a".into(),
                expected: 1,
                found: 2
            }
        );
        // The losing writer's copy is left untouched.
        assert_eq!(writer_b.revision, 1);
        assert_eq!(store.load("dc/a").await.unwrap().stage, Stage::Uninitialized);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = ContextStore::open(&path).unwrap();
            let mut ctx = context("dc/a");
            store.insert(&mut ctx).await.unwrap();
            ctx.stage = Stage::NodesProvisioned;
            store.persist(&mut ctx).await.unwrap();
        }
        let reopened = ContextStore::open(&path).unwrap();
        let ctx = reopened.load("dc/a").await.unwrap();
        assert_eq!(ctx.stage, Stage::NodesProvisioned);
        assert_eq!(ctx.revision, 2);
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reports_round_trip() {
        let store = ContextStore::open_in_memory().unwrap();
        assert!(store.load_report("dc/a").await.unwrap().is_none());
        let report = MonitorReport {
            pair_id: "dc/a".into(),
            tables: BTreeMap::new(),
            lag: None,
            subscription_down: false,
            polls: 4,
            polled_at: Utc::now(),
        };
        store.save_report(&report).await.unwrap();
        store.save_report(&report).await.unwrap();
        assert_eq!(store.load_report("dc/a").await.unwrap().unwrap().polls, 4);
    }

    #[tokio::test]
    async fn test_missing_pair() {
        let store = ContextStore::open_in_memory().unwrap();
        assert!(matches!(
            store.load("nope").await.unwrap_err(),
            MigratorError::NotFound(_)
        ));
    }
}

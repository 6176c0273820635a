// ABOUTME: Connection gateway: bounded, retryable SQL execution against PostgreSQL endpoints
// ABOUTME: One semaphore caps live sessions across every migration pair; idle clients are reused

pub mod retry;

pub use retry::{with_backoff, RetryPolicy};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row};
use tracing::{debug, trace};

use crate::config::{Dsn, OrchestratorConfig};
use crate::error::{MigratorError, Result};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_sessions: usize,
    pub max_idle_per_endpoint: usize,
    pub connect_timeout: Duration,
    pub statement_timeout: Duration,
    pub accept_invalid_certs: bool,
    pub retry: RetryPolicy,
}

impl From<&OrchestratorConfig> for GatewayConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_sessions: config.max_sessions,
            max_idle_per_endpoint: config.max_idle_per_endpoint,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            statement_timeout: Duration::from_secs(config.statement_timeout_secs),
            accept_invalid_certs: config.accept_invalid_certs,
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

pub struct Gateway {
    config: GatewayConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<HashMap<String, Vec<Client>>>,
    tls: MakeTlsConnector,
}

/// A checked-out connection. Holds one session permit until dropped.
pub struct Session<'a> {
    gateway: &'a Gateway,
    key: String,
    client: Option<Client>,
    _permit: OwnedSemaphorePermit,
}

impl<'a> Session<'a> {
    /// The client is only taken in Drop, so this fails only on a released session.
    pub fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| MigratorError::Connection("session already released".into()))
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.gateway.release(&self.key, client);
        }
    }
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| MigratorError::Connection(format!("TLS setup failed: {}", e)))?;

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_sessions)),
            idle: Mutex::new(HashMap::new()),
            tls: MakeTlsConnector::new(connector),
            config,
        })
    }

    pub fn available_sessions(&self) -> usize {
        self.permits.available_permits()
    }

    /// Check out a session, waiting (FIFO) for a free permit.
    pub async fn session(&self, dsn: &Dsn) -> Result<Session<'_>> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MigratorError::Cancelled)?;

        let key = dsn.expose().to_string();
        let client = match self.take_idle(&key) {
            Some(client) => client,
            None => self.connect(dsn).await?,
        };

        Ok(Session {
            gateway: self,
            key,
            client: Some(client),
            _permit: permit,
        })
    }

    fn take_idle(&self, key: &str) -> Option<Client> {
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        let clients = idle.get_mut(key)?;
        while let Some(client) = clients.pop() {
            if !client.is_closed() {
                return Some(client);
            }
        }
        None
    }

    fn release(&self, key: &str, client: Client) {
        if client.is_closed() {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        let clients = idle.entry(key.to_string()).or_default();
        if clients.len() < self.config.max_idle_per_endpoint {
            clients.push(client);
        }
    }

    async fn connect(&self, dsn: &Dsn) -> Result<Client> {
        let connecting = tokio_postgres::connect(dsn.expose(), self.tls.clone());
        let (client, connection) = tokio::time::timeout(self.config.connect_timeout, connecting)
            .await
            .map_err(|_| MigratorError::Timeout(format!("connecting to {}", dsn)))??;

        let endpoint = dsn.redacted();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(endpoint = %endpoint, "Connection closed: {}", e);
            }
        });

        let timeout_ms = self.config.statement_timeout.as_millis();
        client
            .batch_execute(&format!("SET statement_timeout = {}", timeout_ms))
            .await?;
        debug!(endpoint = %dsn, "Opened connection");
        Ok(client)
    }

    async fn bounded<T, F>(&self, sql: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, tokio_postgres::Error>>,
    {
        // Client-side bound slightly above the server statement_timeout so the server wins races.
        let limit = self.config.statement_timeout + Duration::from_secs(5);
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(MigratorError::from),
            Err(_) => Err(MigratorError::Timeout(summarize(sql))),
        }
    }

    pub async fn query(
        &self,
        dsn: &Dsn,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>> {
        trace!(endpoint = %dsn, sql, "query");
        with_backoff(&self.config.retry, &summarize(sql), || async {
            let session = self.session(dsn).await?;
            self.bounded(sql, session.client()?.query(sql, params)).await
        })
        .await
    }

    pub async fn query_opt(
        &self,
        dsn: &Dsn,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>> {
        let mut rows = self.query(dsn, sql, params).await?;
        match rows.len() {
            0 | 1 => Ok(rows.pop()),
            n => Err(MigratorError::Connection(format!(
                "expected at most one row, got {} from: {}",
                n,
                summarize(sql)
            ))),
        }
    }

    pub async fn query_one(
        &self,
        dsn: &Dsn,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Row> {
        self.query_opt(dsn, sql, params).await?.ok_or_else(|| {
            MigratorError::Connection(format!("expected one row from: {}", summarize(sql)))
        })
    }

    pub async fn execute(
        &self,
        dsn: &Dsn,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64> {
        trace!(endpoint = %dsn, sql, "execute");
        with_backoff(&self.config.retry, &summarize(sql), || async {
            let session = self.session(dsn).await?;
            self.bounded(sql, session.client()?.execute(sql, params)).await
        })
        .await
    }

    /// Multi-statement text without parameters. Runs in one implicit transaction.
    pub async fn batch_execute(&self, dsn: &Dsn, sql: &str) -> Result<()> {
        trace!(endpoint = %dsn, sql, "batch_execute");
        with_backoff(&self.config.retry, &summarize(sql), || async {
            let session = self.session(dsn).await?;
            self.bounded(sql, session.client()?.batch_execute(sql)).await
        })
        .await
    }
}

/// First line of a statement, trimmed, for logs and error messages.
fn summarize(sql: &str) -> String {
    let line = sql.trim().lines().next().unwrap_or_default().trim();
    if line.len() > 80 {
        let mut end = 80;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &line[..end])
    } else {
        line.to_string()
    }
}

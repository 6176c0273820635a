// ABOUTME: Error taxonomy shared by the gateway, state machine and cutover coordinator
// ABOUTME: Variants carry enough context for a Failed migration to explain itself

use std::fmt;

use crate::context::{CutoverPhase, Stage};

pub type Result<T> = std::result::Result<T, MigratorError>;

#[derive(Debug, Clone, PartialEq)]
pub enum MigratorError {
    /// Network-level failure that is worth retrying (closed socket, admin shutdown,
    /// serialization failure, lock timeout).
    TransientConnection(String),
    /// Connection or query failure that retrying will not fix.
    Connection(String),
    PreconditionViolation {
        stage: Stage,
        reason: String,
    },
    PartialBatchFailure {
        completed: Vec<String>,
        remaining: Vec<String>,
        cause: String,
    },
    IrreversibleStageFailure {
        phase: CutoverPhase,
        diagnostic: String,
    },
    /// Cutover gave up before the point of no return; the source was unfrozen.
    CutoverAborted {
        phase: CutoverPhase,
        reason: String,
    },
    StaleRevision {
        pair: String,
        expected: u64,
        found: u64,
    },
    NotFound(String),
    Validation(String),
    Store(String),
    Router(String),
    Timeout(String),
    Cancelled,
}

impl MigratorError {
    pub fn precondition(stage: Stage, reason: impl Into<String>) -> Self {
        MigratorError::PreconditionViolation {
            stage,
            reason: reason.into(),
        }
    }

    /// Whether the connection gateway should retry the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MigratorError::TransientConnection(_) | MigratorError::Timeout(_)
        )
    }

    /// Errors after which a context must move to `Failed`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigratorError::PreconditionViolation { .. }
                | MigratorError::IrreversibleStageFailure { .. }
        )
    }
}

impl fmt::Display for MigratorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MigratorError::TransientConnection(msg) => {
                write!(f, "Transient connection error: {}", msg)
            }
            MigratorError::Connection(msg) => write!(f, "Connection error: {}", msg),
            MigratorError::PreconditionViolation { stage, reason } => {
                write!(f, "Precondition violated at stage {}: {}", stage, reason)
            }
            MigratorError::PartialBatchFailure {
                completed,
                remaining,
                cause,
            } => write!(
                f,
                "Batch partially applied ({} done, {} remaining): {}",
                completed.len(),
                remaining.len(),
                cause
            ),
            MigratorError::IrreversibleStageFailure { phase, diagnostic } => write!(
                f,
                "Cutover failed at {} (past point of no return, operator action required): {}",
                phase, diagnostic
            ),
            MigratorError::CutoverAborted { phase, reason } => write!(
                f,
                "Cutover aborted during {}, source writes restored: {}",
                phase, reason
            ),
            MigratorError::StaleRevision {
                pair,
                expected,
                found,
            } => write!(
                f,
                "Lost update on {}: expected revision {}, store has {}",
                pair, expected, found
            ),
            MigratorError::NotFound(what) => write!(f, "Not found: {}", what),
            MigratorError::Validation(msg) => write!(f, "Validation error: {}", msg),
            MigratorError::Store(msg) => write!(f, "State store error: {}", msg),
            MigratorError::Router(msg) => write!(f, "Traffic router error: {}", msg),
            MigratorError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            MigratorError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for MigratorError {}

impl From<tokio_postgres::Error> for MigratorError {
    fn from(err: tokio_postgres::Error) -> Self {
        if is_transient_pg_error(&err) {
            MigratorError::TransientConnection(err.to_string())
        } else {
            MigratorError::Connection(describe_pg_error(&err))
        }
    }
}

impl From<rusqlite::Error> for MigratorError {
    fn from(err: rusqlite::Error) -> Self {
        MigratorError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for MigratorError {
    fn from(err: serde_json::Error) -> Self {
        MigratorError::Store(format!("corrupt record: {}", err))
    }
}

fn is_transient_pg_error(err: &tokio_postgres::Error) -> bool {
    pg_failure_is_transient(
        err.is_closed(),
        err.code().map(|code| code.code()),
        has_io_cause(err),
    )
}

/// Class 08 connection exceptions, shutdown, serialization, lock and statement-timeout
/// SQLSTATEs are retried, as are a closed connection and I/O failures. Anything else
/// without a SQLSTATE (row decoding, type conversion, bad configuration) is permanent.
fn pg_failure_is_transient(closed: bool, sqlstate: Option<&str>, io_cause: bool) -> bool {
    if closed || io_cause {
        return true;
    }
    match sqlstate {
        Some(code) => {
            code.starts_with("08")
                || matches!(
                    code,
                    "57P01" | "57P02" | "57P03" | "40001" | "40P01" | "55P03" | "57014" | "53300"
                )
        }
        None => false,
    }
}

fn has_io_cause(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cause = err.source();
    while let Some(inner) = cause {
        if inner.is::<std::io::Error>() {
            return true;
        }
        cause = inner.source();
    }
    false
}

fn describe_pg_error(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => match db.detail() {
            Some(detail) => format!("{} ({}): {}", db.message(), db.code().code(), detail),
            None => format!("{} ({})", db.message(), db.code().code()),
        },
        None => err.to_string(),
    }
}

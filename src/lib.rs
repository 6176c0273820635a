// ABOUTME: Library root for the pglogical cutover orchestrator
// ABOUTME: Stages a source->target migration through pglogical and switches traffic over with guards

pub mod config;
pub mod context;
pub mod coordinator;
pub mod cutover;
pub mod error;
pub mod gateway;
pub mod lsn;
pub mod machine;
pub mod monitor;
pub mod remote;
pub mod replication;
pub mod schema;
pub mod store;

pub use config::{Config, Dsn};
pub use context::{CutoverPhase, MigrationContext, Stage, SyncState};
pub use coordinator::{MigrationStatus, Orchestrator};
pub use error::{MigratorError, Result};
pub use lsn::Lsn;
pub use machine::Advance;

// ABOUTME: Data model for one source->target migration pair and its monitoring output
// ABOUTME: Stage lifecycle, cutover sub-phases, per-table sync status and lag snapshots

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Dsn, FilterConfig};
use crate::error::MigratorError;
use crate::lsn::Lsn;

/// Lifecycle of a migration pair. Declaration order is the forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Uninitialized,
    SchemaSynced,
    NodesProvisioned,
    SetPopulating,
    InitialSyncing,
    SteadyState,
    CutoverInProgress,
    CutoverComplete,
    TornDown,
    Failed,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::Uninitialized,
        Stage::SchemaSynced,
        Stage::NodesProvisioned,
        Stage::SetPopulating,
        Stage::InitialSyncing,
        Stage::SteadyState,
        Stage::CutoverInProgress,
        Stage::CutoverComplete,
        Stage::TornDown,
        Stage::Failed,
    ];

    /// The single forward successor, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Uninitialized => Some(Stage::SchemaSynced),
            Stage::SchemaSynced => Some(Stage::NodesProvisioned),
            Stage::NodesProvisioned => Some(Stage::SetPopulating),
            Stage::SetPopulating => Some(Stage::InitialSyncing),
            Stage::InitialSyncing => Some(Stage::SteadyState),
            Stage::SteadyState => Some(Stage::CutoverInProgress),
            Stage::CutoverInProgress => Some(Stage::CutoverComplete),
            Stage::CutoverComplete => Some(Stage::TornDown),
            Stage::TornDown | Stage::Failed => None,
        }
    }

    /// Valid transitions:
    /// - every stage to its forward successor
    /// - every non-terminal stage to `Failed`
    /// - `CutoverInProgress` back to `SteadyState` (cutover aborted before the pointer flip)
    pub fn can_transition_to(&self, to: Stage) -> bool {
        match (self, to) {
            (s, n) if *s == n => false,
            (s, Stage::Failed) => !s.is_terminal(),
            (Stage::CutoverInProgress, Stage::SteadyState) => true,
            (s, n) => s.next() == Some(n),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::TornDown | Stage::Failed)
    }

    /// Stages during which the status monitor polls.
    pub fn is_monitored(&self) -> bool {
        matches!(self, Stage::InitialSyncing | Stage::SteadyState)
    }

    /// Stages owned by the cutover coordinator rather than `advance`.
    pub fn is_cutover(&self) -> bool {
        matches!(self, Stage::CutoverInProgress | Stage::CutoverComplete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Uninitialized => "uninitialized",
            Stage::SchemaSynced => "schema-synced",
            Stage::NodesProvisioned => "nodes-provisioned",
            Stage::SetPopulating => "set-populating",
            Stage::InitialSyncing => "initial-syncing",
            Stage::SteadyState => "steady-state",
            Stage::CutoverInProgress => "cutover-in-progress",
            Stage::CutoverComplete => "cutover-complete",
            Stage::TornDown => "torn-down",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = MigratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == wanted)
            .ok_or_else(|| MigratorError::Validation(format!("unknown stage '{}'", s)))
    }
}

/// Sub-state machine nested inside `CutoverInProgress`/`CutoverComplete`.
///
/// `PointerFlip` is the point of no return: phases from there on are never
/// unwound automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum CutoverPhase {
    PreCheck,
    FreezeSource,
    DrainVerify { frozen_lsn: Lsn },
    PointerFlip { frozen_lsn: Lsn },
    PostVerify { frozen_lsn: Lsn, redirect_ack: String },
    TeardownSource { frozen_lsn: Lsn },
}

impl CutoverPhase {
    pub fn is_past_point_of_no_return(&self) -> bool {
        match self {
            CutoverPhase::PreCheck
            | CutoverPhase::FreezeSource
            | CutoverPhase::DrainVerify { .. } => false,
            CutoverPhase::PointerFlip { .. }
            | CutoverPhase::PostVerify { .. }
            | CutoverPhase::TeardownSource { .. } => true,
        }
    }

    pub fn frozen_lsn(&self) -> Option<Lsn> {
        match self {
            CutoverPhase::PreCheck | CutoverPhase::FreezeSource => None,
            CutoverPhase::DrainVerify { frozen_lsn }
            | CutoverPhase::PointerFlip { frozen_lsn }
            | CutoverPhase::PostVerify { frozen_lsn, .. }
            | CutoverPhase::TeardownSource { frozen_lsn } => Some(*frozen_lsn),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CutoverPhase::PreCheck => "PreCheck",
            CutoverPhase::FreezeSource => "FreezeSource",
            CutoverPhase::DrainVerify { .. } => "DrainVerify",
            CutoverPhase::PointerFlip { .. } => "PointerFlip",
            CutoverPhase::PostVerify { .. } => "PostVerify",
            CutoverPhase::TeardownSource { .. } => "TeardownSource",
        }
    }
}

impl fmt::Display for CutoverPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frozen_lsn() {
            Some(lsn) => write!(f, "{} (frozen at {})", self.name(), lsn),
            None => f.write_str(self.name()),
        }
    }
}

/// Table privileges the source freeze takes away.
pub const WRITE_PRIVILEGES: [&str; 4] = ["INSERT", "UPDATE", "DELETE", "TRUNCATE"];

/// Write privileges held directly, by table and then role.
pub type WriteGrants = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

/// Verification tokens of both ends, taken once the target has applied up to the
/// frozen position and before traffic moves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrozenSnapshot {
    pub source: BTreeMap<String, VerificationToken>,
    pub target: BTreeMap<String, VerificationToken>,
}

impl FrozenSnapshot {
    /// One line per table whose tokens differ or are missing on either end.
    pub fn mismatches<'a>(&self, tables: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        tables
            .into_iter()
            .filter_map(|table| {
                let source = self.source.get(table);
                let target = self.target.get(table);
                if source.is_some() && source == target {
                    return None;
                }
                Some(format!(
                    "{}: source {}, target {}",
                    table,
                    describe_token(source),
                    describe_token(target)
                ))
            })
            .collect()
    }
}

fn describe_token(token: Option<&VerificationToken>) -> String {
    match token {
        Some(VerificationToken {
            row_count,
            checksum: Some(checksum),
        }) => format!("{} rows ({})", row_count, checksum),
        Some(VerificationToken { row_count, .. }) => format!("{} rows", row_count),
        None => "no token".into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutoverState {
    pub phase: CutoverPhase,
    pub started_at: DateTime<Utc>,
    /// Set by an operator reset; allows a phase past the point of no return to be re-entered once.
    #[serde(default)]
    pub operator_resumed: bool,
    /// Source write grants of the frozen roles, recorded before the revoke and restored
    /// exactly when the cutover unwinds.
    #[serde(default)]
    pub source_grants: WriteGrants,
    #[serde(default)]
    pub snapshot: Option<FrozenSnapshot>,
}

impl CutoverState {
    pub fn new(phase: CutoverPhase, source_grants: WriteGrants) -> Self {
        Self {
            phase,
            started_at: Utc::now(),
            operator_resumed: false,
            source_grants,
            snapshot: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Initializing,
    Synchronizing,
    Synchronized,
    Error,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Initializing => "initializing",
            SyncState::Synchronizing => "synchronizing",
            SyncState::Synchronized => "synchronized",
            SyncState::Error => "error",
        };
        f.pad(s)
    }
}

/// Modification counters captured when a table first reported ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterBaseline {
    pub source: u64,
    pub target: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationToken {
    pub row_count: i64,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSyncStatus {
    pub table: String,
    pub state: SyncState,
    pub clean_polls: u32,
    pub pending_changes: u64,
    pub baseline: Option<CounterBaseline>,
    pub verified: Option<VerificationToken>,
}

impl TableSyncStatus {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            state: SyncState::Initializing,
            clean_polls: 0,
            pending_changes: 0,
            baseline: None,
            verified: None,
        }
    }
}

/// Point-in-time replication lag. Never mutated; newer snapshots replace it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagSnapshot {
    source_lsn: Lsn,
    applied_lsn: Lsn,
    wal_lag_bytes: u64,
    time_lag_secs: Option<f64>,
    taken_at: DateTime<Utc>,
}

impl LagSnapshot {
    pub fn new(
        source_lsn: Lsn,
        applied_lsn: Lsn,
        time_lag_secs: Option<f64>,
        taken_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_lsn,
            applied_lsn,
            wal_lag_bytes: applied_lsn.bytes_behind(source_lsn),
            time_lag_secs,
            taken_at,
        }
    }

    pub fn source_lsn(&self) -> Lsn {
        self.source_lsn
    }

    pub fn applied_lsn(&self) -> Lsn {
        self.applied_lsn
    }

    pub fn wal_lag_bytes(&self) -> u64 {
        self.wal_lag_bytes
    }

    pub fn time_lag_secs(&self) -> Option<f64> {
        self.time_lag_secs
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now.signed_duration_since(self.taken_at) <= window
    }
}

/// Latest status monitor output for one pair. Stored beside, not inside, the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorReport {
    pub pair_id: String,
    pub tables: BTreeMap<String, TableSyncStatus>,
    pub lag: Option<LagSnapshot>,
    pub subscription_down: bool,
    pub polls: u64,
    pub polled_at: DateTime<Utc>,
}

impl MonitorReport {
    pub fn all_synchronized(&self, tracked: &BTreeSet<String>) -> bool {
        !tracked.is_empty()
            && tracked.iter().all(|table| {
                self.tables
                    .get(table)
                    .map(|status| status.state == SyncState::Synchronized)
                    .unwrap_or(false)
            })
    }

    pub fn tables_in(&self, state: SyncState) -> Vec<String> {
        self.tables
            .values()
            .filter(|status| status.state == state)
            .map(|status| status.table.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Stage the context was in when the failure happened.
    pub stage: Stage,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextOptions {
    pub copy_schema: bool,
    pub verify_checksums: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationContext {
    pub pair_id: String,
    pub source_dsn: Dsn,
    pub target_dsn: Dsn,
    /// Source as reached from the target; used by the subscription.
    pub provider_dsn: Dsn,
    pub stage: Stage,
    pub tables: BTreeSet<String>,
    pub sequences: BTreeSet<String>,
    /// Tracked tables confirmed as replication set members.
    pub set_tables: BTreeSet<String>,
    pub set_sequences: BTreeSet<String>,
    pub frozen_roles: Vec<String>,
    pub options: ContextOptions,
    pub cutover: Option<CutoverState>,
    pub paused: bool,
    pub last_error: Option<FailureRecord>,
    pub fingerprint: String,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationContext {
    pub fn pending_tables(&self) -> Vec<String> {
        self.tables.difference(&self.set_tables).cloned().collect()
    }

    pub fn pending_sequences(&self) -> Vec<String> {
        self.sequences
            .difference(&self.set_sequences)
            .cloned()
            .collect()
    }

    pub fn is_fully_populated(&self) -> bool {
        self.pending_tables().is_empty() && self.pending_sequences().is_empty()
    }

    pub fn cutover_phase(&self) -> Option<&CutoverPhase> {
        self.cutover.as_ref().map(|state| &state.phase)
    }
}

/// Which objects a new migration tracks.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectSelection {
    Explicit(Vec<String>),
    /// Discover objects in the schema on the source, then filter.
    Discover(FilterConfig),
}

/// Operator request to create a migration pair.
#[derive(Debug, Clone)]
pub struct NewMigration {
    pub pair_id: String,
    pub source_dsn: Dsn,
    pub target_dsn: Dsn,
    pub provider_dsn: Dsn,
    pub schema_name: String,
    pub tables: ObjectSelection,
    pub sequences: ObjectSelection,
    pub frozen_roles: Vec<String>,
    pub options: ContextOptions,
}

/// Qualify a bare relation name with `schema`; already-qualified names pass through.
pub fn qualify(schema: &str, name: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("{}.{}", schema, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_order_is_declaration_order() {
        let mut stage = Stage::Uninitialized;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            seen.push(next);
            stage = next;
        }
        assert_eq!(stage, Stage::TornDown);
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn test_transitions() {
        assert!(Stage::SetPopulating.can_transition_to(Stage::InitialSyncing));
        assert!(!Stage::SetPopulating.can_transition_to(Stage::SteadyState));
        assert!(!Stage::SteadyState.can_transition_to(Stage::SetPopulating));
        assert!(Stage::SteadyState.can_transition_to(Stage::Failed));
        assert!(Stage::CutoverInProgress.can_transition_to(Stage::SteadyState));
        assert!(!Stage::CutoverComplete.can_transition_to(Stage::SteadyState));
        assert!(!Stage::Failed.can_transition_to(Stage::Uninitialized));
        assert!(!Stage::TornDown.can_transition_to(Stage::Failed));
    }

    #[test]
    fn test_stage_parse() {
        assert_eq!("steady-state".parse::<Stage>().unwrap(), Stage::SteadyState);
        assert_eq!("SET_POPULATING".parse::<Stage>().unwrap(), Stage::SetPopulating);
        assert!("nonsense".parse::<Stage>().is_err());
    }

    #[test]
    fn test_point_of_no_return() {
        let lsn = Lsn(42);
        assert!(!CutoverPhase::FreezeSource.is_past_point_of_no_return());
        assert!(!CutoverPhase::DrainVerify { frozen_lsn: lsn }.is_past_point_of_no_return());
        assert!(CutoverPhase::PointerFlip { frozen_lsn: lsn }.is_past_point_of_no_return());
        assert!(CutoverPhase::TeardownSource { frozen_lsn: lsn }.is_past_point_of_no_return());
    }

    #[test]
    fn test_lag_snapshot_freshness() {
        let taken = Utc::now();
        let snap = LagSnapshot::new(Lsn(1000), Lsn(400), None, taken);
        assert_eq!(snap.wal_lag_bytes(), 600);
        assert!(snap.is_fresh(taken + Duration::seconds(30), Duration::seconds(60)));
        assert!(!snap.is_fresh(taken + Duration::seconds(61), Duration::seconds(60)));
    }

    #[test]
    fn test_snapshot_mismatches() {
        let token = |rows| VerificationToken {
            row_count: rows,
            checksum: None,
        };
        let tables: Vec<String> = vec!["public.a".into(), "public.b".into(), "public.c".into()];
        let snapshot = FrozenSnapshot {
            source: BTreeMap::from([
                ("public.a".to_string(), token(10)),
                ("public.b".to_string(), token(10)),
            ]),
            target: BTreeMap::from([
                ("public.a".to_string(), token(10)),
                ("public.b".to_string(), token(9)),
            ]),
        };
        let mismatches = snapshot.mismatches(&tables);
        assert_eq!(
            mismatches,
            vec![
                "public.b: source 10 rows, target 9 rows".to_string(),
                "public.c: source no token, target no token".to_string(),
            ]
        );
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualify("public", "users"), "public.users");
        assert_eq!(qualify("public", "billing.invoices"), "billing.invoices");
    }
}

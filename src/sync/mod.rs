//! Sync Module - Accounting Ledger Reconciliation
//!
//! Bidirectional reconciliation between the ERP's local records and the
//! external accounting ledger:
//! - Paginated pulls per entity type with rate-limit backoff
//! - Content-hash conflict detection and explicit resolution
//! - Pull-only accommodation: invoice creation requests become work items
//! - Append-only audit log with a cached dashboard aggregation
//!
//! Scheduling model: one sequential worker per run; runs for different
//! entity types may execute concurrently, runs for the same entity type
//! are mutually exclusive (guarded through the log store).

pub mod conflict;
pub mod dashboard;
pub mod logger;
pub mod manager;
pub mod pull;
pub mod request;
pub mod scheduler;
pub mod state;


use crate::db::DbError;
use crate::ledger::{LedgerError, ValidationError};
use crate::oauth::OAuthError;
use serde::{Deserialize, Serialize};

// Re-export commonly used types
pub use conflict::{ConflictResolver, ConflictStatus, Resolution, SyncConflict};
pub use dashboard::{
    DashboardAggregator, DashboardData, DashboardQuery, DashboardSummary, DashboardView,
    EntityBreakdown, Pagination,
};
pub use logger::{SyncDirection, SyncLogEntry, SyncLogger, SyncRunStatus};
pub use manager::{PullAllResult, SyncManager};
pub use pull::{
    ContactPullHandler, InvoicePullHandler, PaymentPullHandler, PullHandler, PullOptions,
    PullOutcome, PullService, PullStats, RecordOutcome,
};
pub use request::{InvoiceRequest, RequestOutcome, RequestService};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
pub use state::{SyncState, SyncStateStatus, SyncStateTracker};

// ============================================================================
// Entity Types
// ============================================================================

/// The ledger entity types the engine reconciles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncEntity {
    Contact,
    Invoice,
    Payment,
}

impl SyncEntity {
    pub const ALL: [SyncEntity; 3] = [SyncEntity::Contact, SyncEntity::Invoice, SyncEntity::Payment];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEntity::Contact => "contact",
            SyncEntity::Invoice => "invoice",
            SyncEntity::Payment => "payment",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, SyncError> {
        match s {
            "contact" => Ok(SyncEntity::Contact),
            "invoice" => Ok(SyncEntity::Invoice),
            "payment" => Ok(SyncEntity::Payment),
            _ => Err(SyncError::UnknownEntity(s.to_string())),
        }
    }
}

impl std::fmt::Display for SyncEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("OAuth error: {0}")]
    OAuth(#[from] OAuthError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Record validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("A {0} sync is already in progress")]
    RunInProgress(SyncEntity),

    #[error("No pending conflict for {entity} {entity_id}")]
    ConflictNotFound { entity: SyncEntity, entity_id: String },

    #[error("Invalid resolution '{0}' (expected use_local, use_remote or manual)")]
    InvalidResolution(String),

    #[error("Manual resolution requires merged record data")]
    MissingManualData,

    #[error("Unknown sync entity '{0}'")]
    UnknownEntity(String),

    #[error("Sync log entry not found: {0}")]
    LogEntryNotFound(String),
}

impl From<DbError> for SyncError {
    fn from(e: DbError) -> Self {
        SyncError::Database(e.to_string())
    }
}

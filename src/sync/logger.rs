//! Sync Logger - append-only audit trail of sync runs
//!
//! Every pull, push or request creates a log entry at run start
//! (`in_progress`), is updated in place as pages complete, and is finalized
//! with aggregate counts. Entries are only ever removed by the retention
//! purge, which never touches `error` entries.

use super::{SyncEntity, SyncError};
use crate::db::Database;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// A run stuck in_progress longer than this is considered stale
pub const STALE_RUN_MINUTES: i64 = 30;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Pull,
    Push,
    Both,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Pull => "pull",
            SyncDirection::Push => "push",
            SyncDirection::Both => "both",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "push" => SyncDirection::Push,
            "both" => SyncDirection::Both,
            _ => SyncDirection::Pull,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    InProgress,
    Success,
    Warning,
    Error,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::InProgress => "in_progress",
            SyncRunStatus::Success => "success",
            SyncRunStatus::Warning => "warning",
            SyncRunStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "success" => SyncRunStatus::Success,
            "warning" => SyncRunStatus::Warning,
            "error" => SyncRunStatus::Error,
            _ => SyncRunStatus::InProgress,
        }
    }
}

/// One audit entry for a sync run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub direction: SyncDirection,
    /// Entity label: "contact", "invoice", "payment", "invoice_request"
    pub entity: String,
    pub status: SyncRunStatus,
    pub records_processed: i64,
    pub records_succeeded: i64,
    pub records_failed: i64,
    pub message: Option<String>,
    /// Collected per-record errors / structured context, JSON
    pub details: Option<String>,
    pub duration_ms: Option<i64>,
}

// ============================================================================
// Logger
// ============================================================================

/// Owns the sync_logs table
#[derive(Clone)]
pub struct SyncLogger {
    db: Arc<Database>,
}

impl SyncLogger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create an in_progress entry for a starting run, returning its id
    pub fn start_run(
        &self,
        user_id: Option<&str>,
        direction: SyncDirection,
        entity: &str,
    ) -> Result<String, SyncError> {
        let id = Uuid::new_v4().to_string();

        self.db.execute(
            "INSERT INTO sync_logs (id, timestamp, user_id, direction, entity, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'in_progress')",
            params![
                id,
                Utc::now().to_rfc3339(),
                user_id,
                direction.as_str(),
                entity,
            ],
        )?;

        log::info!("Sync run {} started ({} {})", id, direction.as_str(), entity);
        Ok(id)
    }

    /// Update running counts mid-run
    pub fn update_counts(
        &self,
        log_id: &str,
        processed: i64,
        succeeded: i64,
        failed: i64,
    ) -> Result<(), SyncError> {
        let updated = self.db.execute(
            "UPDATE sync_logs SET records_processed = ?2, records_succeeded = ?3,
                                  records_failed = ?4
             WHERE id = ?1",
            params![log_id, processed, succeeded, failed],
        )?;

        if updated == 0 {
            return Err(SyncError::LogEntryNotFound(log_id.to_string()));
        }
        Ok(())
    }

    /// Finalize a run with its aggregate outcome
    #[allow(clippy::too_many_arguments)]
    pub fn finalize_run(
        &self,
        log_id: &str,
        status: SyncRunStatus,
        processed: i64,
        succeeded: i64,
        failed: i64,
        message: &str,
        details: Option<&str>,
        duration_ms: i64,
    ) -> Result<(), SyncError> {
        let updated = self.db.execute(
            "UPDATE sync_logs SET status = ?2, records_processed = ?3,
                                  records_succeeded = ?4, records_failed = ?5,
                                  message = ?6, details = ?7, duration_ms = ?8
             WHERE id = ?1",
            params![
                log_id,
                status.as_str(),
                processed,
                succeeded,
                failed,
                message,
                details,
                duration_ms,
            ],
        )?;

        if updated == 0 {
            return Err(SyncError::LogEntryNotFound(log_id.to_string()));
        }

        log::info!(
            "Sync run {} finalized: {} ({} processed, {} succeeded, {} failed)",
            log_id,
            status.as_str(),
            processed,
            succeeded,
            failed
        );
        Ok(())
    }

    pub fn get_entry(&self, log_id: &str) -> Result<Option<SyncLogEntry>, SyncError> {
        Ok(self.db.query_opt(
            &format!("{} WHERE id = ?1", SELECT_LOG_ENTRY),
            params![log_id],
            map_entry,
        )?)
    }

    /// Whether a non-stale run is currently in progress for an entity.
    /// Used as the per-entity-type mutual-exclusion guard.
    pub fn has_active_run(&self, entity: SyncEntity) -> Result<bool, SyncError> {
        let cutoff = (Utc::now() - Duration::minutes(STALE_RUN_MINUTES)).to_rfc3339();
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM sync_logs
             WHERE entity = ?1 AND status = 'in_progress' AND timestamp >= ?2",
            params![entity.as_str(), cutoff],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Close orphaned in_progress entries older than `max_age_minutes`.
    /// Returns the number of entries finalized.
    pub fn finalize_stale_runs(&self, max_age_minutes: i64) -> Result<usize, SyncError> {
        let cutoff = (Utc::now() - Duration::minutes(max_age_minutes)).to_rfc3339();

        let updated = self.db.execute(
            "UPDATE sync_logs
             SET status = 'error', message = 'Run did not finalize within the expected window'
             WHERE status = 'in_progress' AND timestamp < ?1",
            params![cutoff],
        )?;

        if updated > 0 {
            log::warn!("Finalized {} stale in_progress sync runs", updated);
        }
        Ok(updated)
    }

    /// Retention purge: delete entries older than `retention_days`,
    /// always excluding error entries.
    pub fn purge_old_entries(&self, retention_days: i64) -> Result<usize, SyncError> {
        let cutoff = (Utc::now() - Duration::days(retention_days)).to_rfc3339();

        let deleted = self.db.execute(
            "DELETE FROM sync_logs WHERE timestamp < ?1 AND status != 'error'",
            params![cutoff],
        )?;

        log::info!(
            "Purged {} sync log entries older than {} days",
            deleted,
            retention_days
        );
        Ok(deleted)
    }
}

pub(crate) const SELECT_LOG_ENTRY: &str = "SELECT id, timestamp, user_id, direction, entity, status,
            records_processed, records_succeeded, records_failed,
            message, details, duration_ms
     FROM sync_logs";

pub(crate) fn map_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncLogEntry> {
    Ok(SyncLogEntry {
        id: row.get(0)?,
        timestamp: DateTime::parse_from_rfc3339(&row.get::<_, String>(1)?)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        user_id: row.get(2)?,
        direction: SyncDirection::from_str(&row.get::<_, String>(3)?),
        entity: row.get(4)?,
        status: SyncRunStatus::from_str(&row.get::<_, String>(5)?),
        records_processed: row.get(6)?,
        records_succeeded: row.get(7)?,
        records_failed: row.get(8)?,
        message: row.get(9)?,
        details: row.get(10)?,
        duration_ms: row.get(11)?,
    })
}

// ============================================================================
// Tests
// ============================================================================

//! Sync State Tracker - per-entity reconciliation status
//!
//! One row per local business entity, keyed by (entity, entity_id):
//! the last-known local and remote content hashes and whether the pair
//! is synced, pending or in conflict. Divergence is detected by comparing
//! SHA-256 hashes of the canonical JSON form of the mapped record.

use super::{SyncEntity, SyncError};
use crate::db::Database;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Reconciliation status for one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStateStatus {
    Synced,
    Pending,
    Conflict,
}

impl SyncStateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStateStatus::Synced => "synced",
            SyncStateStatus::Pending => "pending",
            SyncStateStatus::Conflict => "conflict",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "synced" => SyncStateStatus::Synced,
            "conflict" => SyncStateStatus::Conflict,
            _ => SyncStateStatus::Pending,
        }
    }
}

/// Tracked state for one (entity, entity_id) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub entity: SyncEntity,
    pub entity_id: String,
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub status: SyncStateStatus,
    pub updated_at: DateTime<Utc>,
}

/// SHA-256 over the canonical JSON form of a record
pub fn content_hash<T: Serialize>(value: &T) -> String {
    let json = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&json);
    hex::encode(hasher.finalize())
}

/// Owns the sync_state table
#[derive(Clone)]
pub struct SyncStateTracker {
    db: Arc<Database>,
}

impl SyncStateTracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get(&self, entity: SyncEntity, entity_id: &str) -> Result<Option<SyncState>, SyncError> {
        let state = self.db.query_opt(
            "SELECT entity, entity_id, local_hash, remote_hash, status, updated_at
             FROM sync_state WHERE entity = ?1 AND entity_id = ?2",
            params![entity.as_str(), entity_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )?;

        match state {
            Some((entity_raw, entity_id, local_hash, remote_hash, status, updated_at)) => {
                Ok(Some(SyncState {
                    entity: SyncEntity::from_str(&entity_raw)?,
                    entity_id,
                    local_hash,
                    remote_hash,
                    status: SyncStateStatus::from_str(&status),
                    updated_at: DateTime::parse_from_rfc3339(&updated_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                }))
            }
            None => Ok(None),
        }
    }

    /// Record both sides as reconciled at the given hash
    pub fn mark_synced(
        &self,
        entity: SyncEntity,
        entity_id: &str,
        hash: &str,
    ) -> Result<(), SyncError> {
        self.upsert(
            entity,
            entity_id,
            Some(hash),
            Some(hash),
            SyncStateStatus::Synced,
        )
    }

    /// Record divergent local and remote hashes
    pub fn mark_conflict(
        &self,
        entity: SyncEntity,
        entity_id: &str,
        local_hash: &str,
        remote_hash: &str,
    ) -> Result<(), SyncError> {
        self.upsert(
            entity,
            entity_id,
            Some(local_hash),
            Some(remote_hash),
            SyncStateStatus::Conflict,
        )
    }

    pub fn upsert(
        &self,
        entity: SyncEntity,
        entity_id: &str,
        local_hash: Option<&str>,
        remote_hash: Option<&str>,
        status: SyncStateStatus,
    ) -> Result<(), SyncError> {
        self.db.execute(
            "INSERT INTO sync_state (entity, entity_id, local_hash, remote_hash, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(entity, entity_id) DO UPDATE SET
                local_hash = excluded.local_hash,
                remote_hash = excluded.remote_hash,
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![
                entity.as_str(),
                entity_id,
                local_hash,
                remote_hash,
                status.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Number of entities currently in conflict (dashboard counter)
    pub fn count_conflicted(&self) -> Result<i64, SyncError> {
        Ok(self.db.query_row(
            "SELECT COUNT(*) FROM sync_state WHERE status = 'conflict'",
            [],
            |row| row.get(0),
        )?)
    }
}

// ============================================================================
// Tests
// ============================================================================

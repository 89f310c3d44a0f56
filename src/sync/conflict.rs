//! Conflict Resolver - explicit resolution of diverged entities
//!
//! A conflict is opened by the pull service when the local and remote
//! versions of an entity carry different content hashes. It stays pending
//! until an operator picks the surviving side (or supplies a manual merge);
//! a resolved conflict can never be resolved again.

use super::state::{content_hash, SyncStateTracker};
use super::{SyncEntity, SyncError};
use crate::db::{Database, LocalContact, LocalInvoice, LocalPayment};
use crate::ledger::LedgerClient;
use crate::oauth::OAuthSessionManager;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Pending => "pending",
            ConflictStatus::Resolved => "resolved",
        }
    }
}

/// Which side survives a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    UseLocal,
    UseRemote,
    Manual,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::UseLocal => "use_local",
            Resolution::UseRemote => "use_remote",
            Resolution::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, SyncError> {
        match s {
            "use_local" => Ok(Resolution::UseLocal),
            "use_remote" => Ok(Resolution::UseRemote),
            "manual" => Ok(Resolution::Manual),
            other => Err(SyncError::InvalidResolution(other.to_string())),
        }
    }
}

/// A recorded divergence between the local and remote version of an entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    pub entity: SyncEntity,
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub local_data: serde_json::Value,
    pub remote_data: serde_json::Value,
    pub status: ConflictStatus,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Conflict store
// ============================================================================

/// Open a pending conflict for (entity, entity_id), or return the id of the
/// one already pending. At most one pending conflict exists per entity key.
pub fn open_conflict(
    db: &Database,
    entity: SyncEntity,
    entity_id: &str,
    entity_name: Option<&str>,
    local_data: &serde_json::Value,
    remote_data: &serde_json::Value,
) -> Result<String, SyncError> {
    if let Some(existing) = pending_conflict(db, entity, entity_id)? {
        // Refresh the remote side so the operator always resolves against
        // the latest pulled version
        db.execute(
            "UPDATE sync_conflicts SET remote_data = ?2 WHERE id = ?1",
            params![existing.id, remote_data.to_string()],
        )?;
        return Ok(existing.id);
    }

    let id = Uuid::new_v4().to_string();
    db.execute(
        "INSERT INTO sync_conflicts (id, entity, entity_id, entity_name,
                                     local_data, remote_data, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
        params![
            id,
            entity.as_str(),
            entity_id,
            entity_name,
            local_data.to_string(),
            remote_data.to_string(),
            Utc::now().to_rfc3339(),
        ],
    )?;

    log::warn!(
        "Conflict opened for {} {} ({})",
        entity,
        entity_id,
        entity_name.unwrap_or("unnamed")
    );
    Ok(id)
}

/// The pending conflict for an entity key, if any
pub fn pending_conflict(
    db: &Database,
    entity: SyncEntity,
    entity_id: &str,
) -> Result<Option<SyncConflict>, SyncError> {
    let row = db.query_opt(
        &format!("{} WHERE entity = ?1 AND entity_id = ?2 AND status = 'pending'", SELECT_CONFLICT),
        params![entity.as_str(), entity_id],
        map_conflict_row,
    )?;
    row.map(parse_conflict).transpose()
}

/// Pending conflicts, newest first (dashboard listing)
pub fn pending_conflicts(db: &Database, limit: u32) -> Result<Vec<SyncConflict>, SyncError> {
    let rows = db.query(
        &format!(
            "{} WHERE status = 'pending' ORDER BY created_at DESC LIMIT ?1",
            SELECT_CONFLICT
        ),
        params![limit],
        map_conflict_row,
    )?;
    rows.into_iter().map(parse_conflict).collect()
}

const SELECT_CONFLICT: &str = "SELECT id, entity, entity_id, entity_name, local_data, remote_data,
            status, resolution, created_at, resolved_at
     FROM sync_conflicts";

type ConflictRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
);

fn map_conflict_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConflictRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn parse_conflict(row: ConflictRow) -> Result<SyncConflict, SyncError> {
    let (id, entity, entity_id, entity_name, local, remote, status, resolution, created, resolved) =
        row;

    Ok(SyncConflict {
        id,
        entity: SyncEntity::from_str(&entity)?,
        entity_id,
        entity_name,
        local_data: serde_json::from_str(&local)
            .map_err(|e| SyncError::Serialization(e.to_string()))?,
        remote_data: serde_json::from_str(&remote)
            .map_err(|e| SyncError::Serialization(e.to_string()))?,
        status: if status == "resolved" {
            ConflictStatus::Resolved
        } else {
            ConflictStatus::Pending
        },
        resolution,
        created_at: parse_ts(&created),
        resolved_at: resolved.as_deref().map(parse_ts),
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// Resolver
// ============================================================================

/// Applies a resolution to a pending conflict and reconciles both stores
pub struct ConflictResolver {
    db: Arc<Database>,
    tracker: SyncStateTracker,
    client: Arc<LedgerClient>,
    oauth: Arc<OAuthSessionManager>,
}

impl ConflictResolver {
    pub fn new(
        db: Arc<Database>,
        client: Arc<LedgerClient>,
        oauth: Arc<OAuthSessionManager>,
    ) -> Self {
        Self {
            tracker: SyncStateTracker::new(db.clone()),
            db,
            client,
            oauth,
        }
    }

    /// Resolve the pending conflict for (entity, entity_id).
    ///
    /// Returns a human-readable summary of what was applied. Fails with
    /// `ConflictNotFound` when no pending conflict exists for the key, so a
    /// second resolution attempt on the same conflict is an error, never a
    /// silent overwrite.
    pub async fn resolve(
        &self,
        entity: SyncEntity,
        entity_id: &str,
        resolution: &str,
        manual_data: Option<serde_json::Value>,
    ) -> Result<String, SyncError> {
        let resolution = Resolution::from_str(resolution)?;

        let conflict = pending_conflict(&self.db, entity, entity_id)?.ok_or(
            SyncError::ConflictNotFound {
                entity,
                entity_id: entity_id.to_string(),
            },
        )?;

        let message = match resolution {
            Resolution::UseLocal => {
                let winning = conflict.local_data.clone();
                self.push_to_ledger(entity, &winning).await?;
                self.mark_resolved(&conflict, resolution, &winning)?;
                format!("Kept local version of {} {}", entity, entity_id)
            }
            Resolution::UseRemote => {
                let winning = conflict.remote_data.clone();
                apply_record(&self.db, entity, &winning)?;
                self.mark_resolved(&conflict, resolution, &winning)?;
                format!("Applied ledger version of {} {}", entity, entity_id)
            }
            Resolution::Manual => {
                let winning = manual_data.ok_or(SyncError::MissingManualData)?;
                apply_record(&self.db, entity, &winning)?;
                // Contacts are writable on the ledger; keep both sides aligned
                if entity == SyncEntity::Contact {
                    self.push_to_ledger(entity, &winning).await?;
                }
                self.mark_resolved(&conflict, resolution, &winning)?;
                format!("Applied merged version of {} {}", entity, entity_id)
            }
        };

        log::info!("{}", message);
        Ok(message)
    }

    /// Write the winning version to the ledger where the provider allows it.
    /// Invoices and payments accept no programmatic writes; the local
    /// version simply stays authoritative on our side.
    async fn push_to_ledger(
        &self,
        entity: SyncEntity,
        winning: &serde_json::Value,
    ) -> Result<(), SyncError> {
        match entity {
            SyncEntity::Contact => {
                let contact: LocalContact = serde_json::from_value(winning.clone())
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                let tokens = self.oauth.ensure_fresh_token().await?;
                self.client.update_contact(&tokens, &contact).await?;
                Ok(())
            }
            SyncEntity::Invoice | SyncEntity::Payment => {
                log::warn!(
                    "Ledger accepts no programmatic {} writes; remote side left unchanged",
                    entity
                );
                Ok(())
            }
        }
    }

    fn mark_resolved(
        &self,
        conflict: &SyncConflict,
        resolution: Resolution,
        winning: &serde_json::Value,
    ) -> Result<(), SyncError> {
        let updated = self.db.execute(
            "UPDATE sync_conflicts SET status = 'resolved', resolution = ?2, resolved_at = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![
                conflict.id,
                resolution.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        if updated == 0 {
            return Err(SyncError::ConflictNotFound {
                entity: conflict.entity,
                entity_id: conflict.entity_id.clone(),
            });
        }

        self.tracker
            .mark_synced(conflict.entity, &conflict.entity_id, &content_hash(winning))?;
        Ok(())
    }
}

/// Deserialize a stored record value and write it to the local store
fn apply_record(
    db: &Database,
    entity: SyncEntity,
    data: &serde_json::Value,
) -> Result<(), SyncError> {
    match entity {
        SyncEntity::Contact => {
            let contact: LocalContact = serde_json::from_value(data.clone())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            db.upsert_contact(&contact)?;
        }
        SyncEntity::Invoice => {
            let invoice: LocalInvoice = serde_json::from_value(data.clone())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            db.upsert_invoice(&invoice)?;
        }
        SyncEntity::Payment => {
            let payment: LocalPayment = serde_json::from_value(data.clone())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            db.upsert_payment(&payment)?;
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::OAuthConfig;
    use crate::sync::state::SyncStateStatus;

    fn resolver_with_db() -> (ConflictResolver, Arc<Database>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let client = Arc::new(LedgerClient::with_base_url(
            "http://localhost:1".to_string(),
        ));
        let oauth = Arc::new(OAuthSessionManager::new(
            OAuthConfig {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                auth_url: "https://auth.example.test/authorize".to_string(),
                token_url: "https://auth.example.test/token".to_string(),
                redirect_uri: "https://erp.example.test/callback".to_string(),
                scopes: vec![],
                tenant_id: "tenant-1".to_string(),
            },
            db.clone(),
        ));
        (ConflictResolver::new(db.clone(), client, oauth), db)
    }

    fn invoice_json(number: &str, due: f64) -> serde_json::Value {
        serde_json::json!({
            "remote_id": "inv-1",
            "invoice_number": number,
            "contact_remote_id": "c-1",
            "status": "AUTHORISED",
            "currency": "AUD",
            "total": 1000.0,
            "amount_due": due,
            "amount_paid": 1000.0 - due,
            "issued_on": "2026-02-01",
            "due_on": "2026-03-01",
            "updated_at": "2026-02-02T00:00:00+00:00"
        })
    }

    #[test]
    fn test_open_conflict_is_idempotent_per_key() {
        let (_resolver, db) = resolver_with_db();
        let local = invoice_json("INV-1", 500.0);
        let remote = invoice_json("INV-1", 250.0);

        let first =
            open_conflict(&db, SyncEntity::Invoice, "inv-1", Some("INV-1"), &local, &remote)
                .unwrap();
        let second =
            open_conflict(&db, SyncEntity::Invoice, "inv-1", Some("INV-1"), &local, &remote)
                .unwrap();

        assert_eq!(first, second);
        assert_eq!(pending_conflicts(&db, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_use_remote_overwrites_local() {
        let (resolver, db) = resolver_with_db();
        let local = invoice_json("INV-1", 500.0);
        let remote = invoice_json("INV-1", 250.0);
        open_conflict(&db, SyncEntity::Invoice, "inv-1", None, &local, &remote).unwrap();

        resolver
            .resolve(SyncEntity::Invoice, "inv-1", "use_remote", None)
            .await
            .unwrap();

        let stored = db.get_invoice_by_remote_id("inv-1").unwrap().unwrap();
        assert_eq!(stored.amount_due, 250.0);

        let state = resolver
            .tracker
            .get(SyncEntity::Invoice, "inv-1")
            .unwrap()
            .unwrap();
        assert_eq!(state.status, SyncStateStatus::Synced);
    }

    #[tokio::test]
    async fn test_second_resolution_fails_with_conflict_not_found() {
        let (resolver, db) = resolver_with_db();
        let local = invoice_json("INV-1", 500.0);
        let remote = invoice_json("INV-1", 250.0);
        open_conflict(&db, SyncEntity::Invoice, "inv-1", None, &local, &remote).unwrap();

        resolver
            .resolve(SyncEntity::Invoice, "inv-1", "use_remote", None)
            .await
            .unwrap();

        let err = resolver
            .resolve(SyncEntity::Invoice, "inv-1", "use_local", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConflictNotFound { .. }));
    }

    #[tokio::test]
    async fn test_unknown_resolution_token_is_rejected() {
        let (resolver, db) = resolver_with_db();
        let local = invoice_json("INV-1", 500.0);
        let remote = invoice_json("INV-1", 250.0);
        open_conflict(&db, SyncEntity::Invoice, "inv-1", None, &local, &remote).unwrap();

        let err = resolver
            .resolve(SyncEntity::Invoice, "inv-1", "keep_both", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidResolution(_)));

        // The conflict is still pending
        assert!(pending_conflict(&db, SyncEntity::Invoice, "inv-1")
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_manual_resolution_requires_data() {
        let (resolver, db) = resolver_with_db();
        let local = invoice_json("INV-1", 500.0);
        let remote = invoice_json("INV-1", 250.0);
        open_conflict(&db, SyncEntity::Invoice, "inv-1", None, &local, &remote).unwrap();

        let err = resolver
            .resolve(SyncEntity::Invoice, "inv-1", "manual", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingManualData));
    }

    #[tokio::test]
    async fn test_manual_resolution_applies_merged_invoice() {
        let (resolver, db) = resolver_with_db();
        let local = invoice_json("INV-1", 500.0);
        let remote = invoice_json("INV-1", 250.0);
        open_conflict(&db, SyncEntity::Invoice, "inv-1", None, &local, &remote).unwrap();

        let merged = invoice_json("INV-1-MERGED", 300.0);
        resolver
            .resolve(SyncEntity::Invoice, "inv-1", "manual", Some(merged))
            .await
            .unwrap();

        let stored = db.get_invoice_by_remote_id("inv-1").unwrap().unwrap();
        assert_eq!(stored.invoice_number.as_deref(), Some("INV-1-MERGED"));
        assert_eq!(stored.amount_due, 300.0);
    }

    #[tokio::test]
    async fn test_use_local_on_pull_only_entity_resolves_locally() {
        let (resolver, db) = resolver_with_db();
        let local = invoice_json("INV-LOCAL", 500.0);
        let remote = invoice_json("INV-REMOTE", 250.0);
        open_conflict(&db, SyncEntity::Invoice, "inv-1", None, &local, &remote).unwrap();

        // No ledger write happens for invoices, so this succeeds offline
        resolver
            .resolve(SyncEntity::Invoice, "inv-1", "use_local", None)
            .await
            .unwrap();

        assert!(pending_conflict(&db, SyncEntity::Invoice, "inv-1")
            .unwrap()
            .is_none());
    }
}

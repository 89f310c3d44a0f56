//! Request Service - pull-only accommodation for ledger writes
//!
//! The provider accepts no programmatic invoice creation, so instead of a
//! remote write this service produces a durable, assignable work item plus
//! a notification for every admin, and records the request in the audit
//! log. A request is never silently dropped.

use super::logger::{SyncDirection, SyncLogger, SyncRunStatus};
use super::SyncError;
use crate::db::{Database, Notification, WorkItem};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Log entity label for manual ledger-write requests
pub const INVOICE_REQUEST_ENTITY: &str = "invoice_request";

/// Details of the invoice an operator must create in the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub customer_name: String,
    pub total_amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

/// What the caller gets back: who was notified and what happens next
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub success: bool,
    pub work_item_id: String,
    pub notified_admins: Vec<String>,
    pub next_steps: Vec<String>,
    pub log_id: String,
}

pub struct RequestService {
    db: Arc<Database>,
    logger: SyncLogger,
}

impl RequestService {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            logger: SyncLogger::new(db.clone()),
            db,
        }
    }

    /// Record an invoice-creation request as a work item, notify admins,
    /// and log it as a push-direction audit entry.
    pub fn request_invoice_creation(
        &self,
        request: &InvoiceRequest,
    ) -> Result<RequestOutcome, SyncError> {
        let started = Instant::now();
        let log_id = self.logger.start_run(
            request.requested_by.as_deref(),
            SyncDirection::Push,
            INVOICE_REQUEST_ENTITY,
        )?;

        let now = Utc::now().to_rfc3339();
        let work_item_id = Uuid::new_v4().to_string();
        let title = format!(
            "Create ledger invoice for {} ({} {:.2})",
            request.customer_name,
            request.currency.as_deref().unwrap_or("AUD"),
            request.total_amount
        );

        let payload = serde_json::to_string(request)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        self.db.insert_work_item(&WorkItem {
            id: work_item_id.clone(),
            title: title.clone(),
            description: request.description.clone(),
            category: "ledger_invoice_request".to_string(),
            status: "open".to_string(),
            assigned_to: None,
            payload: Some(payload),
            created_at: now.clone(),
            updated_at: now.clone(),
        })?;

        let admins = self.db.admin_users()?;
        let mut notified = Vec::with_capacity(admins.len());
        for admin in &admins {
            self.db.insert_notification(&Notification {
                id: Uuid::new_v4().to_string(),
                user_id: admin.id.clone(),
                title: title.clone(),
                body: request.reference.clone(),
                link: Some(format!("/work-items/{}", work_item_id)),
                is_read: false,
                created_at: now.clone(),
            })?;
            notified.push(admin.name.clone());
        }

        if notified.is_empty() {
            log::warn!(
                "Invoice request {} recorded but no admin users exist to notify",
                work_item_id
            );
        }

        self.logger.finalize_run(
            &log_id,
            SyncRunStatus::Success,
            1,
            1,
            0,
            &format!(
                "Invoice creation requested for {}, {} admin(s) notified",
                request.customer_name,
                notified.len()
            ),
            None,
            started.elapsed().as_millis() as i64,
        )?;

        Ok(RequestOutcome {
            success: true,
            work_item_id,
            notified_admins: notified,
            next_steps: vec![
                "Create the invoice in the accounting ledger".to_string(),
                "Run an invoice pull to import the created record".to_string(),
                "Close the work item once the invoice appears locally".to_string(),
            ],
            log_id,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::User;
    use crate::sync::logger::SyncRunStatus;

    fn service_with_admins(count: usize) -> (RequestService, Arc<Database>) {
        let db = Arc::new(Database::in_memory().unwrap());
        for i in 0..count {
            db.insert_user(&User {
                id: format!("admin-{}", i),
                name: format!("Admin {}", i),
                email: format!("admin{}@example.test", i),
                role: "admin".to_string(),
            })
            .unwrap();
        }
        (RequestService::new(db.clone()), db)
    }

    fn sample_request() -> InvoiceRequest {
        InvoiceRequest {
            customer_name: "Meridian Civil".to_string(),
            total_amount: 18750.0,
            currency: Some("AUD".to_string()),
            reference: Some("Progress claim 4".to_string()),
            description: Some("Stage 2 earthworks".to_string()),
            requested_by: Some("user-12".to_string()),
        }
    }

    #[test]
    fn test_request_creates_work_item_and_notifications() {
        let (service, db) = service_with_admins(2);

        let outcome = service.request_invoice_creation(&sample_request()).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.notified_admins.len(), 2);
        assert!(!outcome.next_steps.is_empty());

        let item = db.get_work_item(&outcome.work_item_id).unwrap().unwrap();
        assert_eq!(item.category, "ledger_invoice_request");
        assert_eq!(item.status, "open");
        assert!(item.payload.unwrap().contains("Meridian Civil"));

        assert_eq!(db.count_notifications_for("admin-0").unwrap(), 1);
        assert_eq!(db.count_notifications_for("admin-1").unwrap(), 1);
    }

    #[test]
    fn test_request_is_logged_as_push_entry() {
        let (service, db) = service_with_admins(1);

        let outcome = service.request_invoice_creation(&sample_request()).unwrap();

        let logger = SyncLogger::new(db);
        let entry = logger.get_entry(&outcome.log_id).unwrap().unwrap();
        assert_eq!(entry.entity, INVOICE_REQUEST_ENTITY);
        assert_eq!(entry.status, SyncRunStatus::Success);
        assert_eq!(entry.records_processed, 1);
        assert_eq!(entry.user_id.as_deref(), Some("user-12"));
    }

    #[test]
    fn test_request_without_admins_still_produces_work_item() {
        let (service, db) = service_with_admins(0);

        let outcome = service.request_invoice_creation(&sample_request()).unwrap();
        assert!(outcome.notified_admins.is_empty());
        assert!(db.get_work_item(&outcome.work_item_id).unwrap().is_some());
    }
}

//! Pull Service - imports ledger records into local storage
//!
//! One sequential worker per run: pages are fetched in increasing order,
//! records processed in the order the ledger returns them. Each record is
//! validated, then classified against the local store by remote identifier:
//! absent -> created, identical -> skipped, diverged -> conflict opened.
//! Re-running over the same dataset never duplicates anything.
//!
//! Rate limiting (HTTP 429) suspends the worker for the provider-specified
//! delay and re-issues the same page. A single record failure never aborts
//! the batch unless `stop_on_error` is set.

use super::conflict::open_conflict;
use super::logger::{SyncDirection, SyncLogger, SyncRunStatus};
use super::state::{content_hash, SyncStateTracker};
use super::{SyncEntity, SyncError};
use crate::db::{Database, DbError, TokenSet};
use crate::ledger::models::{RemoteContact, RemoteInvoice, RemotePayment};
use crate::ledger::{LedgerClient, LedgerError, ValidationError};
use crate::oauth::OAuthSessionManager;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_MAX_PAGES: u32 = 100;
pub const DEFAULT_PAGE_DELAY_MS: u64 = 200;
pub const DEFAULT_MAX_DURATION_SECS: u64 = 300;

/// Per-record errors reported back to the caller are capped; the full
/// picture always lands in the log entry details
const ERROR_REPORT_CAP: usize = 100;

const LOG_UPDATE_EVERY_PAGES: u32 = 5;

// ============================================================================
// Options & Results
// ============================================================================

/// Caller-tunable knobs for one pull run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PullOptions {
    /// Watermark override; defaults to the stored last-successful-pull time
    pub modified_since: Option<String>,
    pub page_size: u32,
    pub max_pages: u32,
    pub page_delay_ms: u64,
    pub stop_on_error: bool,
    pub max_duration_secs: u64,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            modified_since: None,
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            page_delay_ms: DEFAULT_PAGE_DELAY_MS,
            stop_on_error: false,
            max_duration_secs: DEFAULT_MAX_DURATION_SECS,
        }
    }
}

/// Aggregate counters for one run
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PullStats {
    pub pages: u32,
    pub processed: i64,
    pub succeeded: i64,
    pub skipped: i64,
    pub failed: i64,
    pub conflicts: i64,
}

/// Result payload returned to the triggering caller
#[derive(Debug, Clone, Serialize)]
pub struct PullOutcome {
    pub success: bool,
    pub stats: PullStats,
    pub errors: Vec<String>,
    pub log_id: String,
    pub duration_ms: u64,
}

/// Classification of one valid record against the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Created,
    Skipped,
    Conflicted,
}

// ============================================================================
// Handler seam
// ============================================================================

/// Entity-specific half of a pull: how to fetch a page, validate a record
/// and classify it into local storage
#[async_trait]
pub trait PullHandler: Send + Sync {
    type Record: Send + Sync;

    fn entity(&self) -> SyncEntity;

    async fn fetch_page(
        &self,
        client: &LedgerClient,
        tokens: &TokenSet,
        modified_since: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Self::Record>, LedgerError>;

    fn validate(&self, record: &Self::Record) -> Result<(), ValidationError>;

    fn upsert(
        &self,
        db: &Database,
        tracker: &SyncStateTracker,
        record: &Self::Record,
    ) -> Result<RecordOutcome, SyncError>;
}

/// Shared classification: absent -> store, identical -> skip, diverged ->
/// open (or refresh) the single pending conflict for the key
fn classify_record<L, F>(
    db: &Database,
    tracker: &SyncStateTracker,
    entity: SyncEntity,
    remote_id: &str,
    entity_name: Option<&str>,
    existing: Option<L>,
    incoming: &L,
    store: F,
) -> Result<RecordOutcome, SyncError>
where
    L: Serialize,
    F: FnOnce(&L) -> Result<(), DbError>,
{
    let incoming_hash = content_hash(incoming);

    match existing {
        None => {
            store(incoming)?;
            tracker.mark_synced(entity, remote_id, &incoming_hash)?;
            Ok(RecordOutcome::Created)
        }
        Some(existing) => {
            let existing_hash = content_hash(&existing);
            if existing_hash == incoming_hash {
                tracker.mark_synced(entity, remote_id, &incoming_hash)?;
                Ok(RecordOutcome::Skipped)
            } else {
                let local_json = serde_json::to_value(&existing)
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                let remote_json = serde_json::to_value(incoming)
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                open_conflict(db, entity, remote_id, entity_name, &local_json, &remote_json)?;
                tracker.mark_conflict(entity, remote_id, &existing_hash, &incoming_hash)?;
                Ok(RecordOutcome::Conflicted)
            }
        }
    }
}

// ============================================================================
// Per-entity handlers
// ============================================================================

pub struct ContactPullHandler;

#[async_trait]
impl PullHandler for ContactPullHandler {
    type Record = RemoteContact;

    fn entity(&self) -> SyncEntity {
        SyncEntity::Contact
    }

    async fn fetch_page(
        &self,
        client: &LedgerClient,
        tokens: &TokenSet,
        modified_since: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RemoteContact>, LedgerError> {
        client
            .list_contacts(tokens, modified_since, page, page_size)
            .await
    }

    fn validate(&self, record: &RemoteContact) -> Result<(), ValidationError> {
        record.validate()
    }

    fn upsert(
        &self,
        db: &Database,
        tracker: &SyncStateTracker,
        record: &RemoteContact,
    ) -> Result<RecordOutcome, SyncError> {
        let incoming = record.to_local();
        let existing = db.get_contact_by_remote_id(&incoming.remote_id)?;
        classify_record(
            db,
            tracker,
            SyncEntity::Contact,
            &incoming.remote_id.clone(),
            Some(&incoming.name.clone()),
            existing,
            &incoming,
            |rec| db.upsert_contact(rec),
        )
    }
}

pub struct InvoicePullHandler;

#[async_trait]
impl PullHandler for InvoicePullHandler {
    type Record = RemoteInvoice;

    fn entity(&self) -> SyncEntity {
        SyncEntity::Invoice
    }

    async fn fetch_page(
        &self,
        client: &LedgerClient,
        tokens: &TokenSet,
        modified_since: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RemoteInvoice>, LedgerError> {
        client
            .list_invoices(tokens, modified_since, page, page_size)
            .await
    }

    fn validate(&self, record: &RemoteInvoice) -> Result<(), ValidationError> {
        record.validate()
    }

    fn upsert(
        &self,
        db: &Database,
        tracker: &SyncStateTracker,
        record: &RemoteInvoice,
    ) -> Result<RecordOutcome, SyncError> {
        let incoming = record.to_local();
        let existing = db.get_invoice_by_remote_id(&incoming.remote_id)?;
        let name = incoming
            .invoice_number
            .clone()
            .unwrap_or_else(|| incoming.remote_id.clone());
        classify_record(
            db,
            tracker,
            SyncEntity::Invoice,
            &incoming.remote_id.clone(),
            Some(&name),
            existing,
            &incoming,
            |rec| db.upsert_invoice(rec),
        )
    }
}

pub struct PaymentPullHandler;

#[async_trait]
impl PullHandler for PaymentPullHandler {
    type Record = RemotePayment;

    fn entity(&self) -> SyncEntity {
        SyncEntity::Payment
    }

    async fn fetch_page(
        &self,
        client: &LedgerClient,
        tokens: &TokenSet,
        modified_since: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RemotePayment>, LedgerError> {
        client
            .list_payments(tokens, modified_since, page, page_size)
            .await
    }

    fn validate(&self, record: &RemotePayment) -> Result<(), ValidationError> {
        record.validate()
    }

    fn upsert(
        &self,
        db: &Database,
        tracker: &SyncStateTracker,
        record: &RemotePayment,
    ) -> Result<RecordOutcome, SyncError> {
        let incoming = record.to_local()?;
        let existing = db.get_payment_by_remote_id(&incoming.remote_id)?;
        let name = incoming
            .reference
            .clone()
            .unwrap_or_else(|| incoming.remote_id.clone());
        classify_record(
            db,
            tracker,
            SyncEntity::Payment,
            &incoming.remote_id.clone(),
            Some(&name),
            existing,
            &incoming,
            |rec| db.upsert_payment(rec),
        )
    }
}

// ============================================================================
// Pull Service
// ============================================================================

/// Drives paginated pulls for any entity handler
pub struct PullService {
    db: Arc<Database>,
    client: Arc<LedgerClient>,
    oauth: Arc<OAuthSessionManager>,
    logger: SyncLogger,
    tracker: SyncStateTracker,
}

impl PullService {
    pub fn new(
        db: Arc<Database>,
        client: Arc<LedgerClient>,
        oauth: Arc<OAuthSessionManager>,
    ) -> Self {
        Self {
            logger: SyncLogger::new(db.clone()),
            tracker: SyncStateTracker::new(db.clone()),
            db,
            client,
            oauth,
        }
    }

    /// Execute one pull run for the handler's entity type.
    ///
    /// Refuses to start while another run for the same entity type is
    /// in progress. Run-level failures (credentials) abort with an error
    /// after finalizing the log entry; record-level failures accumulate.
    pub async fn run<H: PullHandler>(
        &self,
        handler: &H,
        user_id: Option<&str>,
        options: &PullOptions,
    ) -> Result<PullOutcome, SyncError> {
        let entity = handler.entity();

        if self.logger.has_active_run(entity)? {
            return Err(SyncError::RunInProgress(entity));
        }

        let log_id = self
            .logger
            .start_run(user_id, SyncDirection::Pull, entity.as_str())?;
        let started = Instant::now();
        let run_started_at = Utc::now();

        let tokens = match self.oauth.ensure_fresh_token().await {
            Ok(tokens) => tokens,
            Err(e) => {
                let message = format!("Could not obtain ledger credentials: {}", e);
                self.logger.finalize_run(
                    &log_id,
                    SyncRunStatus::Error,
                    0,
                    0,
                    0,
                    &message,
                    None,
                    started.elapsed().as_millis() as i64,
                )?;
                return Err(e.into());
            }
        };

        let watermark = match &options.modified_since {
            Some(w) => Some(w.clone()),
            None => self.stored_watermark(entity)?,
        };

        if let Some(ref w) = watermark {
            log::info!("{} pull fetching records modified since {}", entity, w);
        } else {
            log::info!("{} pull fetching full dataset (no watermark)", entity);
        }

        let deadline = Duration::from_secs(options.max_duration_secs);
        let mut stats = PullStats::default();
        let mut errors: Vec<String> = Vec::new();
        let mut pages_failed: u32 = 0;
        let mut halted = false;
        let mut timed_out = false;

        'pages: for page in 1..=options.max_pages {
            if started.elapsed() >= deadline {
                timed_out = true;
                break;
            }

            // Fetch the page, re-issuing the same page after rate limiting
            let records = loop {
                match handler
                    .fetch_page(
                        &self.client,
                        &tokens,
                        watermark.as_deref(),
                        page,
                        options.page_size,
                    )
                    .await
                {
                    Ok(records) => break Some(records),
                    Err(LedgerError::RateLimited { retry_after }) => {
                        log::warn!(
                            "{} pull rate limited on page {}, resuming in {}s",
                            entity,
                            page,
                            retry_after
                        );
                        tokio::time::sleep(Duration::from_secs(retry_after)).await;
                        if started.elapsed() >= deadline {
                            timed_out = true;
                            break None;
                        }
                    }
                    Err(e) => {
                        let message = format!("page {}: {}", page, e);
                        log::error!("{} pull transport failure on {}", entity, message);
                        push_error(&mut errors, message);
                        pages_failed += 1;
                        if options.stop_on_error {
                            halted = true;
                        }
                        break None;
                    }
                }
            };

            let records = match records {
                Some(records) => records,
                None => {
                    if halted || timed_out {
                        break 'pages;
                    }
                    // Transport failure with stop_on_error off: skip this page
                    tokio::time::sleep(Duration::from_millis(options.page_delay_ms)).await;
                    continue;
                }
            };

            stats.pages += 1;
            let last_page = (records.len() as u32) < options.page_size;

            for record in &records {
                stats.processed += 1;

                if let Err(e) = handler.validate(record) {
                    stats.failed += 1;
                    push_error(&mut errors, e.to_string());
                    if options.stop_on_error {
                        halted = true;
                        break 'pages;
                    }
                    continue;
                }

                match handler.upsert(&self.db, &self.tracker, record) {
                    Ok(RecordOutcome::Created) => stats.succeeded += 1,
                    Ok(RecordOutcome::Skipped) => stats.skipped += 1,
                    Ok(RecordOutcome::Conflicted) => {
                        stats.conflicts += 1;
                        stats.failed += 1;
                    }
                    Err(e) => {
                        stats.failed += 1;
                        push_error(&mut errors, e.to_string());
                        if options.stop_on_error {
                            halted = true;
                            break 'pages;
                        }
                    }
                }
            }

            if page % LOG_UPDATE_EVERY_PAGES == 0 {
                self.logger
                    .update_counts(&log_id, stats.processed, stats.succeeded, stats.failed)?;
            }

            if last_page {
                break;
            }

            // Fixed inter-page pause keeps us clear of the provider's limits
            tokio::time::sleep(Duration::from_millis(options.page_delay_ms)).await;
        }

        // Advance the watermark only after a complete, failure-free sweep;
        // a skipped page or early stop would otherwise lose records
        if !halted && !timed_out && pages_failed == 0 {
            self.save_watermark(entity, &run_started_at.to_rfc3339())?;
        }

        let status = if halted {
            SyncRunStatus::Error
        } else if timed_out || stats.failed > 0 || !errors.is_empty() {
            SyncRunStatus::Warning
        } else {
            SyncRunStatus::Success
        };

        let message = if halted {
            format!("{} pull halted on error after {} pages", entity, stats.pages)
        } else if timed_out {
            format!(
                "{} pull reached its {}s ceiling, partial counts recorded",
                entity, options.max_duration_secs
            )
        } else {
            format!(
                "{} pull completed: {} created, {} skipped, {} failed, {} conflicts",
                entity, stats.succeeded, stats.skipped, stats.failed, stats.conflicts
            )
        };

        let details = if errors.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&errors)
                    .map_err(|e| SyncError::Serialization(e.to_string()))?,
            )
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        self.logger.finalize_run(
            &log_id,
            status,
            stats.processed,
            stats.succeeded,
            stats.failed,
            &message,
            details.as_deref(),
            duration_ms,
        )?;

        Ok(PullOutcome {
            success: !halted && !timed_out && errors.is_empty(),
            stats,
            errors,
            log_id,
            duration_ms: duration_ms as u64,
        })
    }

    fn stored_watermark(&self, entity: SyncEntity) -> Result<Option<String>, SyncError> {
        Ok(self.db.get_setting(&watermark_key(entity))?)
    }

    fn save_watermark(&self, entity: SyncEntity, value: &str) -> Result<(), SyncError> {
        self.db.set_setting(&watermark_key(entity), &value)?;
        Ok(())
    }
}

fn watermark_key(entity: SyncEntity) -> String {
    format!("ledger_watermark_{}", entity.as_str())
}

fn push_error(errors: &mut Vec<String>, message: String) {
    if errors.len() < ERROR_REPORT_CAP {
        errors.push(message);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::DocumentRef;

    fn fixtures() -> (Arc<Database>, SyncStateTracker) {
        let db = Arc::new(Database::in_memory().unwrap());
        let tracker = SyncStateTracker::new(db.clone());
        (db, tracker)
    }

    fn remote_contact(name: &str) -> RemoteContact {
        RemoteContact {
            contact_id: "c-1".to_string(),
            name: name.to_string(),
            email_address: Some("office@harbour.test".to_string()),
            phone: None,
            tax_number: None,
            is_customer: true,
            is_supplier: false,
            contact_status: "ACTIVE".to_string(),
            updated_date_utc: Some("2026-03-01T00:00:00+00:00".to_string()),
        }
    }

    #[test]
    fn test_upsert_classifies_new_record_as_created() {
        let (db, tracker) = fixtures();
        let handler = ContactPullHandler;

        let outcome = handler
            .upsert(&db, &tracker, &remote_contact("Harbour Electrical"))
            .unwrap();
        assert_eq!(outcome, RecordOutcome::Created);
        assert_eq!(db.count_contacts().unwrap(), 1);
    }

    #[test]
    fn test_upsert_classifies_identical_record_as_skipped() {
        let (db, tracker) = fixtures();
        let handler = ContactPullHandler;
        let record = remote_contact("Harbour Electrical");

        handler.upsert(&db, &tracker, &record).unwrap();
        let outcome = handler.upsert(&db, &tracker, &record).unwrap();
        assert_eq!(outcome, RecordOutcome::Skipped);
        assert_eq!(db.count_contacts().unwrap(), 1);
    }

    #[test]
    fn test_upsert_classifies_diverged_record_as_conflicted() {
        let (db, tracker) = fixtures();
        let handler = ContactPullHandler;

        handler
            .upsert(&db, &tracker, &remote_contact("Harbour Electrical"))
            .unwrap();

        let mut changed = remote_contact("Harbour Electrical Pty Ltd");
        changed.updated_date_utc = Some("2026-03-02T00:00:00+00:00".to_string());
        let outcome = handler.upsert(&db, &tracker, &changed).unwrap();
        assert_eq!(outcome, RecordOutcome::Conflicted);

        // Local row is untouched until the conflict is resolved
        let stored = db.get_contact_by_remote_id("c-1").unwrap().unwrap();
        assert_eq!(stored.name, "Harbour Electrical");

        // Exactly one pending conflict, even after another diverged pull
        handler.upsert(&db, &tracker, &changed).unwrap();
        let pending = crate::sync::conflict::pending_conflicts(&db, 10).unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_payment_upsert_uses_validated_target() {
        let (db, tracker) = fixtures();
        let handler = PaymentPullHandler;

        let payment = RemotePayment {
            payment_id: "pay-1".to_string(),
            amount: 150.0,
            currency_code: None,
            reference: Some("EFT 88".to_string()),
            status: "AUTHORISED".to_string(),
            date: Some("2026-03-01".to_string()),
            updated_date_utc: None,
            invoice: Some(DocumentRef {
                id: "inv-5".to_string(),
            }),
            credit_note: None,
            overpayment: None,
            prepayment: None,
        };

        let outcome = handler.upsert(&db, &tracker, &payment).unwrap();
        assert_eq!(outcome, RecordOutcome::Created);

        let stored = db.get_payment_by_remote_id("pay-1").unwrap().unwrap();
        assert_eq!(stored.target_kind, "invoice");
        assert_eq!(stored.target_remote_id, "inv-5");
    }

    #[test]
    fn test_pull_options_defaults() {
        let options = PullOptions::default();
        assert_eq!(options.page_size, 100);
        assert_eq!(options.max_pages, 100);
        assert_eq!(options.page_delay_ms, 200);
        assert!(!options.stop_on_error);
        assert_eq!(options.max_duration_secs, 300);
    }
}

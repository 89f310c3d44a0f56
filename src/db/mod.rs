//! Database module for LedgerLink
//!
//! Provides SQLite storage for the local mirror of ledger entities
//! (contacts, invoices, payments) and the sync bookkeeping tables
//! (tokens, sync state, conflicts, logs, work items, notifications).

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database manager for thread-safe SQLite access.
/// Uses r2d2 connection pooling; every sync component shares one instance.
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Create a new database connection pool backed by a file
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(20)
            .min_idle(Some(4))
            .connection_timeout(std::time::Duration::from_secs(10))
            .test_on_check_out(false)
            .build(manager)?;

        let conn = pool.get()?;

        // Performance PRAGMAs
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database pool (for testing)
    pub fn in_memory() -> DbResult<Self> {
        // A single connection keeps every caller on the same in-memory database
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder().max_size(1).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // GENERIC HELPERS
    // =========================================================================

    /// Execute a statement, returning the number of affected rows
    pub fn execute<P: rusqlite::Params>(&self, sql: &str, params: P) -> DbResult<usize> {
        let conn = self.get_conn()?;
        Ok(conn.execute(sql, params)?)
    }

    /// Execute a batch of statements
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        Ok(conn.execute_batch(sql)?)
    }

    /// Run a query and map every row
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Run a query expected to return exactly one row
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;
        Ok(conn.query_row(sql, params, f)?)
    }

    /// Run a query that may return zero rows
    pub fn query_opt<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Option<T>>
    where
        P: rusqlite::Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;
        Ok(conn.query_row(sql, params, f).optional()?)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a typed setting by key
    pub fn get_setting<T: for<'de> Deserialize<'de>>(&self, key: &str) -> DbResult<Option<T>> {
        let raw: Option<String> = self.query_opt(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;

        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| DbError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Store a typed setting by key
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let json =
            serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))?;

        self.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_at = excluded.updated_at",
            params![key, json, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // =========================================================================
    // OAUTH TOKENS
    // =========================================================================

    /// Store the active token set for a tenant (upsert)
    pub fn save_token_set(&self, tokens: &TokenSet) -> DbResult<()> {
        self.execute(
            "INSERT INTO oauth_tokens (tenant_id, access_token, refresh_token, expires_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tenant_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
            params![
                tokens.tenant_id,
                tokens.access_token,
                tokens.refresh_token,
                tokens.expires_at.to_rfc3339(),
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get the active token set, if the integration is connected
    pub fn get_token_set(&self) -> DbResult<Option<TokenSet>> {
        self.query_opt(
            "SELECT tenant_id, access_token, refresh_token, expires_at
             FROM oauth_tokens ORDER BY updated_at DESC LIMIT 1",
            [],
            |row| {
                Ok(TokenSet {
                    tenant_id: row.get(0)?,
                    access_token: row.get(1)?,
                    refresh_token: row.get(2)?,
                    expires_at: parse_utc(&row.get::<_, String>(3)?),
                })
            },
        )
    }

    /// Drop all stored tokens (disconnect)
    pub fn clear_token_sets(&self) -> DbResult<usize> {
        self.execute("DELETE FROM oauth_tokens", [])
    }

    // =========================================================================
    // CONTACTS
    // =========================================================================

    /// Insert or update a contact keyed by its ledger identifier
    pub fn upsert_contact(&self, contact: &LocalContact) -> DbResult<()> {
        self.execute(
            "INSERT INTO contacts (remote_id, name, email, phone, tax_number,
                                   is_customer, is_supplier, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(remote_id) DO UPDATE SET
                name = excluded.name,
                email = excluded.email,
                phone = excluded.phone,
                tax_number = excluded.tax_number,
                is_customer = excluded.is_customer,
                is_supplier = excluded.is_supplier,
                updated_at = excluded.updated_at",
            params![
                contact.remote_id,
                contact.name,
                contact.email,
                contact.phone,
                contact.tax_number,
                contact.is_customer,
                contact.is_supplier,
                contact.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_contact_by_remote_id(&self, remote_id: &str) -> DbResult<Option<LocalContact>> {
        self.query_opt(
            "SELECT remote_id, name, email, phone, tax_number, is_customer, is_supplier, updated_at
             FROM contacts WHERE remote_id = ?1",
            params![remote_id],
            map_contact,
        )
    }

    pub fn count_contacts(&self) -> DbResult<i64> {
        self.query_row("SELECT COUNT(*) FROM contacts", [], |row| row.get(0))
    }

    // =========================================================================
    // INVOICES
    // =========================================================================

    /// Insert or update an invoice keyed by its ledger identifier
    pub fn upsert_invoice(&self, invoice: &LocalInvoice) -> DbResult<()> {
        self.execute(
            "INSERT INTO invoices (remote_id, invoice_number, contact_remote_id, status,
                                   currency, total, amount_due, amount_paid,
                                   issued_on, due_on, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(remote_id) DO UPDATE SET
                invoice_number = excluded.invoice_number,
                contact_remote_id = excluded.contact_remote_id,
                status = excluded.status,
                currency = excluded.currency,
                total = excluded.total,
                amount_due = excluded.amount_due,
                amount_paid = excluded.amount_paid,
                issued_on = excluded.issued_on,
                due_on = excluded.due_on,
                updated_at = excluded.updated_at",
            params![
                invoice.remote_id,
                invoice.invoice_number,
                invoice.contact_remote_id,
                invoice.status,
                invoice.currency,
                invoice.total,
                invoice.amount_due,
                invoice.amount_paid,
                invoice.issued_on,
                invoice.due_on,
                invoice.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_invoice_by_remote_id(&self, remote_id: &str) -> DbResult<Option<LocalInvoice>> {
        self.query_opt(
            "SELECT remote_id, invoice_number, contact_remote_id, status, currency,
                    total, amount_due, amount_paid, issued_on, due_on, updated_at
             FROM invoices WHERE remote_id = ?1",
            params![remote_id],
            map_invoice,
        )
    }

    pub fn count_invoices(&self) -> DbResult<i64> {
        self.query_row("SELECT COUNT(*) FROM invoices", [], |row| row.get(0))
    }

    // =========================================================================
    // PAYMENTS
    // =========================================================================

    /// Insert or update a payment keyed by its ledger identifier
    pub fn upsert_payment(&self, payment: &LocalPayment) -> DbResult<()> {
        self.execute(
            "INSERT INTO payments (remote_id, target_kind, target_remote_id, amount,
                                   currency, reference, status, paid_on, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(remote_id) DO UPDATE SET
                target_kind = excluded.target_kind,
                target_remote_id = excluded.target_remote_id,
                amount = excluded.amount,
                currency = excluded.currency,
                reference = excluded.reference,
                status = excluded.status,
                paid_on = excluded.paid_on,
                updated_at = excluded.updated_at",
            params![
                payment.remote_id,
                payment.target_kind,
                payment.target_remote_id,
                payment.amount,
                payment.currency,
                payment.reference,
                payment.status,
                payment.paid_on,
                payment.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_payment_by_remote_id(&self, remote_id: &str) -> DbResult<Option<LocalPayment>> {
        self.query_opt(
            "SELECT remote_id, target_kind, target_remote_id, amount, currency,
                    reference, status, paid_on, updated_at
             FROM payments WHERE remote_id = ?1",
            params![remote_id],
            map_payment,
        )
    }

    pub fn count_payments(&self) -> DbResult<i64> {
        self.query_row("SELECT COUNT(*) FROM payments", [], |row| row.get(0))
    }

    // =========================================================================
    // USERS, WORK ITEMS & NOTIFICATIONS
    // =========================================================================

    pub fn insert_user(&self, user: &User) -> DbResult<()> {
        self.execute(
            "INSERT INTO users (id, name, email, role) VALUES (?1, ?2, ?3, ?4)",
            params![user.id, user.name, user.email, user.role],
        )?;
        Ok(())
    }

    /// All users with the admin role (request-service notification targets)
    pub fn admin_users(&self) -> DbResult<Vec<User>> {
        self.query(
            "SELECT id, name, email, role FROM users WHERE role = 'admin' ORDER BY name",
            [],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                    role: row.get(3)?,
                })
            },
        )
    }

    pub fn insert_work_item(&self, item: &WorkItem) -> DbResult<()> {
        self.execute(
            "INSERT INTO work_items (id, title, description, category, status,
                                     assigned_to, payload, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                item.id,
                item.title,
                item.description,
                item.category,
                item.status,
                item.assigned_to,
                item.payload,
                item.created_at,
                item.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_work_item(&self, id: &str) -> DbResult<Option<WorkItem>> {
        self.query_opt(
            "SELECT id, title, description, category, status, assigned_to, payload,
                    created_at, updated_at
             FROM work_items WHERE id = ?1",
            params![id],
            |row| {
                Ok(WorkItem {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    description: row.get(2)?,
                    category: row.get(3)?,
                    status: row.get(4)?,
                    assigned_to: row.get(5)?,
                    payload: row.get(6)?,
                    created_at: row.get(7)?,
                    updated_at: row.get(8)?,
                })
            },
        )
    }

    pub fn insert_notification(&self, n: &Notification) -> DbResult<()> {
        self.execute(
            "INSERT INTO notifications (id, user_id, title, body, link, is_read, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![n.id, n.user_id, n.title, n.body, n.link, n.is_read, n.created_at],
        )?;
        Ok(())
    }

    pub fn count_notifications_for(&self, user_id: &str) -> DbResult<i64> {
        self.query_row(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
    }
}

fn map_contact(row: &Row<'_>) -> rusqlite::Result<LocalContact> {
    Ok(LocalContact {
        remote_id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        tax_number: row.get(4)?,
        is_customer: row.get(5)?,
        is_supplier: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn map_invoice(row: &Row<'_>) -> rusqlite::Result<LocalInvoice> {
    Ok(LocalInvoice {
        remote_id: row.get(0)?,
        invoice_number: row.get(1)?,
        contact_remote_id: row.get(2)?,
        status: row.get(3)?,
        currency: row.get(4)?,
        total: row.get(5)?,
        amount_due: row.get(6)?,
        amount_paid: row.get(7)?,
        issued_on: row.get(8)?,
        due_on: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn map_payment(row: &Row<'_>) -> rusqlite::Result<LocalPayment> {
    Ok(LocalPayment {
        remote_id: row.get(0)?,
        target_kind: row.get(1)?,
        target_remote_id: row.get(2)?,
        amount: row.get(3)?,
        currency: row.get(4)?,
        reference: row.get(5)?,
        status: row.get(6)?,
        paid_on: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn parse_utc(raw: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}

// ============================================================================
// Record Types
// ============================================================================

/// OAuth token set for one integration tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub tenant_id: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Local mirror of a ledger contact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalContact {
    pub remote_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub tax_number: Option<String>,
    pub is_customer: bool,
    pub is_supplier: bool,
    pub updated_at: String,
}

/// Local mirror of a ledger invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalInvoice {
    pub remote_id: String,
    pub invoice_number: Option<String>,
    pub contact_remote_id: Option<String>,
    pub status: String,
    pub currency: Option<String>,
    pub total: f64,
    pub amount_due: f64,
    pub amount_paid: f64,
    pub issued_on: Option<String>,
    pub due_on: Option<String>,
    pub updated_at: String,
}

/// Local mirror of a ledger payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPayment {
    pub remote_id: String,
    /// Which document the payment settles: invoice, credit_note, overpayment, prepayment
    pub target_kind: String,
    pub target_remote_id: String,
    pub amount: f64,
    pub currency: Option<String>,
    pub reference: Option<String>,
    pub status: String,
    pub paid_on: Option<String>,
    pub updated_at: String,
}

/// ERP user (only the fields the sync engine needs)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: String,
}

/// Durable, assignable task created by the request service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    pub status: String,
    pub assigned_to: Option<String>,
    pub payload: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// In-app notification row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub body: Option<String>,
    pub link: Option<String>,
    pub is_read: bool,
    pub created_at: String,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::in_memory().unwrap()
    }

    fn sample_contact(remote_id: &str) -> LocalContact {
        LocalContact {
            remote_id: remote_id.to_string(),
            name: "Meridian Civil Pty Ltd".to_string(),
            email: Some("accounts@meridiancivil.test".to_string()),
            phone: None,
            tax_number: Some("51824753556".to_string()),
            is_customer: true,
            is_supplier: false,
            updated_at: "2026-03-01T10:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn test_contact_upsert_is_idempotent() {
        let db = test_db();
        let contact = sample_contact("c-001");

        db.upsert_contact(&contact).unwrap();
        db.upsert_contact(&contact).unwrap();

        assert_eq!(db.count_contacts().unwrap(), 1);
        let loaded = db.get_contact_by_remote_id("c-001").unwrap().unwrap();
        assert_eq!(loaded, contact);
    }

    #[test]
    fn test_contact_upsert_updates_fields() {
        let db = test_db();
        let mut contact = sample_contact("c-002");
        db.upsert_contact(&contact).unwrap();

        contact.name = "Meridian Civil Group".to_string();
        db.upsert_contact(&contact).unwrap();

        let loaded = db.get_contact_by_remote_id("c-002").unwrap().unwrap();
        assert_eq!(loaded.name, "Meridian Civil Group");
        assert_eq!(db.count_contacts().unwrap(), 1);
    }

    #[test]
    fn test_token_set_round_trip() {
        let db = test_db();
        assert!(db.get_token_set().unwrap().is_none());

        let tokens = TokenSet {
            access_token: "at-1".to_string(),
            refresh_token: "rt-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(30),
        };
        db.save_token_set(&tokens).unwrap();

        let loaded = db.get_token_set().unwrap().unwrap();
        assert_eq!(loaded.access_token, "at-1");
        assert_eq!(loaded.tenant_id, "tenant-1");

        db.clear_token_sets().unwrap();
        assert!(db.get_token_set().unwrap().is_none());
    }

    #[test]
    fn test_settings_round_trip() {
        let db = test_db();

        db.set_setting("watermark_contacts", &"2026-02-01T00:00:00Z".to_string())
            .unwrap();
        let loaded: Option<String> = db.get_setting("watermark_contacts").unwrap();
        assert_eq!(loaded.as_deref(), Some("2026-02-01T00:00:00Z"));

        let missing: Option<String> = db.get_setting("nope").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_admin_users_filters_by_role() {
        let db = test_db();
        db.insert_user(&User {
            id: "u1".to_string(),
            name: "Ayse".to_string(),
            email: "ayse@example.test".to_string(),
            role: "admin".to_string(),
        })
        .unwrap();
        db.insert_user(&User {
            id: "u2".to_string(),
            name: "Deniz".to_string(),
            email: "deniz@example.test".to_string(),
            role: "staff".to_string(),
        })
        .unwrap();

        let admins = db.admin_users().unwrap();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].id, "u1");
    }

    #[test]
    fn test_file_backed_database_persists_across_reopen() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db_path = temp_dir.path().join("ledgerlink.db");

        {
            let db = Database::new(db_path.clone()).unwrap();
            db.upsert_contact(&sample_contact("c-file")).unwrap();
        }

        let reopened = Database::new(db_path).unwrap();
        assert!(reopened
            .get_contact_by_remote_id("c-file")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_payment_upsert_round_trip() {
        let db = test_db();
        let payment = LocalPayment {
            remote_id: "p-001".to_string(),
            target_kind: "invoice".to_string(),
            target_remote_id: "inv-9".to_string(),
            amount: 1250.50,
            currency: Some("AUD".to_string()),
            reference: Some("EFT 4412".to_string()),
            status: "AUTHORISED".to_string(),
            paid_on: Some("2026-02-14".to_string()),
            updated_at: "2026-02-14T08:30:00+00:00".to_string(),
        };

        db.upsert_payment(&payment).unwrap();
        let loaded = db.get_payment_by_remote_id("p-001").unwrap().unwrap();
        assert_eq!(loaded, payment);
    }
}

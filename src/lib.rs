//! # LedgerLink
//!
//! Accounting-ledger synchronization engine for the ERP backend.
//!
//! Reconciles the local system of record (contacts, invoices, payments)
//! with the external accounting provider: OAuth2 session management,
//! paginated pulls with rate-limit backoff, content-hash conflict
//! detection and resolution, a pull-only request path for entities the
//! provider will not let us create, and an audited, cached dashboard.
//!
//! The web layer, auth middleware and document generation live elsewhere;
//! this crate exposes [`sync::SyncManager`] as the single entry point for
//! API routes and scheduled jobs.

pub mod db;
pub mod ledger;
pub mod oauth;
pub mod sync;

// Re-export the surface callers actually use
pub use db::{Database, DbError, TokenSet};
pub use ledger::{LedgerClient, LedgerError};
pub use oauth::{OAuthConfig, OAuthError, OAuthSessionManager};
pub use sync::{
    BackgroundScheduler, DashboardQuery, InvoiceRequest, PullOptions, SyncEntity, SyncError,
    SyncManager,
};

//! Remote Ledger Module - typed access to the accounting provider
//!
//! Wraps the provider's REST API:
//! - Paginated list endpoints per entity (contacts, invoices, payments)
//! - Single-record reads and the contact write used by conflict resolution
//! - Rate-limit signalling (HTTP 429 + retry-after)

pub mod client;
pub mod models;

pub use client::{LedgerClient, LedgerError, DEFAULT_BASE_URL};
pub use models::{
    DocumentRef, PaymentTarget, RemoteContact, RemoteInvoice, RemotePayment, ValidationError,
};

//! Ledger API Client - HTTP communication with the accounting provider
//!
//! Thin typed wrapper over the provider's REST endpoints:
//! - Paginated list calls per entity type (1-based pages)
//! - Single-record reads
//! - Contact write-back used by `use_local` conflict resolution
//!
//! Rate limiting is surfaced, never swallowed: a 429 becomes
//! `LedgerError::RateLimited` carrying the provider's retry-after value,
//! and the pull loop re-issues the same page after the delay.

use super::models::{
    ContactsPage, ContactsWrite, InvoicesPage, PaymentsPage, RemoteContact, RemoteInvoice,
    RemotePayment,
};
use crate::db::{LocalContact, TokenSet};
use reqwest::{Client, Response, StatusCode};

pub const DEFAULT_BASE_URL: &str = "https://api.xero.com/api.xro/2.0";

/// Fallback delay when a 429 response omits the retry-after header
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

const TENANT_HEADER: &str = "xero-tenant-id";

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Rate limited by provider, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("Unauthorized - ledger rejected the access token")]
    Unauthorized,

    #[error("Ledger API error ({status}): {body}")]
    Http { status: u16, body: String },

    #[error("Invalid response from ledger")]
    InvalidResponse,
}

/// API client for the accounting ledger
#[derive(Clone)]
pub struct LedgerClient {
    client: Client,
    base_url: String,
}

impl LedgerClient {
    /// Create a client against the provider's production endpoint
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL.to_string())
    }

    /// Create a client against an explicit base URL (gateways, tests)
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    // ========================================================================
    // Paginated list endpoints
    // ========================================================================

    pub async fn list_contacts(
        &self,
        tokens: &TokenSet,
        modified_since: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RemoteContact>, LedgerError> {
        let page: ContactsPage = self
            .get_json("Contacts", tokens, modified_since, Some((page, page_size)))
            .await?;
        Ok(page.contacts)
    }

    pub async fn list_invoices(
        &self,
        tokens: &TokenSet,
        modified_since: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RemoteInvoice>, LedgerError> {
        let page: InvoicesPage = self
            .get_json("Invoices", tokens, modified_since, Some((page, page_size)))
            .await?;
        Ok(page.invoices)
    }

    pub async fn list_payments(
        &self,
        tokens: &TokenSet,
        modified_since: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RemotePayment>, LedgerError> {
        let page: PaymentsPage = self
            .get_json("Payments", tokens, modified_since, Some((page, page_size)))
            .await?;
        Ok(page.payments)
    }

    // ========================================================================
    // Single-record endpoints
    // ========================================================================

    pub async fn get_contact(
        &self,
        tokens: &TokenSet,
        contact_id: &str,
    ) -> Result<Option<RemoteContact>, LedgerError> {
        let page: ContactsPage = self
            .get_json(&format!("Contacts/{}", contact_id), tokens, None, None)
            .await?;
        Ok(page.contacts.into_iter().next())
    }

    /// Push a local contact to the ledger (upsert keyed by remote id).
    /// Contacts are the only entity the provider accepts programmatic
    /// writes for; invoices and payments go through the request service.
    pub async fn update_contact(
        &self,
        tokens: &TokenSet,
        contact: &LocalContact,
    ) -> Result<(), LedgerError> {
        let body = ContactsWrite {
            contacts: vec![RemoteContact::from_local(contact)],
        };

        let response = self
            .client
            .post(format!("{}/Contacts", self.base_url))
            .bearer_auth(&tokens.access_token)
            .header(TENANT_HEADER, &tokens.tenant_id)
            .json(&body)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(response).await)
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        tokens: &TokenSet,
        modified_since: Option<&str>,
        paging: Option<(u32, u32)>,
    ) -> Result<T, LedgerError> {
        let mut request = self
            .client
            .get(format!("{}/{}", self.base_url, path))
            .bearer_auth(&tokens.access_token)
            .header(TENANT_HEADER, &tokens.tenant_id)
            .header("accept", "application/json");

        if let Some((page, page_size)) = paging {
            request = request.query(&[("page", page), ("pageSize", page_size)]);
        }
        if let Some(watermark) = modified_since {
            request = request.header("if-modified-since", watermark);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            response
                .json::<T>()
                .await
                .map_err(|_| LedgerError::InvalidResponse)
        } else {
            Err(error_from_response(response).await)
        }
    }
}

impl Default for LedgerClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a non-success response to a LedgerError
async fn error_from_response(response: Response) -> LedgerError {
    let status = response.status();

    match status {
        StatusCode::TOO_MANY_REQUESTS => LedgerError::RateLimited {
            retry_after: parse_retry_after(&response),
        },
        StatusCode::UNAUTHORIZED => LedgerError::Unauthorized,
        _ => {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            LedgerError::Http {
                status: status.as_u16(),
                body,
            }
        }
    }
}

fn parse_retry_after(response: &Response) -> u64 {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

// ============================================================================
// Tests
// ============================================================================

//! Sync Manager - orchestrates ledger synchronization
//!
//! Single entry point wiring the OAuth session, ledger client and the
//! per-concern services. API routes and scheduled jobs call this facade;
//! nothing below it is aware of the web layer.

use super::conflict::ConflictResolver;
use super::dashboard::{DashboardAggregator, DashboardData, DashboardQuery};
use super::logger::{SyncLogger, STALE_RUN_MINUTES};
use super::pull::{
    ContactPullHandler, InvoicePullHandler, PaymentPullHandler, PullOptions, PullOutcome,
    PullService,
};
use super::request::{InvoiceRequest, RequestOutcome, RequestService};
use super::{SyncEntity, SyncError};
use crate::db::{Database, TokenSet};
use crate::ledger::LedgerClient;
use crate::oauth::{OAuthConfig, OAuthError, OAuthSessionManager};
use serde::Serialize;
use std::sync::Arc;

/// Outcome of pulling every entity type in sequence
#[derive(Debug, Serialize)]
pub struct PullAllResult {
    pub outcomes: Vec<(SyncEntity, PullOutcome)>,
    pub errors: Vec<String>,
}

/// Facade over the whole sync engine
#[derive(Clone)]
pub struct SyncManager {
    db: Arc<Database>,
    oauth: Arc<OAuthSessionManager>,
    pull_service: Arc<PullService>,
    resolver: Arc<ConflictResolver>,
    request_service: Arc<RequestService>,
    dashboard: DashboardAggregator,
    logger: SyncLogger,
}

impl SyncManager {
    pub fn new(db: Arc<Database>, oauth_config: OAuthConfig, ledger_base_url: String) -> Self {
        let client = Arc::new(LedgerClient::with_base_url(ledger_base_url));
        let oauth = Arc::new(OAuthSessionManager::new(oauth_config, db.clone()));

        Self {
            pull_service: Arc::new(PullService::new(db.clone(), client.clone(), oauth.clone())),
            resolver: Arc::new(ConflictResolver::new(db.clone(), client, oauth.clone())),
            request_service: Arc::new(RequestService::new(db.clone())),
            dashboard: DashboardAggregator::new(db.clone()),
            logger: SyncLogger::new(db.clone()),
            oauth,
            db,
        }
    }

    /// Wire the manager from environment configuration
    pub fn from_env(db: Arc<Database>) -> Result<Self, OAuthError> {
        let config = OAuthConfig::from_env()?;
        let base_url = std::env::var("LEDGER_API_URL")
            .unwrap_or_else(|_| crate::ledger::DEFAULT_BASE_URL.to_string());
        Ok(Self::new(db, config, base_url))
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Provider consent URL for a user-initiated connection
    pub fn connect_url(&self, user_id: &str) -> Result<(String, String), SyncError> {
        Ok(self.oauth.authorization_url(user_id)?)
    }

    /// Complete the authorization-code flow after the provider redirect
    pub async fn complete_connection(&self, code: String) -> Result<TokenSet, SyncError> {
        Ok(self.oauth.exchange_code(code).await?)
    }

    pub fn disconnect(&self) -> Result<(), SyncError> {
        Ok(self.oauth.disconnect()?)
    }

    pub fn is_connected(&self) -> Result<bool, SyncError> {
        Ok(self.db.get_token_set()?.is_some())
    }

    // ========================================================================
    // Pulls
    // ========================================================================

    /// Run one pull for the given entity type
    pub async fn pull(
        &self,
        entity: SyncEntity,
        user_id: Option<&str>,
        options: &PullOptions,
    ) -> Result<PullOutcome, SyncError> {
        let outcome = match entity {
            SyncEntity::Contact => {
                self.pull_service
                    .run(&ContactPullHandler, user_id, options)
                    .await
            }
            SyncEntity::Invoice => {
                self.pull_service
                    .run(&InvoicePullHandler, user_id, options)
                    .await
            }
            SyncEntity::Payment => {
                self.pull_service
                    .run(&PaymentPullHandler, user_id, options)
                    .await
            }
        }?;

        // A finished run changes every aggregate the dashboard shows
        self.dashboard.invalidate().await;
        Ok(outcome)
    }

    /// Pull every entity type in sequence. One entity failing does not stop
    /// the others; failures are collected per entity.
    pub async fn pull_all(&self, user_id: Option<&str>, options: &PullOptions) -> PullAllResult {
        let mut result = PullAllResult {
            outcomes: Vec::new(),
            errors: Vec::new(),
        };

        for entity in SyncEntity::ALL {
            match self.pull(entity, user_id, options).await {
                Ok(outcome) => result.outcomes.push((entity, outcome)),
                Err(e) => result.errors.push(format!("{}: {}", entity, e)),
            }
        }

        result
    }

    // ========================================================================
    // Conflicts & requests
    // ========================================================================

    pub async fn resolve_conflict(
        &self,
        entity: SyncEntity,
        entity_id: &str,
        resolution: &str,
        manual_data: Option<serde_json::Value>,
    ) -> Result<String, SyncError> {
        let message = self
            .resolver
            .resolve(entity, entity_id, resolution, manual_data)
            .await?;
        self.dashboard.invalidate().await;
        Ok(message)
    }

    pub fn request_invoice_creation(
        &self,
        request: &InvoiceRequest,
    ) -> Result<RequestOutcome, SyncError> {
        self.request_service.request_invoice_creation(request)
    }

    // ========================================================================
    // Dashboard & maintenance
    // ========================================================================

    pub async fn dashboard(&self, query: &DashboardQuery) -> Result<Arc<DashboardData>, SyncError> {
        self.dashboard.get_dashboard(query).await
    }

    /// Retention purge; error entries are always kept
    pub fn purge_logs(&self, retention_days: i64) -> Result<usize, SyncError> {
        self.logger.purge_old_entries(retention_days)
    }

    /// Close orphaned in_progress runs so the mutual-exclusion guard clears
    pub fn finalize_stale_runs(&self) -> Result<usize, SyncError> {
        self.logger.finalize_stale_runs(STALE_RUN_MINUTES)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> SyncManager {
        let db = Arc::new(Database::in_memory().unwrap());
        let config = OAuthConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            auth_url: "https://auth.example.test/authorize".to_string(),
            token_url: "https://auth.example.test/token".to_string(),
            redirect_uri: "https://erp.example.test/callback".to_string(),
            scopes: vec!["offline_access".to_string()],
            tenant_id: "tenant-1".to_string(),
        };
        SyncManager::new(db, config, "http://localhost:1".to_string())
    }

    #[test]
    fn test_connect_url_is_built_from_config() {
        let manager = test_manager();
        let (url, _state) = manager.connect_url("user-1").unwrap();
        assert!(url.starts_with("https://auth.example.test/authorize"));
    }

    #[test]
    fn test_not_connected_without_tokens() {
        let manager = test_manager();
        assert!(!manager.is_connected().unwrap());
    }

    #[tokio::test]
    async fn test_resolving_unknown_conflict_fails() {
        let manager = test_manager();
        let err = manager
            .resolve_conflict(SyncEntity::Contact, "c-404", "use_remote", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConflictNotFound { .. }));
    }

    #[tokio::test]
    async fn test_pull_without_connection_finalizes_log_with_error() {
        let manager = test_manager();

        let err = manager
            .pull(SyncEntity::Contact, None, &PullOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::OAuth(_)));

        // The aborted run left a finalized error entry, not a stuck one
        let data = manager.dashboard(&DashboardQuery::default()).await.unwrap();
        assert_eq!(data.summary.error, 1);
        assert_eq!(data.summary.in_progress, 0);
    }
}

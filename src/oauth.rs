//! OAuth2 Authentication Module
//!
//! Drives the accounting provider's authorization-code flow and keeps the
//! stored token set fresh. This module is the only writer of the token store;
//! every other component obtains credentials through `ensure_fresh_token`.

use crate::db::{Database, TokenSet};
use chrono::{DateTime, Duration, Utc};
use oauth2::{
    basic::BasicClient, reqwest::async_http_client, AuthUrl, AuthorizationCode, ClientId,
    ClientSecret, CsrfToken, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use std::sync::Arc;

/// Tokens are refreshed when they expire within this margin
pub const REFRESH_MARGIN_MINUTES: i64 = 5;

const DEFAULT_AUTH_URL: &str = "https://login.xero.com/identity/connect/authorize";
const DEFAULT_TOKEN_URL: &str = "https://identity.xero.com/connect/token";
const DEFAULT_SCOPES: &str =
    "offline_access accounting.transactions accounting.contacts accounting.settings";

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("Integration not configured: {0}")]
    Configuration(String),

    #[error("OAuth2 error: {0}")]
    OAuth2(String),

    #[error("Code exchange failed: {0}")]
    Exchange(String),

    #[error("Token refresh failed, re-authorization required: {0}")]
    Refresh(String),

    #[error("Ledger integration is not connected")]
    NotConnected,

    #[error("Token store error: {0}")]
    Store(String),
}

/// Provider endpoints and credentials for the accounting ledger
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub tenant_id: String,
}

impl OAuthConfig {
    /// Load the integration credentials from the environment.
    ///
    /// `LEDGER_CLIENT_ID`, `LEDGER_CLIENT_SECRET` and `LEDGER_REDIRECT_URI`
    /// are required; auth/token URLs and tenant id can be overridden for
    /// self-hosted gateways and tests.
    pub fn from_env() -> Result<Self, OAuthError> {
        dotenvy::dotenv().ok();

        let client_id = require_env("LEDGER_CLIENT_ID")?;
        let client_secret = require_env("LEDGER_CLIENT_SECRET")?;
        let redirect_uri = require_env("LEDGER_REDIRECT_URI")?;

        Ok(Self {
            client_id,
            client_secret,
            auth_url: std::env::var("LEDGER_AUTH_URL")
                .unwrap_or_else(|_| DEFAULT_AUTH_URL.to_string()),
            token_url: std::env::var("LEDGER_TOKEN_URL")
                .unwrap_or_else(|_| DEFAULT_TOKEN_URL.to_string()),
            redirect_uri,
            scopes: std::env::var("LEDGER_SCOPES")
                .unwrap_or_else(|_| DEFAULT_SCOPES.to_string())
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            tenant_id: std::env::var("LEDGER_TENANT_ID").unwrap_or_default(),
        })
    }
}

fn require_env(key: &str) -> Result<String, OAuthError> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(OAuthError::Configuration(format!("{} is not set", key))),
    }
}

/// Whether a token expiring at `expires_at` must be refreshed before use
pub fn needs_refresh(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at <= now + Duration::minutes(REFRESH_MARGIN_MINUTES)
}

/// Manages the provider session: consent URL, code exchange, proactive refresh
pub struct OAuthSessionManager {
    config: OAuthConfig,
    db: Arc<Database>,
}

impl OAuthSessionManager {
    pub fn new(config: OAuthConfig, db: Arc<Database>) -> Self {
        Self { config, db }
    }

    pub fn from_env(db: Arc<Database>) -> Result<Self, OAuthError> {
        Ok(Self::new(OAuthConfig::from_env()?, db))
    }

    fn client(&self) -> Result<BasicClient, OAuthError> {
        if self.config.client_id.trim().is_empty() || self.config.client_secret.trim().is_empty() {
            return Err(OAuthError::Configuration(
                "ledger client credentials are not set".to_string(),
            ));
        }
        if self.config.redirect_uri.trim().is_empty() {
            return Err(OAuthError::Configuration(
                "ledger redirect URI is not set".to_string(),
            ));
        }

        let client = BasicClient::new(
            ClientId::new(self.config.client_id.clone()),
            Some(ClientSecret::new(self.config.client_secret.clone())),
            AuthUrl::new(self.config.auth_url.clone())
                .map_err(|e| OAuthError::OAuth2(e.to_string()))?,
            Some(
                TokenUrl::new(self.config.token_url.clone())
                    .map_err(|e| OAuthError::OAuth2(e.to_string()))?,
            ),
        )
        .set_redirect_uri(
            RedirectUrl::new(self.config.redirect_uri.clone())
                .map_err(|e| OAuthError::OAuth2(e.to_string()))?,
        );

        Ok(client)
    }

    /// Build the provider consent URL for a user-initiated connection
    pub fn authorization_url(&self, user_id: &str) -> Result<(String, String), OAuthError> {
        let client = self.client()?;

        let mut auth_request = client.authorize_url(CsrfToken::new_random);
        for scope in &self.config.scopes {
            auth_request = auth_request.add_scope(Scope::new(scope.clone()));
        }

        let (auth_url, csrf_token) = auth_request.url();

        log::info!("Built ledger authorization URL for user {}", user_id);
        Ok((auth_url.to_string(), csrf_token.secret().clone()))
    }

    /// Complete the authorization-code flow and persist the resulting tokens
    pub async fn exchange_code(&self, code: String) -> Result<TokenSet, OAuthError> {
        let client = self.client()?;

        let token_result = client
            .exchange_code(AuthorizationCode::new(code))
            .request_async(async_http_client)
            .await
            .map_err(|e| OAuthError::Exchange(e.to_string()))?;

        let tokens = self.token_set_from_response(&token_result)?;
        self.db
            .save_token_set(&tokens)
            .map_err(|e| OAuthError::Store(e.to_string()))?;

        log::info!(
            "Ledger connection established for tenant {} (expires {})",
            tokens.tenant_id,
            tokens.expires_at
        );
        Ok(tokens)
    }

    /// Return a token set that is valid for at least the refresh margin.
    ///
    /// Refreshes and persists when `expires_at` falls inside the margin;
    /// otherwise the stored set is returned unchanged.
    pub async fn ensure_fresh_token(&self) -> Result<TokenSet, OAuthError> {
        let tokens = self
            .db
            .get_token_set()
            .map_err(|e| OAuthError::Store(e.to_string()))?
            .ok_or(OAuthError::NotConnected)?;

        if !needs_refresh(tokens.expires_at, Utc::now()) {
            return Ok(tokens);
        }

        log::info!(
            "Access token for tenant {} expires at {}, refreshing",
            tokens.tenant_id,
            tokens.expires_at
        );
        self.refresh(tokens).await
    }

    /// Exchange the refresh token for a new set and persist it
    async fn refresh(&self, tokens: TokenSet) -> Result<TokenSet, OAuthError> {
        let client = self.client()?;

        let token_result = client
            .exchange_refresh_token(&RefreshToken::new(tokens.refresh_token.clone()))
            .request_async(async_http_client)
            .await
            .map_err(|e| OAuthError::Refresh(e.to_string()))?;

        let mut fresh = self.token_set_from_response(&token_result)?;
        // Providers that do not rotate refresh tokens omit them from the response
        if fresh.refresh_token.is_empty() {
            fresh.refresh_token = tokens.refresh_token;
        }
        if fresh.tenant_id.is_empty() {
            fresh.tenant_id = tokens.tenant_id;
        }

        self.db
            .save_token_set(&fresh)
            .map_err(|e| OAuthError::Store(e.to_string()))?;

        log::info!(
            "Refreshed ledger token for tenant {} (new expiry {})",
            fresh.tenant_id,
            fresh.expires_at
        );
        Ok(fresh)
    }

    /// Remove stored credentials (disconnect the integration)
    pub fn disconnect(&self) -> Result<(), OAuthError> {
        self.db
            .clear_token_sets()
            .map_err(|e| OAuthError::Store(e.to_string()))?;
        log::info!("Ledger integration disconnected, tokens cleared");
        Ok(())
    }

    fn token_set_from_response<T>(&self, response: &T) -> Result<TokenSet, OAuthError>
    where
        T: TokenResponse<oauth2::basic::BasicTokenType>,
    {
        let expires_in = response
            .expires_in()
            .unwrap_or(std::time::Duration::from_secs(1800));

        Ok(TokenSet {
            access_token: response.access_token().secret().clone(),
            refresh_token: response
                .refresh_token()
                .map(|t| t.secret().clone())
                .unwrap_or_default(),
            tenant_id: self.config.tenant_id.clone(),
            expires_at: Utc::now()
                + Duration::seconds(expires_in.as_secs().min(i64::MAX as u64) as i64),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(token_url: &str) -> OAuthConfig {
        OAuthConfig {
            client_id: "test-client".to_string(),
            client_secret: "test-secret".to_string(),
            auth_url: "https://auth.example.test/authorize".to_string(),
            token_url: token_url.to_string(),
            redirect_uri: "https://erp.example.test/api/ledger/callback".to_string(),
            scopes: vec!["offline_access".to_string()],
            tenant_id: "tenant-1".to_string(),
        }
    }

    fn stored_tokens(db: &Database, expires_in_minutes: i64) {
        db.save_token_set(&TokenSet {
            access_token: "old-access".to_string(),
            refresh_token: "old-refresh".to_string(),
            tenant_id: "tenant-1".to_string(),
            expires_at: Utc::now() + Duration::minutes(expires_in_minutes),
        })
        .unwrap();
    }

    #[test]
    fn test_needs_refresh_boundary() {
        let now = Utc::now();
        assert!(needs_refresh(now + Duration::minutes(4), now));
        assert!(!needs_refresh(now + Duration::minutes(10), now));
        assert!(needs_refresh(now - Duration::minutes(1), now));
    }

    #[test]
    fn test_authorization_url_contains_client_and_scope() {
        let db = Arc::new(Database::in_memory().unwrap());
        let manager = OAuthSessionManager::new(test_config("https://auth.example.test/token"), db);

        let (url, state) = manager.authorization_url("user-7").unwrap();
        assert!(url.contains("client_id=test-client"));
        assert!(url.contains("scope=offline_access"));
        assert!(url.contains(&format!("state={}", state)));
    }

    #[test]
    fn test_missing_credentials_is_configuration_error() {
        let db = Arc::new(Database::in_memory().unwrap());
        let mut config = test_config("https://auth.example.test/token");
        config.client_secret = String::new();
        let manager = OAuthSessionManager::new(config, db);

        let err = manager.authorization_url("user-7").unwrap_err();
        assert!(matches!(err, OAuthError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_ensure_fresh_token_refreshes_inside_margin() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "access_token": "new-access",
                    "refresh_token": "new-refresh",
                    "token_type": "Bearer",
                    "expires_in": 1800
                }"#,
            )
            .create_async()
            .await;

        let db = Arc::new(Database::in_memory().unwrap());
        stored_tokens(&db, 4); // inside the 5 minute margin

        let manager =
            OAuthSessionManager::new(test_config(&format!("{}/token", server.url())), db.clone());

        let tokens = manager.ensure_fresh_token().await.unwrap();
        assert_eq!(tokens.access_token, "new-access");
        assert_eq!(tokens.refresh_token, "new-refresh");

        // The refreshed set is persisted
        let stored = db.get_token_set().unwrap().unwrap();
        assert_eq!(stored.access_token, "new-access");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_ensure_fresh_token_skips_refresh_outside_margin() {
        let mut server = mockito::Server::new_async().await;
        // The token endpoint must never be hit
        let mock = server
            .mock("POST", "/token")
            .expect(0)
            .create_async()
            .await;

        let db = Arc::new(Database::in_memory().unwrap());
        stored_tokens(&db, 10);

        let manager =
            OAuthSessionManager::new(test_config(&format!("{}/token", server.url())), db);

        let tokens = manager.ensure_fresh_token().await.unwrap();
        assert_eq!(tokens.access_token, "old-access");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_rejection_is_refresh_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error": "invalid_grant"}"#)
            .create_async()
            .await;

        let db = Arc::new(Database::in_memory().unwrap());
        stored_tokens(&db, 1);

        let manager =
            OAuthSessionManager::new(test_config(&format!("{}/token", server.url())), db);

        let err = manager.ensure_fresh_token().await.unwrap_err();
        assert!(matches!(err, OAuthError::Refresh(_)));
    }

    #[tokio::test]
    async fn test_not_connected_without_stored_tokens() {
        let db = Arc::new(Database::in_memory().unwrap());
        let manager =
            OAuthSessionManager::new(test_config("https://auth.example.test/token"), db);

        let err = manager.ensure_fresh_token().await.unwrap_err();
        assert!(matches!(err, OAuthError::NotConnected));
    }
}

//! Boundary to the application backend: exchanging a provider token for a
//! backend session.
//!
//! The wire format of [`HttpBackendClient`]:
//!
//! ```text
//! POST {backend_url}/auth/sync
//! Authorization: Bearer <provider token>
//! {}
//!
//! 200 {"user": {...}, "session": {"token": "...", "expiresAt": "..."}}
//! 200 {"user": null} | 200 <empty> | 204   -> no user (degraded)
//! 4xx / 5xx                                -> BackendExchangeFailed
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::{AuthEngineError, Result};

/// Longest slice of an error body carried into the error message.
const ERROR_BODY_PREVIEW: usize = 200;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A wallet the backend associates with the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendWallet {
    pub address: String,
    #[serde(default)]
    pub is_primary: bool,
}

/// The backend's user record as returned by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendUser {
    pub id: String,
    #[serde(default)]
    pub wallets: Vec<BackendWallet>,
    #[serde(default)]
    pub account_status: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl BackendUser {
    /// The wallet flagged primary, else the first one.
    pub fn primary_wallet(&self) -> Option<&BackendWallet> {
        self.wallets
            .iter()
            .find(|w| w.is_primary)
            .or_else(|| self.wallets.first())
    }
}

/// Backend-issued session credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSession {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A successful exchange that resolved a backend user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeResponse {
    pub user: BackendUser,
    /// When absent, the provider token doubles as the session token.
    pub session: Option<BackendSession>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    user: Option<BackendUser>,
    #[serde(default)]
    session: Option<BackendSession>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Exchanges provider tokens for backend sessions.
#[async_trait]
pub trait BackendSessionClient: Send + Sync {
    /// Exchange `provider_token`.
    ///
    /// `Ok(None)` means the backend was reachable but resolved no user.
    async fn exchange(&self, provider_token: &str) -> Result<Option<ExchangeResponse>>;
}

// ---------------------------------------------------------------------------
// HttpBackendClient
// ---------------------------------------------------------------------------

/// [`BackendSessionClient`] over HTTP.
#[derive(Clone)]
pub struct HttpBackendClient {
    http: reqwest::Client,
    sync_url: url::Url,
}

impl HttpBackendClient {
    /// Build a client for `config.sync_url()` with the configured timeout.
    pub fn new(config: &AuthConfig) -> Result<Self> {
        Self::with_timeout(config.sync_url()?, config.request_timeout())
    }

    /// Build a client posting to `sync_url`.
    pub fn with_timeout(sync_url: url::Url, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("authsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, sync_url })
    }

    pub fn sync_url(&self) -> &url::Url {
        &self.sync_url
    }
}

#[async_trait]
impl BackendSessionClient for HttpBackendClient {
    async fn exchange(&self, provider_token: &str) -> Result<Option<ExchangeResponse>> {
        tracing::debug!(url = %self.sync_url, "exchanging provider token");

        let response = self
            .http
            .post(self.sync_url.clone())
            .bearer_auth(provider_token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| AuthEngineError::BackendExchangeFailed {
                reason: e.to_string(),
                status: e.status().map(|s| s.as_u16()),
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthEngineError::exchange(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
            return Err(AuthEngineError::BackendExchangeFailed {
                reason: format!("HTTP {status}: {preview}"),
                status: Some(status.as_u16()),
            });
        }

        if body.trim().is_empty() {
            tracing::debug!(%status, "exchange returned an empty body");
            return Ok(None);
        }

        let wire: WireResponse = serde_json::from_str(&body)?;
        Ok(wire.user.map(|user| ExchangeResponse {
            user,
            session: wire.session,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

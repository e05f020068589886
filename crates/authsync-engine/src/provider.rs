//! Boundary to the external identity/wallet provider.
//!
//! The provider SDK owns login UI, wallet signing and its own persistence.
//! The controller only needs to read its state, ask it for an access token
//! and tell it to log out.

use std::sync::Mutex;

use async_trait::async_trait;
use authsync_store::LinkedAccount;
use serde::{Deserialize, Serialize};

use crate::error::{AuthEngineError, Result};

/// The user the provider reports as logged in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUser {
    /// Opaque provider-assigned id.
    pub id: String,
    #[serde(default)]
    pub linked_accounts: Vec<LinkedAccount>,
}

impl ProviderUser {
    /// First email found across the linked accounts.
    pub fn email(&self) -> Option<&str> {
        self.linked_accounts.iter().find_map(LinkedAccount::email)
    }
}

/// Point-in-time view of the provider's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderSnapshot {
    /// The SDK finished initialising.
    pub is_ready: bool,
    /// The SDK considers a user logged in.
    pub authenticated: bool,
    pub user: Option<ProviderUser>,
}

impl ProviderSnapshot {
    /// A ready provider with `user` logged in.
    pub fn signed_in(user: ProviderUser) -> Self {
        Self {
            is_ready: true,
            authenticated: true,
            user: Some(user),
        }
    }

    /// A ready provider with nobody logged in.
    pub fn signed_out() -> Self {
        Self {
            is_ready: true,
            authenticated: false,
            user: None,
        }
    }

    /// Ready, flagged authenticated and carrying a user.
    pub fn is_authenticated(&self) -> bool {
        self.is_ready && self.authenticated && self.user.is_some()
    }
}

/// The identity provider as seen by the controller.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Current provider state.
    fn snapshot(&self) -> ProviderSnapshot;

    /// A fresh provider access token, `None` when the SDK cannot issue one.
    async fn access_token(&self) -> Result<Option<String>>;

    /// Log the user out of the provider.
    async fn logout(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// StaticIdentityProvider
// ---------------------------------------------------------------------------

/// Headless provider whose user and token are supplied up front.
///
/// Used by the command-line front-end, where login happened elsewhere and
/// only the resulting provider token is known.
pub struct StaticIdentityProvider {
    state: Mutex<Option<(ProviderUser, String)>>,
}

impl StaticIdentityProvider {
    /// A provider already logged in as `user`, handing out `token`.
    pub fn new(user: ProviderUser, token: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(Some((user, token.into()))),
        }
    }

    /// A provider with nobody logged in.
    pub fn signed_out() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    fn snapshot(&self) -> ProviderSnapshot {
        match self.state.lock() {
            Ok(guard) => match guard.as_ref() {
                Some((user, _)) => ProviderSnapshot::signed_in(user.clone()),
                None => ProviderSnapshot::signed_out(),
            },
            Err(_) => ProviderSnapshot::signed_out(),
        }
    }

    async fn access_token(&self) -> Result<Option<String>> {
        let guard = self.state.lock().map_err(|_| AuthEngineError::ProviderTokenUnavailable)?;
        Ok(guard.as_ref().map(|(_, token)| token.clone()))
    }

    async fn logout(&self) -> Result<()> {
        let mut guard = self
            .state
            .lock()
            .map_err(|e| AuthEngineError::ProviderLogoutFailed {
                reason: format!("provider state poisoned: {e}"),
            })?;
        *guard = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

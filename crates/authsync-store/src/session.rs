//! Persisted backend session: provider id, session token, wallet, linked
//! accounts and the mirrored backend profile.
//!
//! [`SessionStore`] keeps the whole [`SessionState`] as one document. Reads
//! are served from an in-memory snapshot; writes persist first and then
//! swap the snapshot, so a reader sees either the old state or the new one,
//! never a half-written profile.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::kv::{KvStore, KvWrite};

/// Key of the session document in `auth_state`.
pub const SESSION_KEY: &str = "session";

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// An account the identity provider has linked to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkedAccount {
    Email {
        address: String,
    },
    Google {
        email: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Apple {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },
    Twitter {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Discord {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },
    Wallet {
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wallet_client: Option<String>,
    },
}

impl LinkedAccount {
    /// Contact email carried by this account, if any.
    pub fn email(&self) -> Option<&str> {
        match self {
            Self::Email { address } => Some(address),
            Self::Google { email, .. } => Some(email),
            Self::Apple { email } | Self::Discord { email, .. } => email.as_deref(),
            Self::Twitter { .. } | Self::Wallet { .. } => None,
        }
    }

    /// Short provider label, e.g. `google`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Email { .. } => "email",
            Self::Google { .. } => "google",
            Self::Apple { .. } => "apple",
            Self::Twitter { .. } => "twitter",
            Self::Discord { .. } => "discord",
            Self::Wallet { .. } => "wallet",
        }
    }
}

/// The user's primary wallet as cached on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredWallet {
    pub address: String,
    /// Wallet kind; provider-managed wallets are `embedded`.
    #[serde(rename = "type")]
    pub wallet_type: String,
}

impl StoredWallet {
    /// A provider-managed embedded wallet.
    pub fn embedded(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            wallet_type: "embedded".to_string(),
        }
    }
}

/// Mirror of the backend's user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub wallet_address: Option<String>,
    pub account_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything the device remembers about the backend session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionState {
    pub privy_user_id: Option<String>,
    pub access_token: Option<String>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub wallet: Option<StoredWallet>,
    pub linked_accounts: Vec<LinkedAccount>,
    pub profile: Option<UserProfile>,
}

impl SessionState {
    /// `true` when a non-empty token is stored and has not expired at `now`.
    pub fn has_valid_token(&self, now: DateTime<Utc>) -> bool {
        let present = self.access_token.as_deref().is_some_and(|t| !t.is_empty());
        present && self.access_token_expires_at.is_none_or(|exp| exp > now)
    }

    /// `true` when a token is stored but its expiry has passed.
    pub fn has_expired_token(&self, now: DateTime<Utc>) -> bool {
        self.access_token.is_some() && self.access_token_expires_at.is_some_and(|exp| exp <= now)
    }

    /// `true` when nothing is stored.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  SessionStore
// ═══════════════════════════════════════════════════════════════════════

/// Persisted, observable holder of the [`SessionState`].
#[derive(Clone)]
pub struct SessionStore {
    kv: KvStore,
    state: Arc<RwLock<SessionState>>,
    write_gate: Arc<Mutex<()>>,
}

impl SessionStore {
    /// Load the persisted session (or an empty one) from `kv`.
    pub async fn load(kv: KvStore, write_gate: Arc<Mutex<()>>) -> StoreResult<Self> {
        let state: SessionState = kv.get_json(SESSION_KEY).await?.unwrap_or_default();
        debug!(
            has_token = state.access_token.is_some(),
            has_profile = state.profile.is_some(),
            "session state hydrated"
        );
        Ok(Self {
            kv,
            state: Arc::new(RwLock::new(state)),
            write_gate,
        })
    }

    // -- selectors ----------------------------------------------------------

    /// A copy of the current state.
    pub fn snapshot(&self) -> SessionState {
        self.read(Clone::clone)
    }

    pub fn privy_user_id(&self) -> Option<String> {
        self.read(|s| s.privy_user_id.clone())
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(|s| s.access_token.clone())
    }

    pub fn wallet(&self) -> Option<StoredWallet> {
        self.read(|s| s.wallet.clone())
    }

    pub fn linked_accounts(&self) -> Vec<LinkedAccount> {
        self.read(|s| s.linked_accounts.clone())
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.read(|s| s.profile.clone())
    }

    /// See [`SessionState::has_valid_token`].
    pub fn has_valid_token(&self, now: DateTime<Utc>) -> bool {
        self.read(|s| s.has_valid_token(now))
    }

    // -- writes -------------------------------------------------------------

    /// Replace the whole session state.
    pub async fn replace(&self, next: SessionState) -> StoreResult<()> {
        let _gate = self.write_gate.lock().await;
        self.commit(next).await
    }

    /// Apply `f` to a copy of the current state and persist the result.
    pub async fn update<F>(&self, f: F) -> StoreResult<SessionState>
    where
        F: FnOnce(&mut SessionState) + Send,
    {
        let _gate = self.write_gate.lock().await;
        let mut next = self.snapshot();
        f(&mut next);
        self.commit(next.clone()).await?;
        Ok(next)
    }

    /// Wipe the persisted session.
    pub async fn clear(&self) -> StoreResult<()> {
        let _gate = self.write_gate.lock().await;
        self.kv.apply(vec![Self::delete_write()]).await?;
        self.swap(SessionState::default())?;
        info!("session state cleared");
        Ok(())
    }

    async fn commit(&self, next: SessionState) -> StoreResult<()> {
        let write = if next.is_empty() {
            Self::delete_write()
        } else {
            KvWrite::put_json(SESSION_KEY, &next)?
        };
        self.kv.apply(vec![write]).await?;
        self.swap(next)
    }

    // -- crate-internal hooks for combined writes -----------------------------

    pub(crate) fn delete_write() -> KvWrite {
        KvWrite::Delete { key: SESSION_KEY }
    }

    pub(crate) fn swap(&self, next: SessionState) -> StoreResult<()> {
        let mut guard = self
            .state
            .write()
            .map_err(|e| StoreError::TaskJoin(format!("session lock poisoned: {e}")))?;
        *guard = next;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&SessionState) -> T) -> T {
        match self.state.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

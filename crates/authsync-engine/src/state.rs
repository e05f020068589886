//! Pure predicates over the current provider, session and flow state.
//!
//! Nothing here performs I/O: the controller snapshots its inputs, asks
//! [`decide`] what to do, and carries the action out.

use authsync_store::{AuthFlowState, SessionState};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::provider::ProviderSnapshot;

/// Values recomputed on every evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedAuth {
    pub provider_ready: bool,
    pub provider_authenticated: bool,
    pub has_valid_backend_token: bool,
    /// A token is stored but its expiry has passed.
    pub backend_token_expired: bool,
    /// A token (valid or not) is stored.
    pub backend_token_present: bool,
    pub needs_sync: bool,
    pub authenticated: bool,
}

/// Derive the authentication booleans from current state.
pub fn derive_auth(
    provider: &ProviderSnapshot,
    session: &SessionState,
    now: DateTime<Utc>,
) -> DerivedAuth {
    let provider_ready = provider.is_ready;
    let provider_authenticated = provider.is_authenticated();
    let has_valid_backend_token = session.has_valid_token(now);
    DerivedAuth {
        provider_ready,
        provider_authenticated,
        has_valid_backend_token,
        backend_token_expired: session.has_expired_token(now),
        backend_token_present: session.access_token.is_some(),
        needs_sync: provider_authenticated && !has_valid_backend_token,
        authenticated: provider_authenticated && has_valid_backend_token,
    }
}

/// What an evaluation should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do.
    Idle,
    /// Run one token exchange.
    StartSync,
    /// The provider logged out behind our back; wipe the backend side.
    ResetAfterProviderLogout,
    /// The stored token expired; allow one more exchange.
    ResyncExpiredToken,
}

/// Choose the action for the current state.
///
/// `is_syncing` is the in-memory mutex flag; a sync only starts when it is
/// clear, no explicit logout is running and the session has not been synced.
pub fn decide(derived: &DerivedAuth, flow: &AuthFlowState, is_syncing: bool) -> Action {
    if !derived.provider_ready || flow.is_logging_out {
        return Action::Idle;
    }

    if !derived.provider_authenticated {
        if flow.has_synced_user || derived.backend_token_present {
            return Action::ResetAfterProviderLogout;
        }
        return Action::Idle;
    }

    if !derived.needs_sync {
        return Action::Idle;
    }

    if flow.has_synced_user {
        // Given up, or degraded without a token: stay put until the user
        // logs in again. Only an expired token earns another exchange.
        if derived.backend_token_expired && !is_syncing {
            return Action::ResyncExpiredToken;
        }
        return Action::Idle;
    }

    if is_syncing {
        return Action::Idle;
    }
    Action::StartSync
}

/// Coarse lifecycle phase, for display and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    SignedOut,
    /// Provider authenticated, exchange not yet started.
    PendingSync,
    Syncing,
    Synced,
    SigningOut,
}

impl SessionPhase {
    pub fn of(derived: &DerivedAuth, flow: &AuthFlowState, is_syncing: bool) -> Self {
        if flow.is_logging_out {
            Self::SigningOut
        } else if is_syncing {
            Self::Syncing
        } else if derived.authenticated {
            Self::Synced
        } else if derived.needs_sync && !flow.has_synced_user {
            Self::PendingSync
        } else {
            Self::SignedOut
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SignedOut => "signed_out",
            Self::PendingSync => "pending_sync",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::SigningOut => "signing_out",
        };
        f.write_str(s)
    }
}

/// The single derived view the rest of the app renders from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthView {
    pub is_authenticated: bool,
    pub is_loading: bool,
    pub is_syncing: bool,
    pub sync_error: Option<String>,
    pub phase: SessionPhase,
}

impl AuthView {
    /// The view before anything is known.
    pub fn initial() -> Self {
        Self {
            is_authenticated: false,
            is_loading: true,
            is_syncing: false,
            sync_error: None,
            phase: SessionPhase::SignedOut,
        }
    }

    /// Build the view from derived state.
    pub fn compose(
        derived: &DerivedAuth,
        flow: &AuthFlowState,
        is_syncing: bool,
        sync_error: Option<String>,
    ) -> Self {
        let phase = SessionPhase::of(derived, flow, is_syncing);
        Self {
            is_authenticated: derived.authenticated,
            is_loading: !derived.provider_ready
                || matches!(phase, SessionPhase::Syncing | SessionPhase::PendingSync),
            is_syncing,
            sync_error,
            phase,
        }
    }

    /// Whether navigation decisions may be taken on this view.
    pub fn is_ready(&self) -> bool {
        !self.is_loading
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Error types for the auth engine crate.
//!
//! Every engine operation surfaces failures through [`AuthEngineError`].
//! The first four variants are the session-orchestration taxonomy; the rest
//! wrap the underlying libraries.

/// Unified error type for the authsync engine.
#[derive(Debug, thiserror::Error)]
pub enum AuthEngineError {
    // -- Orchestration ------------------------------------------------------
    /// The identity provider could not hand out an access token.
    #[error("identity provider returned no access token")]
    ProviderTokenUnavailable,

    /// The backend rejected or failed the token exchange.
    #[error("backend token exchange failed: {reason}")]
    BackendExchangeFailed {
        /// What went wrong.
        reason: String,
        /// HTTP status, when the backend answered at all.
        status: Option<u16>,
    },

    /// The identity provider failed to log out.
    #[error("identity provider logout failed: {reason}")]
    ProviderLogoutFailed { reason: String },

    /// A result arrived after the session it belonged to was torn down.
    #[error("stale result discarded")]
    StaleResultDiscarded,

    /// The operation needs a stored backend session.
    #[error("no authenticated session")]
    NotAuthenticated,

    // -- Configuration ------------------------------------------------------
    /// Configuration is missing or malformed.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // -- Underlying errors --------------------------------------------------
    /// An HTTP request could not be sent or its response not read.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// An error propagated from the state stores.
    #[error("store error: {0}")]
    Store(#[from] authsync_store::StoreError),

    /// JSON serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing error.
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// I/O error (e.g. reading the config file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthEngineError {
    /// Shorthand for a [`AuthEngineError::BackendExchangeFailed`] without a status.
    pub fn exchange(reason: impl Into<String>) -> Self {
        Self::BackendExchangeFailed {
            reason: reason.into(),
            status: None,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AuthEngineError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_exchange_failed() {
        let err = AuthEngineError::BackendExchangeFailed {
            reason: "HTTP 401".into(),
            status: Some(401),
        };
        assert_eq!(err.to_string(), "backend token exchange failed: HTTP 401");
    }

    #[test]
    fn error_display_provider_logout_failed() {
        let err = AuthEngineError::ProviderLogoutFailed {
            reason: "sdk offline".into(),
        };
        assert_eq!(err.to_string(), "identity provider logout failed: sdk offline");
    }

    #[test]
    fn exchange_shorthand_has_no_status() {
        match AuthEngineError::exchange("timeout") {
            AuthEngineError::BackendExchangeFailed { reason, status } => {
                assert_eq!(reason, "timeout");
                assert!(status.is_none());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AuthEngineError>();
    }
}

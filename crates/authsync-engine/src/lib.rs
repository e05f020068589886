//! Auth session orchestration for authsync.
//!
//! This crate reconciles an external identity provider with the
//! application backend:
//!
//! - **Token exchange** exactly once per provider login, guarded by an
//!   in-memory mutex and a persisted `hasSyncedUser` flag
//! - **Recovery**: a failed exchange forces a full sign-out
//! - **Logout** and reset when the provider loses its session on its own
//! - **Navigation guard** redirecting between the signed-out area and the
//!   authenticated app shell, at most once per auth edge
//!
//! # Architecture
//!
//! ```text
//! AuthSessionController
//! ├── IdentityProvider      (provider SDK boundary)
//! ├── BackendSessionClient  (token exchange, HTTP by default)
//! ├── AuthStores            (SessionStore + AuthFlowStore, SQLite)
//! └── watch::Sender<AuthView>
//!           │
//!           ▼
//!     NavigationGuard ──► NavigationRouter
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use authsync_engine::{
//!     AuthConfig, AuthSessionController, HttpBackendClient, ProviderUser,
//!     StaticIdentityProvider,
//! };
//! use authsync_store::AuthStores;
//!
//! # async fn example() -> authsync_engine::error::Result<()> {
//! let config = AuthConfig::load("config/default.toml")?;
//! let stores = AuthStores::open(config.database_path.clone()).await?;
//! let provider = StaticIdentityProvider::new(
//!     ProviderUser { id: "did:privy:abc".into(), linked_accounts: vec![] },
//!     "provider-token",
//! );
//! let backend = HttpBackendClient::new(&config)?;
//!
//! let controller =
//!     AuthSessionController::new(Arc::new(provider), Arc::new(backend), stores, &config);
//! controller.evaluate().await?;
//! println!("authenticated: {}", controller.view().is_authenticated);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod navigation;
pub mod provider;
pub mod state;

// Re-export key types at the crate root for convenience.
pub use backend::{
    BackendSession, BackendSessionClient, BackendUser, BackendWallet, ExchangeResponse,
    HttpBackendClient,
};
pub use config::{AuthConfig, DEFAULT_CONFIG_PATH};
pub use controller::{AuthSessionController, Evaluation, SyncOutcome};
pub use error::{AuthEngineError, Result};
pub use navigation::{GuardInput, LoggingRouter, NavigationGuard, NavigationRouter, Redirect, RouteConfig};
pub use provider::{IdentityProvider, ProviderSnapshot, ProviderUser, StaticIdentityProvider};
pub use state::{Action, AuthView, DerivedAuth, SessionPhase, decide, derive_auth};

//! # authsync-store
//!
//! Persisted client-side auth state.
//!
//! Two documents live in one SQLite key/value table:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  SessionStore   provider id, token, wallet,  │
//! │                 linked accounts, profile     │
//! │  AuthFlowStore  hasSyncedUser, isLoggingOut  │
//! ├──────────────────────────────────────────────┤
//! │  AuthStores     cross-document transactions  │
//! ├──────────────────────────────────────────────┤
//! │  KvStore        auth_state + auth_events     │
//! │  Database       rusqlite WAL, migrations     │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Both documents survive a restart and are wiped together on logout.
//!
//! ```ignore
//! use authsync_store::AuthStores;
//!
//! let stores = AuthStores::open("data/auth.db").await?;
//! if stores.flow().has_synced_user() {
//!     println!("wallet: {:?}", stores.session().wallet());
//! }
//! ```

pub mod db;
pub mod error;
pub mod flow;
pub mod kv;
pub mod migration;
pub mod session;
pub mod stores;

// ── re-exports ───────────────────────────────────────────────────────

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use flow::{AuthFlowState, AuthFlowStore};
pub use kv::{AuthEvent, KvStore, KvWrite};
pub use session::{LinkedAccount, SessionState, SessionStore, StoredWallet, UserProfile};
pub use stores::{AuthStores, INTERRUPTED_LOGOUT_EVENT};

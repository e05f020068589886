//! The pair of persisted stores plus the writes that must span both.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db::Database;
use crate::error::StoreResult;
use crate::flow::{AuthFlowState, AuthFlowStore, FLOW_KEY};
use crate::kv::{KvStore, KvWrite};
use crate::session::{SessionState, SessionStore};

/// Audit kind recorded when a leftover logout is finished on open.
pub const INTERRUPTED_LOGOUT_EVENT: &str = "logout_resumed";

/// Session and auth-flow stores sharing one database and one write gate.
///
/// Writes through [`AuthStores`] land in a single SQLite transaction; the
/// in-memory snapshots are swapped afterwards, session first.
#[derive(Clone)]
pub struct AuthStores {
    kv: KvStore,
    session: SessionStore,
    flow: AuthFlowStore,
    write_gate: Arc<Mutex<()>>,
}

impl AuthStores {
    /// Open the database at `path`, migrate it and hydrate both stores.
    pub async fn open(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let db = Database::open_and_migrate(path).await?;
        Self::from_database(db).await
    }

    /// Stores backed by a fresh in-memory database.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let db = Database::open_in_memory()?;
        db.run_migrations().await?;
        Self::from_database(db).await
    }

    /// Hydrate both stores from an already migrated database.
    ///
    /// A persisted `isLoggingOut` means the last process died mid-logout;
    /// that teardown is finished here before anything reads the session.
    pub async fn from_database(db: Database) -> StoreResult<Self> {
        let kv = KvStore::new(db);
        let write_gate = Arc::new(Mutex::new(()));
        let session = SessionStore::load(kv.clone(), Arc::clone(&write_gate)).await?;
        let flow = AuthFlowStore::load(kv.clone(), Arc::clone(&write_gate)).await?;
        let stores = Self {
            kv,
            session,
            flow,
            write_gate,
        };
        if stores.flow.is_logging_out() {
            warn!("previous logout was interrupted, finishing teardown");
            stores.reset_all().await?;
            if let Err(e) = stores.kv.record_event(INTERRUPTED_LOGOUT_EVENT, None).await {
                warn!(error = %e, "failed to record resumed logout");
            }
        }
        Ok(stores)
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn flow(&self) -> &AuthFlowStore {
        &self.flow
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    /// Persist the result of an exchange and mark the session synced, in one
    /// transaction.
    ///
    /// `session` is `None` when the exchange was given up and nothing but the
    /// flag should change. Returns `false` (writing nothing) when the session
    /// was already marked synced or a logout is under way.
    pub async fn complete_sync(&self, session: Option<SessionState>) -> StoreResult<bool> {
        let _gate = self.write_gate.lock().await;
        let flow = self.flow.snapshot();
        if flow.has_synced_user || flow.is_logging_out {
            return Ok(false);
        }
        let next_flow = AuthFlowState {
            has_synced_user: true,
            ..flow
        };

        let mut writes = Vec::with_capacity(2);
        if let Some(ref state) = session {
            writes.push(KvWrite::put_json(crate::session::SESSION_KEY, state)?);
        }
        writes.push(KvWrite::put_json(FLOW_KEY, &next_flow)?);
        self.kv.apply(writes).await?;

        if let Some(state) = session {
            self.session.swap(state)?;
        }
        self.flow.swap(next_flow)?;
        Ok(true)
    }

    /// Wipe the session and return the flow flags to their initial values,
    /// in one transaction.
    pub async fn reset_all(&self) -> StoreResult<()> {
        let _gate = self.write_gate.lock().await;
        self.kv
            .apply(vec![SessionStore::delete_write(), AuthFlowStore::delete_write()])
            .await?;
        self.session.swap(SessionState::default())?;
        self.flow.swap(AuthFlowState::default())?;
        info!("session and auth flow state reset");
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────

//! Persisted orchestration flags.
//!
//! Kept apart from the session document so the flow can be reset without
//! touching cached profile data (and the other way round).

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::kv::{KvStore, KvWrite};

/// Key of the flow document in `auth_state`.
pub const FLOW_KEY: &str = "auth_flow";

/// Where the orchestration currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthFlowState {
    /// An exchange finished (or was given up) for the current provider session.
    pub has_synced_user: bool,
    /// An explicit logout is in progress.
    pub is_logging_out: bool,
}

/// Persisted holder of the [`AuthFlowState`].
#[derive(Clone)]
pub struct AuthFlowStore {
    kv: KvStore,
    state: Arc<RwLock<AuthFlowState>>,
    write_gate: Arc<Mutex<()>>,
}

impl AuthFlowStore {
    /// Load the persisted flags (or the initial values) from `kv`.
    pub async fn load(kv: KvStore, write_gate: Arc<Mutex<()>>) -> StoreResult<Self> {
        let state: AuthFlowState = kv.get_json(FLOW_KEY).await?.unwrap_or_default();
        debug!(?state, "auth flow state hydrated");
        Ok(Self {
            kv,
            state: Arc::new(RwLock::new(state)),
            write_gate,
        })
    }

    pub fn snapshot(&self) -> AuthFlowState {
        match self.state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn has_synced_user(&self) -> bool {
        self.snapshot().has_synced_user
    }

    pub fn is_logging_out(&self) -> bool {
        self.snapshot().is_logging_out
    }

    /// Clear `has_synced_user` so the next evaluation may exchange again.
    pub async fn unmark_synced(&self) -> StoreResult<()> {
        let _gate = self.write_gate.lock().await;
        let current = self.snapshot();
        self.commit(AuthFlowState {
            has_synced_user: false,
            ..current
        })
        .await
    }

    /// Raise `is_logging_out`.
    pub async fn begin_logout(&self) -> StoreResult<()> {
        let _gate = self.write_gate.lock().await;
        let current = self.snapshot();
        self.commit(AuthFlowState {
            is_logging_out: true,
            ..current
        })
        .await
    }

    /// Return to the initial values.
    pub async fn reset(&self) -> StoreResult<()> {
        let _gate = self.write_gate.lock().await;
        self.kv.apply(vec![Self::delete_write()]).await?;
        self.swap(AuthFlowState::default())
    }

    async fn commit(&self, next: AuthFlowState) -> StoreResult<()> {
        self.kv.apply(vec![KvWrite::put_json(FLOW_KEY, &next)?]).await?;
        self.swap(next)
    }

    pub(crate) fn delete_write() -> KvWrite {
        KvWrite::Delete { key: FLOW_KEY }
    }

    pub(crate) fn swap(&self, next: AuthFlowState) -> StoreResult<()> {
        let mut guard = self
            .state
            .write()
            .map_err(|e| StoreError::TaskJoin(format!("auth flow lock poisoned: {e}")))?;
        *guard = next;
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────

//! Session orchestration between the identity provider and the backend.
//!
//! The [`AuthSessionController`] watches the provider's state, exchanges the
//! provider token for a backend session exactly once per login, and keeps
//! the persisted stores consistent with what the provider reports. It
//! publishes an [`AuthView`] on a `tokio::sync::watch` channel every time
//! the derived state changes.
//!
//! Evaluation is pull-based: the host calls [`AuthSessionController::evaluate`]
//! whenever the provider's state may have changed (or hands a change signal
//! to [`AuthSessionController::watch_provider`]). Concurrent evaluations are
//! safe; the in-memory `is_syncing` flag is checked and set under one lock so
//! at most one exchange is in flight.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use authsync_store::{AuthStores, SessionState, StoredWallet, UserProfile};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::{BackendSessionClient, ExchangeResponse};
use crate::config::AuthConfig;
use crate::error::{AuthEngineError, Result};
use crate::provider::{IdentityProvider, ProviderUser};
use crate::state::{Action, AuthView, derive_auth, decide};

/// Status recorded for a backend user that reported none.
const DEFAULT_ACCOUNT_STATUS: &str = "active";

/// Audit event kinds written to `auth_events`.
mod event {
    pub const SYNCED: &str = "sync_completed";
    pub const DEGRADED: &str = "sync_degraded";
    pub const GAVE_UP: &str = "sync_gave_up";
    pub const FAILED: &str = "sync_failed";
    pub const DISCARDED: &str = "sync_discarded";
    pub const LOGOUT: &str = "logout";
    pub const PROVIDER_LOGOUT: &str = "provider_logout_reset";
    pub const LOGOUT_RESUMED: &str = "logout_resumed";
    pub const EXPIRED: &str = "token_expired";
    pub const PROFILE: &str = "profile_updated";
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// How a single exchange attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The backend resolved a user; the full session was stored.
    Synced { user_id: String },
    /// The backend resolved no user; the provider token was stored instead.
    Degraded,
    /// The provider had no token; the session was marked synced and left empty.
    GaveUp,
    /// The exchange failed; the provider was logged out and state reset.
    Failed { reason: String },
    /// The result arrived after its session was torn down and was dropped.
    Discarded,
}

/// What an [`AuthSessionController::evaluate`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// Nothing needed doing, or another evaluation owns the work.
    Idle,
    /// An exchange ran.
    Sync(SyncOutcome),
    /// The provider logged out on its own; backend state was wiped.
    ProviderLogoutReset,
    /// A logout flag with no logout running was found; its teardown was
    /// finished.
    LogoutResumed,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// In-memory state that never touches disk.
#[derive(Debug, Default)]
struct Runtime {
    is_syncing: bool,
    /// An explicit logout is running in this process.
    logging_out: bool,
    sync_error: Option<String>,
    /// Bumped on every raised error so an older clear timer does nothing.
    error_generation: u64,
    /// Bumped on every teardown so in-flight results can tell they are stale.
    epoch: u64,
}

struct Inner {
    provider: Arc<dyn IdentityProvider>,
    backend: Arc<dyn BackendSessionClient>,
    stores: AuthStores,
    runtime: Mutex<Runtime>,
    /// Serialises "check epoch, then write" against "bump epoch, then wipe".
    commit_lock: tokio::sync::Mutex<()>,
    view_tx: watch::Sender<AuthView>,
    error_clear_delay: Duration,
}

/// Reconciles the identity provider with the backend session.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct AuthSessionController {
    inner: Arc<Inner>,
}

impl AuthSessionController {
    /// Create a controller over already-hydrated stores.
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        backend: Arc<dyn BackendSessionClient>,
        stores: AuthStores,
        config: &AuthConfig,
    ) -> Self {
        let (view_tx, _) = watch::channel(AuthView::initial());
        let controller = Self {
            inner: Arc::new(Inner {
                provider,
                backend,
                stores,
                runtime: Mutex::new(Runtime::default()),
                commit_lock: tokio::sync::Mutex::new(()),
                view_tx,
                error_clear_delay: config.error_clear_delay(),
            }),
        };
        controller.inner.publish();
        controller
    }

    /// The stores this controller writes to.
    pub fn stores(&self) -> &AuthStores {
        &self.inner.stores
    }

    /// The current derived view.
    pub fn view(&self) -> AuthView {
        self.inner.compute_view()
    }

    /// Subscribe to view changes.
    pub fn subscribe(&self) -> watch::Receiver<AuthView> {
        self.inner.view_tx.subscribe()
    }

    /// Re-derive state from the provider and the stores and act on it.
    ///
    /// Call this whenever the provider's state may have changed.
    pub async fn evaluate(&self) -> Result<Evaluation> {
        let result = self.evaluate_inner().await;
        self.inner.publish();
        result
    }

    async fn evaluate_inner(&self) -> Result<Evaluation> {
        loop {
            let provider = self.inner.provider.snapshot();
            let session = self.inner.stores.session().snapshot();
            let flow = self.inner.stores.flow().snapshot();
            let derived = derive_auth(&provider, &session, Utc::now());
            let (is_syncing, logging_out) = {
                let rt = self.inner.lock_runtime();
                (rt.is_syncing, rt.logging_out)
            };

            if flow.is_logging_out && !logging_out {
                self.resume_interrupted_logout().await?;
                return Ok(Evaluation::LogoutResumed);
            }

            match decide(&derived, &flow, is_syncing) {
                Action::Idle => return Ok(Evaluation::Idle),
                Action::StartSync => {
                    let Some(user) = provider.user else {
                        return Ok(Evaluation::Idle);
                    };
                    let Some(epoch) = self.try_begin_sync() else {
                        tracing::debug!("sync already in flight, skipping");
                        return Ok(Evaluation::Idle);
                    };
                    let outcome = self.run_sync(user, epoch).await;
                    return Ok(Evaluation::Sync(outcome));
                }
                Action::ResetAfterProviderLogout => {
                    if self.reset_after_provider_logout().await? {
                        return Ok(Evaluation::ProviderLogoutReset);
                    }
                    return Ok(Evaluation::Idle);
                }
                Action::ResyncExpiredToken => {
                    tracing::info!("stored session token expired, allowing one re-sync");
                    self.inner.stores.flow().unmark_synced().await?;
                    self.inner.audit(event::EXPIRED, None).await;
                    // Decide again with the flag cleared.
                }
            }
        }
    }

    /// Forward every change on `changes` to [`Self::evaluate`].
    ///
    /// Each evaluation runs on its own task, so a change that arrives while a
    /// sync is in flight is still seen (and rejected by the mutex).
    pub fn watch_provider<T>(&self, mut changes: watch::Receiver<T>) -> JoinHandle<()>
    where
        T: Send + Sync + 'static,
    {
        let controller = self.clone();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let controller = controller.clone();
                tokio::spawn(async move {
                    if let Err(e) = controller.evaluate().await {
                        tracing::warn!(error = %e, "auth evaluation failed");
                    }
                });
            }
            tracing::debug!("provider change channel closed");
        })
    }

    // -- sync ---------------------------------------------------------------

    /// Check-and-set `is_syncing`. Returns the epoch the sync belongs to.
    fn try_begin_sync(&self) -> Option<u64> {
        let flow = self.inner.stores.flow().snapshot();
        let epoch = {
            let mut rt = self.inner.lock_runtime();
            if rt.is_syncing || flow.is_logging_out || flow.has_synced_user {
                return None;
            }
            rt.is_syncing = true;
            rt.sync_error = None;
            rt.epoch
        };
        self.inner.publish();
        Some(epoch)
    }

    async fn run_sync(&self, user: ProviderUser, epoch: u64) -> SyncOutcome {
        let attempt = uuid::Uuid::now_v7();
        tracing::info!(%attempt, provider_user = %user.id, "starting backend sync");

        let outcome = match self.exchange_and_store(&user, epoch).await {
            Ok(outcome) => outcome,
            Err(AuthEngineError::StaleResultDiscarded) => {
                tracing::info!(%attempt, "session changed during sync, result discarded");
                self.inner.audit(event::DISCARDED, Some(&user.id)).await;
                SyncOutcome::Discarded
            }
            Err(err) => self.recover_from_failure(err, epoch).await,
        };

        self.inner.lock_runtime().is_syncing = false;
        self.inner.publish();
        tracing::info!(%attempt, ?outcome, "backend sync finished");
        outcome
    }

    async fn exchange_and_store(&self, user: &ProviderUser, epoch: u64) -> Result<SyncOutcome> {
        // Step 1: Obtain the provider token.
        let provider_token = match self.inner.provider.access_token().await {
            Ok(Some(token)) if !token.is_empty() => token,
            Ok(_) => {
                tracing::warn!("{}; giving up on this session", AuthEngineError::ProviderTokenUnavailable);
                return self.commit(epoch, user, None, SyncOutcome::GaveUp).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "provider token request failed; giving up on this session");
                return self.commit(epoch, user, None, SyncOutcome::GaveUp).await;
            }
        };

        // Step 2: Exchange it with the backend.
        let response = self.inner.backend.exchange(&provider_token).await?;

        // Step 3: Bail out if the session was torn down meanwhile.
        self.ensure_current(epoch, user)?;

        // Step 4: Persist.
        match response {
            Some(response) => {
                let user_id = response.user.id.clone();
                let session = synced_session(user, provider_token, response)?;
                self.commit(epoch, user, Some(session), SyncOutcome::Synced { user_id })
                    .await
            }
            None => {
                tracing::warn!("backend resolved no user, continuing with the provider token");
                let session = SessionState {
                    privy_user_id: Some(user.id.clone()),
                    access_token: Some(provider_token),
                    linked_accounts: user.linked_accounts.clone(),
                    ..SessionState::default()
                };
                self.commit(epoch, user, Some(session), SyncOutcome::Degraded)
                    .await
            }
        }
    }

    /// Write the sync result and the synced flag together, unless stale.
    async fn commit(
        &self,
        epoch: u64,
        user: &ProviderUser,
        session: Option<SessionState>,
        outcome: SyncOutcome,
    ) -> Result<SyncOutcome> {
        let _commit = self.inner.commit_lock.lock().await;
        self.ensure_current(epoch, user)?;
        if !self.inner.stores.complete_sync(session).await? {
            return Err(AuthEngineError::StaleResultDiscarded);
        }

        let (kind, detail) = match &outcome {
            SyncOutcome::Synced { user_id } => (event::SYNCED, Some(user_id.as_str())),
            SyncOutcome::Degraded => (event::DEGRADED, Some(user.id.as_str())),
            _ => (event::GAVE_UP, Some(user.id.as_str())),
        };
        self.inner.audit(kind, detail).await;
        Ok(outcome)
    }

    fn ensure_current(&self, epoch: u64, user: &ProviderUser) -> Result<()> {
        let logging_out = self.inner.stores.flow().is_logging_out();
        let epoch_moved = self.inner.lock_runtime().epoch != epoch;
        let same_user = self
            .inner
            .provider
            .snapshot()
            .user
            .is_some_and(|current| current.id == user.id);
        if logging_out || epoch_moved || !same_user {
            return Err(AuthEngineError::StaleResultDiscarded);
        }
        Ok(())
    }

    /// Force a full sign-out after a failed exchange.
    async fn recover_from_failure(&self, err: AuthEngineError, epoch: u64) -> SyncOutcome {
        let reason = err.to_string();
        tracing::error!(error = %reason, "backend sync failed, signing out");

        if self.inner.stores.flow().is_logging_out() || self.inner.lock_runtime().epoch != epoch {
            // An explicit logout or reset already owns the teardown.
            self.inner.audit(event::DISCARDED, Some(&reason)).await;
            return SyncOutcome::Discarded;
        }

        self.raise_error(reason.clone());

        if let Err(e) = self.inner.provider.logout().await {
            tracing::warn!(error = %e, "provider logout after failed sync also failed");
        }

        {
            let _commit = self.inner.commit_lock.lock().await;
            self.inner.lock_runtime().epoch += 1;
            if let Err(e) = self.inner.stores.reset_all().await {
                tracing::error!(error = %e, "failed to reset stores after sync failure");
            }
        }
        self.inner.audit(event::FAILED, Some(&reason)).await;
        SyncOutcome::Failed { reason }
    }

    /// Show `message` as the sync error and clear it after the configured
    /// delay, unless a newer error replaced it.
    fn raise_error(&self, message: String) {
        let generation = {
            let mut rt = self.inner.lock_runtime();
            rt.error_generation += 1;
            rt.sync_error = Some(message);
            rt.error_generation
        };
        self.inner.publish();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.error_clear_delay).await;
            let cleared = {
                let mut rt = inner.lock_runtime();
                if rt.error_generation == generation && rt.sync_error.is_some() {
                    rt.sync_error = None;
                    true
                } else {
                    false
                }
            };
            if cleared {
                tracing::debug!("sync error cleared");
                inner.publish();
            }
        });
    }

    // -- teardown -----------------------------------------------------------

    /// Log the user out of the provider and wipe the backend session.
    ///
    /// Local state is cleared even when the provider logout fails; that
    /// failure is then returned as [`AuthEngineError::ProviderLogoutFailed`].
    pub async fn logout(&self) -> Result<()> {
        tracing::info!("logout requested");
        self.inner.lock_runtime().logging_out = true;
        let result = self.run_logout().await;
        self.inner.lock_runtime().logging_out = false;
        self.inner.publish();
        result
    }

    async fn run_logout(&self) -> Result<()> {
        // Step 1: Block new syncs and mark in-flight ones stale.
        self.inner.stores.flow().begin_logout().await?;
        self.inner.publish();

        // Step 2: Provider logout, best effort.
        let provider_result = self.inner.provider.logout().await;
        if let Err(ref e) = provider_result {
            tracing::warn!(error = %e, "provider logout failed, clearing local session anyway");
        }

        // Step 3: Wipe the session, then the flow flags.
        self.teardown().await?;
        self.inner.audit(event::LOGOUT, None).await;
        tracing::info!("logout complete");

        provider_result.map_err(|e| AuthEngineError::ProviderLogoutFailed {
            reason: e.to_string(),
        })
    }

    /// Bump the epoch and wipe both stores.
    ///
    /// If the wipe fails the flow flags are still cleared on their own, so a
    /// stuck `isLoggingOut` never blocks later syncs; the leftover token is
    /// then picked up by the provider-logout reset.
    async fn teardown(&self) -> Result<()> {
        let _commit = self.inner.commit_lock.lock().await;
        self.inner.lock_runtime().epoch += 1;
        if let Err(e) = self.inner.stores.reset_all().await {
            tracing::error!(error = %e, "session wipe failed, clearing flow flags only");
            if let Err(flow_err) = self.inner.stores.flow().reset().await {
                tracing::error!(error = %flow_err, "flow flag reset failed too");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Finish a logout whose flag is set but which no call in this process
    /// is running.
    async fn resume_interrupted_logout(&self) -> Result<()> {
        tracing::warn!("found an unfinished logout, completing teardown");
        self.teardown().await?;
        self.inner.audit(event::LOGOUT_RESUMED, None).await;
        Ok(())
    }

    /// Wipe the backend side after the provider logged out on its own.
    ///
    /// Returns `false` when another evaluation already did it.
    async fn reset_after_provider_logout(&self) -> Result<bool> {
        {
            let _commit = self.inner.commit_lock.lock().await;
            let provider = self.inner.provider.snapshot();
            let session = self.inner.stores.session().snapshot();
            let flow = self.inner.stores.flow().snapshot();
            let derived = derive_auth(&provider, &session, Utc::now());
            let is_syncing = self.inner.lock_runtime().is_syncing;
            if decide(&derived, &flow, is_syncing) != Action::ResetAfterProviderLogout {
                return Ok(false);
            }

            tracing::info!("provider reports no user, resetting backend session");
            self.inner.lock_runtime().epoch += 1;
            self.inner.stores.reset_all().await?;
        }
        self.inner.audit(event::PROVIDER_LOGOUT, None).await;
        Ok(true)
    }

    // -- profile ------------------------------------------------------------

    /// Store a fresh copy of the backend profile.
    ///
    /// The wallet follows the profile's address when it has one.
    pub async fn update_profile(&self, profile: UserProfile) -> Result<SessionState> {
        if !self.inner.stores.session().has_valid_token(Utc::now()) {
            return Err(AuthEngineError::NotAuthenticated);
        }
        let profile_id = profile.id.clone();
        let state = self
            .inner
            .stores
            .session()
            .update(move |s| {
                if let Some(address) = profile.wallet_address.as_deref() {
                    let unchanged = s.wallet.as_ref().is_some_and(|w| w.address == address);
                    if !unchanged {
                        s.wallet = Some(StoredWallet::embedded(address));
                    }
                }
                s.profile = Some(profile);
            })
            .await?;
        self.inner.audit(event::PROFILE, Some(&profile_id)).await;
        self.inner.publish();
        Ok(state)
    }

    /// Copy the provider's current linked accounts into the session.
    pub async fn refresh_linked_accounts(&self) -> Result<()> {
        let snapshot = self.inner.provider.snapshot();
        let authenticated = snapshot.is_authenticated();
        let Some(user) = snapshot.user.filter(|_| authenticated) else {
            return Err(AuthEngineError::NotAuthenticated);
        };
        if self.inner.stores.session().access_token().is_none() {
            return Err(AuthEngineError::NotAuthenticated);
        }
        self.inner
            .stores
            .session()
            .update(move |s| s.linked_accounts = user.linked_accounts)
            .await?;
        Ok(())
    }
}

impl Inner {
    fn lock_runtime(&self) -> MutexGuard<'_, Runtime> {
        match self.runtime.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn compute_view(&self) -> AuthView {
        let provider = self.provider.snapshot();
        let session = self.stores.session().snapshot();
        let flow = self.stores.flow().snapshot();
        let derived = derive_auth(&provider, &session, Utc::now());
        let (is_syncing, sync_error) = {
            let rt = self.lock_runtime();
            (rt.is_syncing, rt.sync_error.clone())
        };
        AuthView::compose(&derived, &flow, is_syncing, sync_error)
    }

    fn publish(&self) {
        let view = self.compute_view();
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    async fn audit(&self, kind: &str, detail: Option<&str>) {
        if let Err(e) = self.stores.kv().record_event(kind, detail).await {
            tracing::warn!(kind, error = %e, "failed to record auth event");
        }
    }
}

/// Session built from a successful exchange.
///
/// An empty backend token would leave the session neither valid nor expired,
/// so it fails the exchange instead.
fn synced_session(
    user: &ProviderUser,
    provider_token: String,
    response: ExchangeResponse,
) -> Result<SessionState> {
    let ExchangeResponse { user: backend_user, session } = response;
    let wallet_address = backend_user.primary_wallet().map(|w| w.address.clone());
    let (access_token, expires_at) = match session {
        Some(s) if s.token.trim().is_empty() => {
            return Err(AuthEngineError::exchange("backend returned an empty session token"));
        }
        Some(s) => (s.token, s.expires_at),
        None => (provider_token, None),
    };
    let profile = UserProfile {
        id: backend_user.id,
        wallet_address: wallet_address.clone(),
        account_status: backend_user
            .account_status
            .unwrap_or_else(|| DEFAULT_ACCOUNT_STATUS.to_string()),
        created_at: backend_user.created_at,
        updated_at: backend_user.updated_at.unwrap_or(backend_user.created_at),
    };
    Ok(SessionState {
        privy_user_id: Some(user.id.clone()),
        access_token: Some(access_token),
        access_token_expires_at: expires_at,
        wallet: wallet_address.map(|address| StoredWallet::embedded(address)),
        linked_accounts: user.linked_accounts.clone(),
        profile: Some(profile),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use authsync_store::LinkedAccount;
    use tokio::sync::Notify;

    use super::*;
    use crate::backend::{BackendSession, BackendUser, BackendWallet};
    use crate::provider::ProviderSnapshot;
    use crate::state::SessionPhase;

    // -- fakes --------------------------------------------------------------

    struct FakeProvider {
        snapshot: Mutex<ProviderSnapshot>,
        token: Mutex<Option<String>>,
        fail_logout: bool,
        logout_calls: AtomicUsize,
    }

    impl FakeProvider {
        fn build(fail_logout: bool) -> Arc<Self> {
            Arc::new(Self {
                snapshot: Mutex::new(ProviderSnapshot::signed_in(provider_user())),
                token: Mutex::new(Some("provider-tok".into())),
                fail_logout,
                logout_calls: AtomicUsize::new(0),
            })
        }

        fn signed_in() -> Arc<Self> {
            Self::build(false)
        }

        fn failing_logout() -> Arc<Self> {
            Self::build(true)
        }

        fn set(&self, snapshot: ProviderSnapshot) {
            *self.snapshot.lock().unwrap() = snapshot;
        }

        fn set_token(&self, token: Option<&str>) {
            *self.token.lock().unwrap() = token.map(String::from);
        }

        fn logouts(&self) -> usize {
            self.logout_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IdentityProvider for FakeProvider {
        fn snapshot(&self) -> ProviderSnapshot {
            self.snapshot.lock().unwrap().clone()
        }

        async fn access_token(&self) -> Result<Option<String>> {
            Ok(self.token.lock().unwrap().clone())
        }

        async fn logout(&self) -> Result<()> {
            self.logout_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_logout {
                return Err(AuthEngineError::ProviderLogoutFailed {
                    reason: "sdk offline".into(),
                });
            }
            self.set(ProviderSnapshot::signed_out());
            Ok(())
        }
    }

    enum Reply {
        User(Option<BackendSession>),
        NoUser,
        Fail,
    }

    struct FakeBackend {
        reply: Reply,
        calls: AtomicUsize,
        /// When set, the exchange waits for a notification before replying.
        gate: Option<Arc<Notify>>,
        started: Arc<Notify>,
    }

    impl FakeBackend {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
                gate: None,
                started: Arc::new(Notify::new()),
            })
        }

        fn gated(reply: Reply, gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
                gate: Some(gate),
                started: Arc::new(Notify::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackendSessionClient for FakeBackend {
        async fn exchange(&self, provider_token: &str) -> Result<Option<ExchangeResponse>> {
            assert_eq!(provider_token, "provider-tok");
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match &self.reply {
                Reply::User(session) => Ok(Some(ExchangeResponse {
                    user: backend_user(),
                    session: session.clone(),
                })),
                Reply::NoUser => Ok(None),
                Reply::Fail => Err(AuthEngineError::BackendExchangeFailed {
                    reason: "HTTP 500: boom".into(),
                    status: Some(500),
                }),
            }
        }
    }

    fn provider_user() -> ProviderUser {
        ProviderUser {
            id: "did:privy:1".into(),
            linked_accounts: vec![LinkedAccount::Email {
                address: "a@example.com".into(),
            }],
        }
    }

    fn backend_user() -> BackendUser {
        BackendUser {
            id: "user-1".into(),
            wallets: vec![BackendWallet {
                address: "0xB".into(),
                is_primary: true,
            }],
            account_status: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn backend_session() -> Option<BackendSession> {
        Some(BackendSession {
            token: "backend-tok".into(),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        })
    }

    async fn controller(
        provider: Arc<FakeProvider>,
        backend: Arc<FakeBackend>,
    ) -> AuthSessionController {
        let stores = AuthStores::open_in_memory().await.unwrap();
        AuthSessionController::new(provider, backend, stores, &AuthConfig::default())
    }

    // -- sync ---------------------------------------------------------------

    #[tokio::test]
    async fn successful_sync_stores_full_session() {
        let provider = FakeProvider::signed_in();
        let backend = FakeBackend::new(Reply::User(backend_session()));
        let ctl = controller(provider, backend.clone()).await;

        let eval = ctl.evaluate().await.unwrap();
        assert_eq!(
            eval,
            Evaluation::Sync(SyncOutcome::Synced {
                user_id: "user-1".into()
            })
        );

        let session = ctl.stores().session().snapshot();
        assert_eq!(session.access_token.as_deref(), Some("backend-tok"));
        assert_eq!(session.privy_user_id.as_deref(), Some("did:privy:1"));
        assert_eq!(session.wallet, Some(StoredWallet::embedded("0xB")));
        assert_eq!(session.linked_accounts.len(), 1);
        let profile = session.profile.unwrap();
        assert_eq!(profile.account_status, "active");
        assert_eq!(profile.wallet_address.as_deref(), Some("0xB"));

        assert!(ctl.stores().flow().has_synced_user());
        let view = ctl.view();
        assert!(view.is_authenticated);
        assert!(!view.is_loading);
        assert_eq!(view.phase, SessionPhase::Synced);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn missing_backend_session_falls_back_to_provider_token() {
        let ctl = controller(FakeProvider::signed_in(), FakeBackend::new(Reply::User(None))).await;
        ctl.evaluate().await.unwrap();

        let session = ctl.stores().session().snapshot();
        assert_eq!(session.access_token.as_deref(), Some("provider-tok"));
        assert!(session.access_token_expires_at.is_none());
        assert!(session.profile.is_some());
    }

    #[tokio::test]
    async fn repeated_evaluations_exchange_once() {
        let backend = FakeBackend::new(Reply::User(backend_session()));
        let ctl = controller(FakeProvider::signed_in(), backend.clone()).await;

        for _ in 0..5 {
            ctl.evaluate().await.unwrap();
        }
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_evaluations_exchange_once() {
        let gate = Arc::new(Notify::new());
        let backend = FakeBackend::gated(Reply::User(backend_session()), gate.clone());
        let ctl = controller(FakeProvider::signed_in(), backend.clone()).await;

        let first = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.evaluate().await }
        });
        backend.started.notified().await;
        assert!(ctl.view().is_syncing);

        // While the first exchange is parked, every other evaluation is idle.
        for _ in 0..3 {
            assert_eq!(ctl.evaluate().await.unwrap(), Evaluation::Idle);
        }

        gate.notify_one();
        let eval = first.await.unwrap().unwrap();
        assert!(matches!(eval, Evaluation::Sync(SyncOutcome::Synced { .. })));
        assert_eq!(backend.calls(), 1);
        assert!(!ctl.view().is_syncing);
    }

    #[tokio::test]
    async fn no_backend_user_degrades_to_provider_token() {
        let ctl = controller(FakeProvider::signed_in(), FakeBackend::new(Reply::NoUser)).await;

        let eval = ctl.evaluate().await.unwrap();
        assert_eq!(eval, Evaluation::Sync(SyncOutcome::Degraded));

        let session = ctl.stores().session().snapshot();
        assert_eq!(session.access_token.as_deref(), Some("provider-tok"));
        assert_eq!(session.linked_accounts, provider_user().linked_accounts);
        assert!(session.profile.is_none());
        assert!(session.wallet.is_none());
        assert!(ctl.stores().flow().has_synced_user());
        assert!(ctl.view().is_authenticated);
    }

    #[tokio::test]
    async fn missing_provider_token_gives_up() {
        let provider = FakeProvider::signed_in();
        provider.set_token(None);
        let backend = FakeBackend::new(Reply::User(backend_session()));
        let ctl = controller(provider, backend.clone()).await;

        let eval = ctl.evaluate().await.unwrap();
        assert_eq!(eval, Evaluation::Sync(SyncOutcome::GaveUp));
        assert_eq!(backend.calls(), 0);
        assert!(ctl.stores().flow().has_synced_user());
        assert!(ctl.stores().session().snapshot().is_empty());

        // Provider still logged in, but no further attempts this session.
        assert_eq!(ctl.evaluate().await.unwrap(), Evaluation::Idle);
        assert!(!ctl.view().is_authenticated);
        assert_eq!(ctl.view().phase, SessionPhase::SignedOut);
    }

    #[tokio::test]
    async fn failed_sync_signs_out_once() {
        let provider = FakeProvider::signed_in();
        let ctl = controller(provider.clone(), FakeBackend::new(Reply::Fail)).await;

        let eval = ctl.evaluate().await.unwrap();
        match eval {
            Evaluation::Sync(SyncOutcome::Failed { reason }) => assert!(reason.contains("HTTP 500")),
            other => panic!("unexpected evaluation: {other:?}"),
        }
        assert_eq!(provider.logouts(), 1);
        assert!(ctl.stores().session().snapshot().is_empty());
        assert_eq!(ctl.stores().flow().snapshot(), Default::default());

        let view = ctl.view();
        assert!(!view.is_authenticated);
        assert!(!view.is_syncing);
        assert!(view.sync_error.unwrap().contains("HTTP 500"));

        // Provider is signed out now; nothing else happens.
        assert_eq!(ctl.evaluate().await.unwrap(), Evaluation::Idle);
        assert_eq!(provider.logouts(), 1);
    }

    #[tokio::test]
    async fn failed_sync_survives_failing_provider_logout() {
        let provider = FakeProvider::failing_logout();
        let ctl = controller(provider.clone(), FakeBackend::new(Reply::Fail)).await;

        let eval = ctl.evaluate().await.unwrap();
        assert!(matches!(eval, Evaluation::Sync(SyncOutcome::Failed { .. })));
        assert_eq!(provider.logouts(), 1);
        assert!(ctl.stores().session().snapshot().is_empty());
        assert!(!ctl.view().is_syncing);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_error_clears_after_delay() {
        let ctl = controller(FakeProvider::signed_in(), FakeBackend::new(Reply::Fail)).await;
        ctl.evaluate().await.unwrap();
        assert!(ctl.view().sync_error.is_some());

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert!(ctl.view().sync_error.is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(ctl.view().sync_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn published_view_tracks_sync_error() {
        let ctl = controller(FakeProvider::signed_in(), FakeBackend::new(Reply::Fail)).await;
        let mut rx = ctl.subscribe();

        ctl.evaluate().await.unwrap();
        assert!(rx.borrow_and_update().sync_error.is_some());

        tokio::time::sleep(Duration::from_secs(6)).await;
        rx.changed().await.unwrap();
        assert!(rx.borrow().sync_error.is_none());
    }

    // -- stale results ------------------------------------------------------

    #[tokio::test]
    async fn logout_during_sync_discards_result() {
        let gate = Arc::new(Notify::new());
        let provider = FakeProvider::signed_in();
        let backend = FakeBackend::gated(Reply::User(backend_session()), gate.clone());
        let ctl = controller(provider.clone(), backend.clone()).await;

        let sync = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.evaluate().await }
        });
        backend.started.notified().await;

        ctl.logout().await.unwrap();
        gate.notify_one();

        let eval = sync.await.unwrap().unwrap();
        assert_eq!(eval, Evaluation::Sync(SyncOutcome::Discarded));
        assert!(ctl.stores().session().snapshot().is_empty());
        assert!(!ctl.stores().flow().has_synced_user());
        assert!(!ctl.view().is_authenticated);
    }

    #[tokio::test]
    async fn provider_logout_during_sync_discards_result() {
        let gate = Arc::new(Notify::new());
        let provider = FakeProvider::signed_in();
        let backend = FakeBackend::gated(Reply::User(backend_session()), gate.clone());
        let ctl = controller(provider.clone(), backend.clone()).await;

        let sync = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.evaluate().await }
        });
        backend.started.notified().await;

        provider.set(ProviderSnapshot::signed_out());
        gate.notify_one();

        let eval = sync.await.unwrap().unwrap();
        assert_eq!(eval, Evaluation::Sync(SyncOutcome::Discarded));
        assert!(ctl.stores().session().snapshot().is_empty());
    }

    // -- logout & reset -----------------------------------------------------

    #[tokio::test]
    async fn logout_clears_everything() {
        let provider = FakeProvider::signed_in();
        let ctl = controller(provider.clone(), FakeBackend::new(Reply::User(backend_session()))).await;
        ctl.evaluate().await.unwrap();

        ctl.logout().await.unwrap();
        assert_eq!(provider.logouts(), 1);
        assert!(ctl.stores().session().snapshot().is_empty());
        assert_eq!(ctl.stores().flow().snapshot(), Default::default());
        assert!(!ctl.view().is_authenticated);

        let events = ctl.stores().kv().recent_events(10).await.unwrap();
        assert_eq!(events[0].kind, "logout");
        assert_eq!(events[1].kind, "sync_completed");
    }

    #[tokio::test]
    async fn logout_with_failing_provider_still_clears() {
        let provider = FakeProvider::failing_logout();
        let ctl = controller(provider.clone(), FakeBackend::new(Reply::User(backend_session()))).await;
        ctl.evaluate().await.unwrap();

        let err = ctl.logout().await.unwrap_err();
        assert!(matches!(err, AuthEngineError::ProviderLogoutFailed { .. }));
        assert!(ctl.stores().session().snapshot().is_empty());
        assert!(!ctl.stores().flow().is_logging_out());
    }

    #[tokio::test]
    async fn background_provider_logout_resets_once() {
        let provider = FakeProvider::signed_in();
        let ctl = controller(provider.clone(), FakeBackend::new(Reply::User(backend_session()))).await;
        ctl.evaluate().await.unwrap();

        provider.set(ProviderSnapshot::signed_out());
        assert_eq!(ctl.evaluate().await.unwrap(), Evaluation::ProviderLogoutReset);
        assert!(ctl.stores().session().snapshot().is_empty());
        assert!(!ctl.stores().flow().has_synced_user());

        assert_eq!(ctl.evaluate().await.unwrap(), Evaluation::Idle);
        assert_eq!(provider.logouts(), 0);
    }

    #[tokio::test]
    async fn login_after_logout_syncs_again() {
        let provider = FakeProvider::signed_in();
        let backend = FakeBackend::new(Reply::User(backend_session()));
        let ctl = controller(provider.clone(), backend.clone()).await;
        ctl.evaluate().await.unwrap();
        ctl.logout().await.unwrap();

        provider.set(ProviderSnapshot::signed_in(provider_user()));
        let eval = ctl.evaluate().await.unwrap();
        assert!(matches!(eval, Evaluation::Sync(SyncOutcome::Synced { .. })));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn expired_token_triggers_resync() {
        let expired = Some(BackendSession {
            token: "backend-tok".into(),
            expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
        });
        let backend = FakeBackend::new(Reply::User(expired));
        let ctl = controller(FakeProvider::signed_in(), backend.clone()).await;

        ctl.evaluate().await.unwrap();
        assert_eq!(backend.calls(), 1);

        // The stored token is already expired: one more exchange runs.
        let eval = ctl.evaluate().await.unwrap();
        assert!(matches!(eval, Evaluation::Sync(SyncOutcome::Synced { .. })));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn leftover_logout_flag_is_finished() {
        let provider = FakeProvider::signed_in();
        let backend = FakeBackend::new(Reply::User(backend_session()));
        let ctl = controller(provider.clone(), backend.clone()).await;
        ctl.evaluate().await.unwrap();

        // Flag on disk, but no logout call is running.
        ctl.stores().flow().begin_logout().await.unwrap();
        provider.set(ProviderSnapshot::signed_out());

        assert_eq!(ctl.evaluate().await.unwrap(), Evaluation::LogoutResumed);
        assert!(ctl.stores().session().snapshot().is_empty());
        assert_eq!(ctl.stores().flow().snapshot(), Default::default());
        assert_eq!(ctl.view().phase, SessionPhase::SignedOut);

        // A fresh login syncs again.
        provider.set(ProviderSnapshot::signed_in(provider_user()));
        let eval = ctl.evaluate().await.unwrap();
        assert!(matches!(eval, Evaluation::Sync(SyncOutcome::Synced { .. })));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_provider_logout_resets_once() {
        let provider = FakeProvider::signed_in();
        let ctl = controller(provider.clone(), FakeBackend::new(Reply::User(backend_session()))).await;
        ctl.evaluate().await.unwrap();
        provider.set(ProviderSnapshot::signed_out());

        let (a, b) = tokio::join!(ctl.evaluate(), ctl.evaluate());
        let resets = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(|eval| *eval == Evaluation::ProviderLogoutReset)
            .count();
        assert_eq!(resets, 1);

        let events = ctl.stores().kv().recent_events(10).await.unwrap();
        let reset_events = events
            .iter()
            .filter(|e| e.kind == "provider_logout_reset")
            .count();
        assert_eq!(reset_events, 1);
    }

    #[tokio::test]
    async fn empty_backend_token_fails_the_exchange() {
        let provider = FakeProvider::signed_in();
        let empty = Some(BackendSession {
            token: String::new(),
            expires_at: None,
        });
        let ctl = controller(provider.clone(), FakeBackend::new(Reply::User(empty))).await;

        let eval = ctl.evaluate().await.unwrap();
        match eval {
            Evaluation::Sync(SyncOutcome::Failed { reason }) => {
                assert!(reason.contains("empty session token"))
            }
            other => panic!("unexpected evaluation: {other:?}"),
        }
        assert_eq!(provider.logouts(), 1);
        assert!(ctl.stores().session().snapshot().is_empty());
        assert!(!ctl.stores().flow().has_synced_user());
    }

    // -- profile ------------------------------------------------------------

    #[tokio::test]
    async fn update_profile_requires_session() {
        let provider = FakeProvider::signed_in();
        let ctl = controller(provider, FakeBackend::new(Reply::User(backend_session()))).await;
        let profile = UserProfile {
            id: "user-1".into(),
            wallet_address: None,
            account_status: "active".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let err = ctl.update_profile(profile).await.unwrap_err();
        assert!(matches!(err, AuthEngineError::NotAuthenticated));
    }

    #[tokio::test]
    async fn update_profile_moves_wallet() {
        let ctl = controller(FakeProvider::signed_in(), FakeBackend::new(Reply::User(backend_session()))).await;
        ctl.evaluate().await.unwrap();

        let mut profile = ctl.stores().session().profile().unwrap();
        profile.wallet_address = Some("0xC".into());
        profile.account_status = "suspended".into();
        let state = ctl.update_profile(profile).await.unwrap();

        assert_eq!(state.wallet, Some(StoredWallet::embedded("0xC")));
        assert_eq!(state.profile.unwrap().account_status, "suspended");
        assert_eq!(state.access_token.as_deref(), Some("backend-tok"));
    }

    #[tokio::test]
    async fn refresh_linked_accounts_copies_provider_accounts() {
        let provider = FakeProvider::signed_in();
        let ctl = controller(provider.clone(), FakeBackend::new(Reply::User(backend_session()))).await;
        ctl.evaluate().await.unwrap();

        let mut user = provider_user();
        user.linked_accounts.push(LinkedAccount::Wallet {
            address: "0xW".into(),
            wallet_client: Some("metamask".into()),
        });
        provider.set(ProviderSnapshot::signed_in(user));

        ctl.refresh_linked_accounts().await.unwrap();
        assert_eq!(ctl.stores().session().linked_accounts().len(), 2);
    }

    #[tokio::test]
    async fn provider_not_ready_keeps_loading() {
        let provider = FakeProvider::signed_in();
        provider.set(ProviderSnapshot::default());
        let backend = FakeBackend::new(Reply::User(backend_session()));
        let ctl = controller(provider, backend.clone()).await;

        assert_eq!(ctl.evaluate().await.unwrap(), Evaluation::Idle);
        assert!(ctl.view().is_loading);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn watch_provider_triggers_evaluation() {
        let provider = FakeProvider::signed_in();
        provider.set(ProviderSnapshot::default());
        let backend = FakeBackend::new(Reply::User(backend_session()));
        let ctl = controller(provider.clone(), backend.clone()).await;
        let mut views = ctl.subscribe();

        let (tx, rx) = watch::channel(0u32);
        let _driver = ctl.watch_provider(rx);

        provider.set(ProviderSnapshot::signed_in(provider_user()));
        tx.send(1).unwrap();

        views
            .wait_for(|view| view.is_authenticated)
            .await
            .unwrap();
        assert_eq!(backend.calls(), 1);
    }
}

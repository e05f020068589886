//! Route guard: keeps the visible screen consistent with the auth state.
//!
//! [`NavigationGuard::evaluate`] is a pure decision over the current inputs
//! and two remembered values (the previous `authenticated` and whether we
//! already navigated for it). [`NavigationGuard::drive`] reads the inputs
//! from a [`NavigationRouter`], yields once so the router finishes its own
//! update, and performs the redirect.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AuthConfig;
use crate::state::AuthView;

/// The host's router.
pub trait NavigationRouter: Send + Sync {
    /// Segments of the current route, outermost first.
    fn current_segments(&self) -> Vec<String>;

    /// The router has mounted and can navigate.
    fn is_ready(&self) -> bool;

    /// Replace the current route with `path`.
    fn replace(&self, path: &str);
}

/// Route names the guard works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    /// First segment of every route inside the authenticated shell.
    pub app_segment: String,
    pub app_route: String,
    pub signed_out_route: String,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self::from(&AuthConfig::default())
    }
}

impl From<&AuthConfig> for RouteConfig {
    fn from(config: &AuthConfig) -> Self {
        Self {
            app_segment: config.app_segment.clone(),
            app_route: config.app_route.clone(),
            signed_out_route: config.signed_out_route.clone(),
        }
    }
}

/// Inputs to one guard evaluation.
#[derive(Debug, Clone, Copy)]
pub struct GuardInput<'a> {
    pub auth_ready: bool,
    pub navigation_ready: bool,
    pub authenticated: bool,
    /// First route segment, `None` at the root.
    pub segment: Option<&'a str>,
}

/// A redirect the guard wants performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    ToApp(String),
    ToSignedOut(String),
}

impl Redirect {
    pub fn path(&self) -> &str {
        match self {
            Self::ToApp(path) | Self::ToSignedOut(path) => path,
        }
    }
}

/// Decides redirects between the signed-out area and the app shell.
#[derive(Debug, Clone)]
pub struct NavigationGuard {
    routes: RouteConfig,
    last_authenticated: Option<bool>,
    has_navigated: bool,
}

impl NavigationGuard {
    pub fn new(routes: RouteConfig) -> Self {
        Self {
            routes,
            last_authenticated: None,
            has_navigated: false,
        }
    }

    /// `authenticated` as of the last evaluation that ran.
    pub fn last_authenticated(&self) -> Option<bool> {
        self.last_authenticated
    }

    /// Whether the current authenticated state has already been acted on.
    pub fn has_navigated(&self) -> bool {
        self.has_navigated
    }

    /// Decide whether to redirect.
    ///
    /// Does nothing (and remembers nothing) until both auth and navigation
    /// are ready.
    pub fn evaluate(&mut self, input: GuardInput<'_>) -> Option<Redirect> {
        if !input.auth_ready || !input.navigation_ready {
            return None;
        }

        let authenticated = input.authenticated;
        let first = self.last_authenticated.is_none();
        let changed = self.last_authenticated.is_some_and(|prev| prev != authenticated);
        let in_app = input.segment == Some(self.routes.app_segment.as_str());

        let redirect = if authenticated && !in_app {
            (!self.has_navigated || changed).then(|| Redirect::ToApp(self.routes.app_route.clone()))
        } else if !authenticated && in_app {
            (changed || first).then(|| Redirect::ToSignedOut(self.routes.signed_out_route.clone()))
        } else {
            None
        };

        if let Some(ref r) = redirect {
            tracing::debug!(to = r.path(), authenticated, first, changed, "navigation redirect");
        }
        self.last_authenticated = Some(authenticated);
        self.has_navigated = authenticated;
        redirect
    }

    /// Evaluate against `router` and perform the redirect, if any.
    ///
    /// Yields one scheduler tick before navigating.
    pub async fn drive(
        &mut self,
        router: &dyn NavigationRouter,
        auth_ready: bool,
        authenticated: bool,
    ) -> Option<Redirect> {
        let segments = router.current_segments();
        let redirect = self.evaluate(GuardInput {
            auth_ready,
            navigation_ready: router.is_ready(),
            authenticated,
            segment: segments.first().map(String::as_str),
        })?;

        tokio::task::yield_now().await;
        router.replace(redirect.path());
        Some(redirect)
    }

    /// Drive the guard from every view published on `views`.
    pub fn follow(
        mut self,
        mut views: watch::Receiver<AuthView>,
        router: Arc<dyn NavigationRouter>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let view = views.borrow_and_update().clone();
                self.drive(router.as_ref(), view.is_ready(), view.is_authenticated)
                    .await;
                if views.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// LoggingRouter
// ---------------------------------------------------------------------------

/// Router without a screen: tracks the current path and logs navigations.
pub struct LoggingRouter {
    path: Mutex<String>,
}

impl LoggingRouter {
    pub fn new(initial_path: impl Into<String>) -> Self {
        Self {
            path: Mutex::new(initial_path.into()),
        }
    }

    pub fn current_path(&self) -> String {
        match self.path.lock() {
            Ok(path) => path.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl NavigationRouter for LoggingRouter {
    fn current_segments(&self) -> Vec<String> {
        self.current_path()
            .split('/')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn replace(&self, path: &str) {
        tracing::info!(from = %self.current_path(), to = path, "navigate");
        match self.path.lock() {
            Ok(mut current) => *current = path.to_string(),
            Err(poisoned) => *poisoned.into_inner() = path.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! authsync CLI entry point.

mod cli;
mod helpers;

use std::sync::Arc;

use anyhow::{Context, Result};
use authsync_engine::{
    AuthConfig, AuthSessionController, Evaluation, HttpBackendClient, LoggingRouter,
    NavigationGuard, ProviderUser, RouteConfig, StaticIdentityProvider, SyncOutcome,
};
use authsync_store::{AuthStores, LinkedAccount};
use clap::Parser;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::helpers::{init_tracing, print_status};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = AuthConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    init_tracing(&config.log_level, cli.log_json);

    let stores = AuthStores::open(config.database_path.clone())
        .await
        .context("failed to open auth database")?;
    info!(path = %config.database_path.display(), "auth stores ready");

    match cli.command {
        Commands::Status { events, json } => cmd_status(&stores, events, json).await,
        Commands::Sync {
            user_id,
            token,
            email,
            from,
            force,
        } => {
            let user = ProviderUser {
                id: user_id,
                linked_accounts: email
                    .map(|address| vec![LinkedAccount::Email { address }])
                    .unwrap_or_default(),
            };
            cmd_sync(&config, stores, user, token, &from, force).await
        }
        Commands::Logout => cmd_logout(&config, stores).await,
        Commands::Clear => cmd_clear(&stores).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

async fn cmd_status(stores: &AuthStores, events: u32, json: bool) -> Result<()> {
    let recent = stores
        .kv()
        .recent_events(events)
        .await
        .context("failed to read auth events")?;
    print_status(stores, &recent, json)
}

// ---------------------------------------------------------------------------
// Subcommand: sync
// ---------------------------------------------------------------------------

async fn cmd_sync(
    config: &AuthConfig,
    stores: AuthStores,
    user: ProviderUser,
    token: String,
    from: &str,
    force: bool,
) -> Result<()> {
    if force {
        stores.reset_all().await.context("failed to reset stores")?;
    }

    info!(
        provider_user = %user.id,
        email = user.email().unwrap_or("-"),
        "syncing provider login"
    );
    let provider = Arc::new(StaticIdentityProvider::new(user, token));
    let backend = HttpBackendClient::new(config).context("failed to build backend client")?;
    let controller = AuthSessionController::new(provider, Arc::new(backend), stores, config);

    let router = LoggingRouter::new(from);
    let mut guard = NavigationGuard::new(RouteConfig::from(config));
    let before = controller.view();
    guard
        .drive(&router, before.is_ready(), before.is_authenticated)
        .await;

    let evaluation = controller.evaluate().await.context("evaluation failed")?;
    match &evaluation {
        Evaluation::Idle => println!("  Nothing to do: session already synced."),
        Evaluation::Sync(SyncOutcome::Synced { user_id }) => println!("  Synced backend user {user_id}."),
        Evaluation::Sync(SyncOutcome::Degraded) => {
            println!("  Backend resolved no user; continuing with the provider token.")
        }
        Evaluation::Sync(SyncOutcome::GaveUp) => println!("  Provider issued no token; gave up."),
        Evaluation::Sync(SyncOutcome::Failed { reason }) => println!("  Sync failed: {reason}"),
        Evaluation::Sync(SyncOutcome::Discarded) => println!("  Sync result discarded."),
        Evaluation::ProviderLogoutReset => println!("  Provider signed out; session reset."),
        Evaluation::LogoutResumed => println!("  Finished an interrupted logout."),
    }

    let after = controller.view();
    guard
        .drive(&router, after.is_ready(), after.is_authenticated)
        .await;
    println!("  Phase:  {}", after.phase);
    println!("  Route:  {}", router.current_path());

    if matches!(evaluation, Evaluation::Sync(SyncOutcome::Failed { .. })) {
        anyhow::bail!("token exchange failed");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: logout
// ---------------------------------------------------------------------------

async fn cmd_logout(config: &AuthConfig, stores: AuthStores) -> Result<()> {
    // The provider session lives elsewhere; stand in for it with the
    // persisted id so the controller's logout path runs end to end.
    let provider = match stores.session().privy_user_id() {
        Some(id) => StaticIdentityProvider::new(
            ProviderUser {
                id,
                linked_accounts: stores.session().linked_accounts(),
            },
            String::new(),
        ),
        None => StaticIdentityProvider::signed_out(),
    };
    let backend = HttpBackendClient::new(config).context("failed to build backend client")?;
    let controller = AuthSessionController::new(Arc::new(provider), Arc::new(backend), stores, config);

    controller.logout().await.context("logout failed")?;
    println!("  Logged out.");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: clear
// ---------------------------------------------------------------------------

async fn cmd_clear(stores: &AuthStores) -> Result<()> {
    stores.reset_all().await.context("failed to reset stores")?;
    println!("  Session and auth flow state cleared.");
    Ok(())
}

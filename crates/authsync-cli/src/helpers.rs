//! Shared helpers: tracing setup and status rendering.

use anyhow::Result;
use authsync_store::{AuthEvent, AuthStores, LinkedAccount, SessionState};
use chrono::{DateTime, Utc};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
///
/// `RUST_LOG` wins over `default_level` when set.
pub fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Print the persisted state, either as a summary or as JSON.
pub fn print_status(stores: &AuthStores, events: &[AuthEvent], json: bool) -> Result<()> {
    let session = stores.session().snapshot();
    let flow = stores.flow().snapshot();

    if json {
        let doc = serde_json::json!({
            "session": redacted(&session),
            "flow": flow,
            "tokenValid": session.has_valid_token(Utc::now()),
            "events": events,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!();
    println!("  authsync v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!(
        "  Provider user:    {}",
        session.privy_user_id.as_deref().unwrap_or("(none)")
    );
    println!("  Session token:    {}", token_summary(&session));
    match &session.wallet {
        Some(wallet) => println!("  Wallet:           {} ({})", wallet.address, wallet.wallet_type),
        None => println!("  Wallet:           (none)"),
    }
    match &session.profile {
        Some(profile) => println!(
            "  Profile:          {} [{}]",
            profile.id, profile.account_status
        ),
        None => println!("  Profile:          (none)"),
    }
    println!(
        "  Email:            {}",
        primary_email(&session).unwrap_or("(none)")
    );
    let kinds: Vec<&str> = session.linked_accounts.iter().map(|a| a.kind()).collect();
    if kinds.is_empty() {
        println!("  Linked accounts:  (none)");
    } else {
        println!("  Linked accounts:  {}", kinds.join(", "));
    }
    println!("  Synced:           {}", flow.has_synced_user);
    println!("  Logging out:      {}", flow.is_logging_out);

    if !events.is_empty() {
        println!();
        println!("  Recent events:");
        for event in events {
            let at = DateTime::<Utc>::from_timestamp(event.created_at, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| event.created_at.to_string());
            println!(
                "    {}  {:<22} {}",
                at,
                event.kind,
                event.detail.as_deref().unwrap_or("")
            );
        }
    }
    println!();
    Ok(())
}

fn token_summary(session: &SessionState) -> String {
    if session.access_token.is_none() {
        return "(none)".to_string();
    }
    if !session.has_valid_token(Utc::now()) {
        return "expired".to_string();
    }
    match session.access_token_expires_at {
        Some(exp) => format!("valid until {}", exp.to_rfc3339()),
        None => "valid (no expiry)".to_string(),
    }
}

/// First email across the linked accounts.
fn primary_email(session: &SessionState) -> Option<&str> {
    session.linked_accounts.iter().find_map(LinkedAccount::email)
}

/// The session with its token masked.
fn redacted(session: &SessionState) -> SessionState {
    SessionState {
        access_token: session.access_token.as_ref().map(|_| "***".to_string()),
        ..session.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

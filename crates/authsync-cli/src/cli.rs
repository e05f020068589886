//! CLI argument definitions for authsync.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use authsync_engine::DEFAULT_CONFIG_PATH;
use clap::{Parser, Subcommand};

/// authsync -- reconcile an identity-provider login with a backend session.
#[derive(Parser)]
#[command(
    name = "authsync",
    version,
    about = "authsync -- provider/backend session reconciliation",
    long_about = "Exchanges an identity-provider token for a backend session, persists \
                  the result and reports where the app would navigate."
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the persisted session, flow flags and recent auth events.
    Status {
        /// Number of audit events to show.
        #[arg(long, short, default_value_t = 10)]
        events: u32,

        /// Print machine-readable JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },

    /// Exchange a provider token for a backend session.
    Sync {
        /// Provider-assigned user id.
        #[arg(long)]
        user_id: String,

        /// Provider access token.
        #[arg(long, env = "AUTHSYNC_PROVIDER_TOKEN")]
        token: String,

        /// Email linked to the provider account.
        #[arg(long)]
        email: Option<String>,

        /// Route the app is on before the sync.
        #[arg(long, default_value = "/")]
        from: String,

        /// Wipe any existing session first.
        #[arg(long, short)]
        force: bool,
    },

    /// Log out: clear the backend session and the flow flags.
    Logout,

    /// Wipe persisted state without touching the provider.
    Clear,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

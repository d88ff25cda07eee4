use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "costline")]
#[command(about = "Token and cost usage ingestion from LLM provider admin APIs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Root config and data under this directory instead of the platform
    /// defaults
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a forward sync from each provider's last cursor to now
    Sync {
        /// Sync only this provider
        #[arg(short, long)]
        provider: Option<String>,
    },

    /// Walk provider history backward toward a target date
    Backfill {
        /// Backfill only this provider
        #[arg(short, long)]
        provider: Option<String>,

        /// Oldest date to reach (YYYY-MM-DD)
        #[arg(short, long)]
        target: String,
    },

    /// Show per-provider sync cursors and backfill progress
    Status,

    /// Refresh identity mappings from provider directories
    SyncIdentities {
        /// Refresh only this provider
        #[arg(short, long)]
        provider: Option<String>,
    },

    /// Manually map an external id to an identity (rewrites history)
    MapIdentity {
        /// Tool the id belongs to (e.g. claude-code)
        tool: String,

        /// Provider-side actor id (API key id, user id)
        external_id: String,

        /// Identity to attribute, e.g. an email
        identity: String,
    },

    /// Remove a manual or stale identity mapping. Already-attributed rows
    /// are left as they are
    UnmapIdentity {
        /// Tool the id belongs to (e.g. claude-code)
        tool: String,

        /// Provider-side actor id to unmap
        external_id: String,
    },

    /// Clear a provider's backfill-complete flag so history is probed again
    ResetBackfill {
        provider: String,
    },

    /// Print the recent daily series with incomplete dates projected
    Report {
        /// Days of history to include
        #[arg(short, long, default_value = "30")]
        days: u32,
    },
}

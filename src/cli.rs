use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "labpool")]
#[command(about = "labpool - Pool and lifecycle manager for lab sandbox containers")]
pub struct Cli {
    /// Config file path (defaults to labpool.yaml, searched upward)
    #[arg(short, long, env = "LABPOOL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Docker binary used by the runtime adapter
    #[arg(long, default_value = "docker")]
    pub docker: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reconcile, fill the pool and run the idle reaper until interrupted
    Serve {
        /// Skip the warm pool fill on startup
        #[arg(long)]
        no_pool: bool,
    },
    /// Give a user a running sandbox
    Assign {
        /// User identifier
        owner: String,
        /// Scenario the sandbox is started for
        scenario: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stop a user's sandbox and release its ports
    Stop {
        /// User identifier
        owner: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Record activity for a user's sandbox
    Heartbeat {
        /// User identifier
        owner: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a user's running sandbox
    Lookup {
        /// User identifier
        owner: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show capacity and pool occupancy
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the port ledger
    Ports {
        /// Only list ports that are taken
        #[arg(long)]
        allocated: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reclaim idle user sandboxes now
    Reap {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Repair the ledger and records against the runtime
    Reconcile {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stop and remove every pool container
    PurgePool {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate configuration and print the effective settings
    CheckConfig {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

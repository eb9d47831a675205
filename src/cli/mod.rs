//! Command-line interface definitions.

pub mod commands;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "hivemind", version, about = "Swarm coordination substrate")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit machine-readable JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,

    /// Load configuration from this file instead of `.hivemind/`.
    #[arg(long, global = true)]
    pub config: Option<std::path::PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Read-only database queries and analytics.
    #[command(subcommand)]
    Db(DbCommands),

    /// Run the event streaming server.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },

    /// Create the `.hivemind/` configuration scaffold.
    Init {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum DbCommands {
    /// List the named analytics queries.
    List,

    /// Run a read-only SELECT (hard row cap applies).
    Query { sql: String },

    /// Run a named analytics query.
    Analytics {
        name: String,
        /// Relative lower bound: Nd, Nh, or Nm.
        #[arg(long)]
        since: Option<String>,
        /// Relative upper bound: Nd, Nh, or Nm.
        #[arg(long)]
        until: Option<String>,
        #[arg(long)]
        project: Option<String>,
        /// Restrict task-duration to children of this epic.
        #[arg(long)]
        epic: Option<String>,
        /// table, json, csv, or jsonl.
        #[arg(long, default_value = "table")]
        format: String,
    },
}

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "reliquary")]
#[command(author, version, about = "Schema-evolving record store for player profiles")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record a player join: load or create the profile and bump its join count
    Join {
        /// Player UUID
        uuid: Uuid,

        /// Current player name
        username: String,
    },

    /// List every stored player
    List,

    /// Show all attributes of one player
    Show {
        /// Player UUID
        uuid: Uuid,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Set an attribute on a player, adding the column if needed
    Set {
        /// Player UUID
        uuid: Uuid,

        /// Attribute name
        key: String,

        /// Value; integers, decimals and true/false are stored as such
        value: String,
    },

    /// Delete a player
    Delete {
        /// Player UUID
        uuid: Uuid,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

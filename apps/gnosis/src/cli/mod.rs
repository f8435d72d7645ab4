//! # Gnosis CLI
//!
//! ## Available Commands
//!
//! - `server` - Start the HTTP server
//! - `status` - Show subsystem counts
//! - `init` - Create a database and its base self
//! - `history` - Show every version of an entity
//! - `audit` - Show audit records
//! - `keygen` - Generate an ed25519 key pair
//! - `sign` - Sign a message envelope with a plane key
//! - `verify` - Check the self-model chain and audit sequence

mod commands;

use clap::{Parser, Subcommand};
use gnosis_core::GnosisError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Gnosis - versioned self-referential graph core
#[derive(Parser, Debug)]
#[command(name = "gnosis")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the redb database
    #[arg(short = 'D', long, global = true, default_value = "gnosis.db")]
    pub database: PathBuf,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    Server {
        /// Host to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },

    /// Show subsystem counts
    Status,

    /// Create a database and its base self
    Init {
        /// Replace an existing database
        #[arg(short, long)]
        force: bool,

        /// Name recorded in the base self
        #[arg(short, long, default_value = "gnosis")]
        name: String,
    },

    /// Show every version of an entity, newest first
    History {
        /// Entity id (UUID)
        #[arg(short, long)]
        id: String,
    },

    /// Show audit records, newest last
    Audit {
        /// Only records for this operation
        #[arg(short, long)]
        operation: Option<String>,

        /// Show at most this many records
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Generate an ed25519 key pair
    Keygen {
        /// Write the hex secret key here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing key file
        #[arg(short, long)]
        force: bool,
    },

    /// Sign a message envelope with a plane key and print it as JSON
    Sign {
        /// File holding the sender's hex secret key
        #[arg(short, long)]
        key: PathBuf,

        /// Sending plane
        #[arg(long)]
        from: String,

        /// Receiving plane
        #[arg(long)]
        to: String,

        /// Operation, e.g. `memory.store` or `invoke:graph.link`
        #[arg(long)]
        op: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Check the self-model chain and audit sequence
    Verify,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

pub async fn execute(cli: Cli) -> Result<(), GnosisError> {
    let db = &cli.database;
    let config = cli.config.as_deref();
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Server { host, port }) => cmd_server(db, config, &host, port).await,
        Some(Commands::Status) | None => cmd_status(db, config, json_mode),
        Some(Commands::Init { force, name }) => cmd_init(db, config, json_mode, force, &name),
        Some(Commands::History { id }) => cmd_history(db, config, json_mode, &id),
        Some(Commands::Audit { operation, limit }) => {
            cmd_audit(db, config, json_mode, operation.as_deref(), limit)
        }
        Some(Commands::Keygen { output, force }) => {
            cmd_keygen(output.as_deref(), force, json_mode)
        }
        Some(Commands::Sign {
            key,
            from,
            to,
            op,
            payload,
        }) => cmd_sign(&key, &from, &to, &op, &payload),
        Some(Commands::Verify) => cmd_verify(db, config, json_mode),
    }
}

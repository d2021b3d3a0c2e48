//! couchtail CLI
//!
//! Follows a CouchDB continuous changes feed from the command line.
//!
//! # Commands
//!
//! - `tail` - Stream changes to stdout as JSON lines
//! - `checkpoint show` - Print the persisted checkpoint
//! - `checkpoint set` - Overwrite the persisted checkpoint

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Resumable CouchDB changes feed tailer.
#[derive(Parser)]
#[command(name = "couchtail")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream changes to stdout, one JSON event per line
    Tail(commands::tail::TailArgs),

    /// Inspect or edit the persisted checkpoint
    Checkpoint {
        /// Checkpoint file (default: $HOME/.couchdb_seq)
        #[arg(long, global = true)]
        checkpoint_path: Option<PathBuf>,

        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the persisted checkpoint
    Show,

    /// Overwrite the persisted checkpoint
    Set {
        /// New sequence value
        seq: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries events.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Tail(args) => commands::tail::run(args)?,
        Commands::Checkpoint {
            checkpoint_path,
            action,
        } => match action {
            CheckpointAction::Show => commands::checkpoint::show(checkpoint_path)?,
            CheckpointAction::Set { seq } => commands::checkpoint::set(checkpoint_path, &seq)?,
        },
    }

    Ok(())
}

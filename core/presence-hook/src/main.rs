//! presence-hook: feeds editor status into the rich presence session.
//!
//! Spawned by the editor plugin. The plugin writes one JSON status snapshot
//! per line to stdin; closing stdin ends the session and clears the activity.
//!
//! ## Subcommands
//!
//! - `run`: Long-lived session, reads status lines from stdin
//! - `check`: Connects once and reports whether the peer answers
//! - `clear`: Connects once and clears any activity left behind

mod logging;
mod run;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "presence-hook")]
#[command(about = "Rich presence bridge for text editors")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a presence session (reads status JSON lines from stdin)
    Run {
        /// Config file (defaults to ~/.editor-presence/config.toml)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Check whether the presence peer is reachable
    Check {
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Clear the activity shown by the peer
    Clear {
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            if let Err(e) = run::run(config) {
                tracing::error!(error = %e, "presence-hook run failed");
                std::process::exit(1);
            }
        }
        Commands::Check { config } => match run::check(config) {
            Ok(slot) => println!("connected (slot {})", slot),
            Err(e) => {
                println!("{}", e);
                std::process::exit(1);
            }
        },
        Commands::Clear { config } => {
            if let Err(e) = run::clear(config) {
                tracing::warn!(error = %e, "presence-hook clear failed");
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
    }
}

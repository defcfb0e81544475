//! Logging setup for the hook binary.
//!
//! Writes to a daily rolling file in `~/.editor-presence/logs/` through a
//! non-blocking writer. Stdout belongs to the host protocol, so when the
//! log directory is unusable the fallback is stderr.
//!
//! `PRESENCE_LOG` takes an `EnvFilter` directive (default `info`);
//! `PRESENCE_DEBUG_LOG=1` forces `debug`.

use std::env;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "PRESENCE_LOG";
const DEBUG_LOG_ENV: &str = "PRESENCE_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "presence-hook.log";

/// Installs the global subscriber. Keep the returned guard alive for the
/// life of `main` or buffered lines are lost on exit.
pub fn init() -> Option<WorkerGuard> {
    let filter = build_filter();

    let (writer, guard, to_file) = match log_dir() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (writer, guard, true)
        }
        None => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            (writer, guard, false)
        }
    };

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!to_file)
        .with_thread_names(true)
        .with_writer(writer)
        .try_init();

    match installed {
        Ok(()) => Some(guard),
        Err(_) => None,
    }
}

fn build_filter() -> EnvFilter {
    let debug_enabled = env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn log_dir() -> Option<std::path::PathBuf> {
    let dir = presence_core::config::data_dir()?.join("logs");
    match fs_err::create_dir_all(&dir) {
        Ok(()) => Some(dir),
        Err(err) => {
            eprintln!("presence-hook: logging to stderr: {}", err);
            None
        }
    }
}

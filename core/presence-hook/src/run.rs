//! Subcommand bodies.
//!
//! `run` is the long-lived mode the editor plugin spawns: one JSON
//! [`EditorStatus`] per stdin line, shut down on EOF.

use presence_core::{
    EditorStatus, PresenceAssembler, PresenceClient, PresenceConfig, SessionController,
    UnixSocketConnector,
};
use std::io::{self, BufRead};
use std::path::PathBuf;

pub fn run(config_path: Option<PathBuf>) -> Result<(), String> {
    let config = PresenceConfig::load(config_path);
    let stdin = io::stdin();

    if !config.enable {
        tracing::info!("Presence disabled in config; draining input");
        for line in stdin.lock().lines() {
            line.map_err(|err| format!("Failed to read stdin: {}", err))?;
        }
        return Ok(());
    }

    let mut controller = SessionController::with_default_transport(&config);
    controller
        .start()
        .map_err(|err| format!("Failed to start presence session: {}", err))?;

    let mut assembler = PresenceAssembler::new(config);
    let result = feed(stdin.lock(), &controller, &mut assembler);
    controller.close();

    let applied = result?;
    tracing::info!(applied, "Input closed; presence session ended");
    Ok(())
}

/// Feeds status lines into the controller until EOF. Returns how many
/// snapshots were assembled and handed over.
pub fn feed<R: BufRead>(
    reader: R,
    controller: &SessionController,
    assembler: &mut PresenceAssembler,
) -> Result<usize, String> {
    let mut previous: Option<EditorStatus> = None;
    let mut applied = 0;

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| format!("Failed to read stdin: {}", err))?;
        if line.trim().is_empty() {
            continue;
        }

        let status: EditorStatus = match serde_json::from_str(&line) {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(line = index + 1, error = %err, "Skipping malformed status line");
                continue;
            }
        };
        if previous.as_ref() == Some(&status) {
            continue;
        }

        let activity = assembler.assemble(&status);
        match controller.update(activity) {
            Ok(sent) => tracing::debug!(sent, file = %status.file_name, "Status applied"),
            // Already reported through the controller's error callback.
            Err(err) => tracing::debug!(error = %err, "Status kept as pending"),
        }
        previous = Some(status);
        applied += 1;
    }

    Ok(applied)
}

/// One-shot connect plus liveness round-trip. Returns the slot connected to.
pub fn check(config_path: Option<PathBuf>) -> Result<u8, String> {
    let config = PresenceConfig::load(config_path);
    let mut client = one_shot_client(&config);
    let slot = client
        .connect(config.client_id())
        .map_err(|err| err.to_string())?;
    client.check_connection().map_err(|err| err.to_string())?;
    Ok(slot)
}

/// One-shot connect that clears this process's activity on close.
pub fn clear(config_path: Option<PathBuf>) -> Result<(), String> {
    let config = PresenceConfig::load(config_path);
    let mut client = one_shot_client(&config);
    client
        .connect(config.client_id())
        .map_err(|err| err.to_string())?;
    client.close();
    Ok(())
}

fn one_shot_client(config: &PresenceConfig) -> PresenceClient {
    PresenceClient::new(Box::new(UnixSocketConnector::from_env()))
        .with_timeouts(config.write_timeout(), config.read_timeout())
}

//! Configuration snapshot consumed by the presence session.
//!
//! Loaded from `~/.editor-presence/config.toml` (or `PRESENCE_CONFIG`). A
//! missing file means defaults; a malformed file or out-of-range value is
//! replaced by its default with a warning, never a startup failure.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PresenceError;

const CONFIG_ENV: &str = "PRESENCE_CONFIG";
const CONFIG_DIR: &str = ".editor-presence";
const CONFIG_FILE: &str = "config.toml";

pub const DEFAULT_CLIENT_ID: i64 = 938157386068279366;
/// Real application ids are 18+ digit snowflakes; anything smaller is a typo.
pub const MIN_CLIENT_ID: i64 = 100000000000000000;
pub const MAX_FORMAT_LEN: usize = 128;

pub const DEFAULT_DETAILS_FORMAT: &str = "Editing: %(file)";
pub const DEFAULT_STATE_FORMAT: &str = "Size: %(size)";
pub const DEFAULT_LARGE_TEXT_FORMAT: &str = "Editing a %(LANG) file";

const DEFAULT_IDLE_TIME_SECS: u64 = 300;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1000;
const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 2000;
const DEFAULT_PING_EVERY_TICKS: u32 = 15;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 2000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub client_id: i64,
    pub enable: bool,

    pub details_format: String,
    pub state_format: String,
    pub large_text_format: String,

    pub hide_details: bool,
    pub hide_state: bool,
    pub lang_image: bool,
    pub elapsed_time: bool,
    pub button_repository: bool,
    pub hide_if_private: bool,
    pub hide_idle_status: bool,
    pub idle_time_secs: u64,

    pub editor_name: String,
    pub editor_image: String,
    pub idle_image: String,

    pub heartbeat_interval_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub ping_every_ticks: u32,
    pub write_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub preserve_start_time_across_reconnects: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
            enable: true,
            details_format: DEFAULT_DETAILS_FORMAT.to_string(),
            state_format: DEFAULT_STATE_FORMAT.to_string(),
            large_text_format: DEFAULT_LARGE_TEXT_FORMAT.to_string(),
            hide_details: false,
            hide_state: false,
            lang_image: true,
            elapsed_time: true,
            button_repository: false,
            hide_if_private: false,
            hide_idle_status: false,
            idle_time_secs: DEFAULT_IDLE_TIME_SECS,
            editor_name: "Text Editor".to_string(),
            editor_image: "editor".to_string(),
            idle_image: "idle".to_string(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF_MS,
            ping_every_ticks: DEFAULT_PING_EVERY_TICKS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            preserve_start_time_across_reconnects: true,
        }
    }
}

impl PresenceConfig {
    /// Loads the configuration, falling back to defaults on any failure.
    pub fn load(path: Option<PathBuf>) -> Self {
        let path = match path.or_else(config_path) {
            Some(path) => path,
            None => {
                tracing::warn!("Could not resolve config path; using defaults");
                return Self::default();
            }
        };

        match Self::load_from(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to load presence config; using defaults");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, PresenceError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs_err::read_to_string(path).map_err(|err| PresenceError::Config {
            path: path.to_path_buf(),
            details: err.to_string(),
        })?;
        let config = toml::from_str::<PresenceConfig>(&content).map_err(|err| {
            PresenceError::Config {
                path: path.to_path_buf(),
                details: err.to_string(),
            }
        })?;
        Ok(config.sanitized())
    }

    /// Replaces invalid values with their defaults.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();

        if self.client_id < MIN_CLIENT_ID {
            tracing::warn!(client_id = self.client_id, "Client id too small; using default");
            self.client_id = defaults.client_id;
        }

        fix_format(&mut self.details_format, &defaults.details_format);
        fix_format(&mut self.state_format, &defaults.state_format);
        fix_format(&mut self.large_text_format, &defaults.large_text_format);

        clamp_or_default(&mut self.idle_time_secs, 1..=86_400, defaults.idle_time_secs);
        clamp_or_default(
            &mut self.heartbeat_interval_ms,
            16..=60_000,
            defaults.heartbeat_interval_ms,
        );
        clamp_or_default(
            &mut self.reconnect_backoff_ms,
            100..=60_000,
            defaults.reconnect_backoff_ms,
        );
        clamp_or_default(&mut self.ping_every_ticks, 1..=3_600, defaults.ping_every_ticks);
        clamp_or_default(&mut self.write_timeout_ms, 100..=30_000, defaults.write_timeout_ms);
        clamp_or_default(&mut self.read_timeout_ms, 100..=30_000, defaults.read_timeout_ms);

        if self.editor_image.trim().is_empty() {
            self.editor_image = defaults.editor_image;
        }
        if self.idle_image.trim().is_empty() {
            self.idle_image = defaults.idle_image;
        }

        self
    }

    pub fn client_id(&self) -> u64 {
        u64::try_from(self.client_id).unwrap_or(DEFAULT_CLIENT_ID as u64)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_time_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Returns the config file path: `PRESENCE_CONFIG`, else
/// `~/.editor-presence/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    data_dir().map(|dir| dir.join(CONFIG_FILE))
}

/// Returns `~/.editor-presence`.
pub fn data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR))
}

fn fix_format(value: &mut String, default: &str) {
    if value.len() > MAX_FORMAT_LEN {
        tracing::warn!(len = value.len(), "Format string too long; using default");
        *value = default.to_string();
    }
}

fn clamp_or_default<T: PartialOrd + Copy>(
    value: &mut T,
    range: std::ops::RangeInclusive<T>,
    default: T,
) {
    if !range.contains(&*value) {
        *value = default;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = PresenceConfig::load_from(&temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, PresenceConfig::default());
    }

    #[test]
    fn parses_partial_file_and_keeps_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
client_id = 123456789012345678
hide_state = true
details_format = "Working on %(file) (%(line):%(column))"
idle_time_secs = 60
"#,
        )
        .unwrap();

        let config = PresenceConfig::load_from(&path).unwrap();
        assert_eq!(config.client_id(), 123456789012345678);
        assert!(config.hide_state);
        assert_eq!(config.details_format, "Working on %(file) (%(line):%(column))");
        assert_eq!(config.idle_threshold(), Duration::from_secs(60));
        assert_eq!(config.state_format, DEFAULT_STATE_FORMAT);
        assert!(config.preserve_start_time_across_reconnects);
    }

    #[test]
    fn small_client_id_is_replaced() {
        let config = PresenceConfig {
            client_id: 12345,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(config.client_id, DEFAULT_CLIENT_ID);
    }

    #[test]
    fn out_of_range_timers_are_replaced() {
        let config = PresenceConfig {
            heartbeat_interval_ms: 0,
            reconnect_backoff_ms: 10,
            ping_every_ticks: 0,
            read_timeout_ms: 999_999,
            idle_time_secs: 0,
            ..Default::default()
        }
        .sanitized();
        let defaults = PresenceConfig::default();
        assert_eq!(config.heartbeat_interval_ms, defaults.heartbeat_interval_ms);
        assert_eq!(config.reconnect_backoff_ms, defaults.reconnect_backoff_ms);
        assert_eq!(config.ping_every_ticks, defaults.ping_every_ticks);
        assert_eq!(config.read_timeout_ms, defaults.read_timeout_ms);
        assert_eq!(config.idle_time_secs, defaults.idle_time_secs);
    }

    #[test]
    fn oversized_format_is_replaced() {
        let config = PresenceConfig {
            details_format: "x".repeat(MAX_FORMAT_LEN + 1),
            ..Default::default()
        }
        .sanitized();
        assert_eq!(config.details_format, DEFAULT_DETAILS_FORMAT);
    }

    #[test]
    fn malformed_file_is_an_error_but_load_falls_back() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "client_id = \"not a number\"").unwrap();

        assert!(matches!(
            PresenceConfig::load_from(&path),
            Err(PresenceError::Config { .. })
        ));
        assert_eq!(PresenceConfig::load(Some(path)), PresenceConfig::default());
    }
}

// Engine configuration
// Defaults, overridden by <config dir>/config.json, overridden by CHATSYNC_* env vars.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::sync::connection::ReconnectPolicy;
use crate::sync::error::ChatError;

pub const CONFIG_FILE: &str = "config.json";
pub const UNREAD_CACHE_FILE: &str = "unread_cache.json";

static CONFIG_DIR_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Point every config/cache lookup at `dir`. Only the first call wins.
pub fn set_config_dir_override(dir: PathBuf) {
    if CONFIG_DIR_OVERRIDE.set(dir.clone()).is_err() {
        warn!("Config directory already overridden, ignoring {}", dir.display());
    }
}

pub fn config_dir() -> Result<PathBuf, ChatError> {
    let dir = match CONFIG_DIR_OVERRIDE.get() {
        Some(dir) => dir.clone(),
        None => dirs::config_dir()
            .ok_or_else(|| ChatError::Config("Could not determine config directory".to_string()))?
            .join("chatsync"),
    };
    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub socket_url: String,
    pub api_url: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Bound on every REST call; a hang counts as a failure
    pub request_timeout_secs: u64,
    pub ack_timeout_ms: u64,
    pub typing_window_ms: u64,
    /// How far apart an optimistic send and its echo may be
    pub confirm_window_ms: i64,
    /// How far apart two copies of one message may be
    pub dedup_window_ms: i64,
    pub cache_max_age_secs: i64,
    /// Warm-start cache for unread counts; disabled when unset
    pub cache_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            socket_url: "ws://localhost:5000/socket".to_string(),
            api_url: "http://localhost:5000/api".to_string(),
            reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            request_timeout_secs: 15,
            ack_timeout_ms: 5000,
            typing_window_ms: 3000,
            confirm_window_ms: 5000,
            dedup_window_ms: 1000,
            cache_max_age_secs: 600,
            cache_path: None,
        }
    }
}

impl EngineConfig {
    /// Load `config.json` from `dir` (missing file means defaults) and apply
    /// environment overrides. The unread cache lives next to the config file.
    pub fn load(dir: &Path) -> Result<Self, ChatError> {
        let path = dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let config: EngineConfig = serde_json::from_str(&contents)
                .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))?;
            info!("Loaded configuration from {}", path.display());
            config
        } else {
            debug!("No {} found, using defaults", path.display());
            EngineConfig::default()
        };
        if config.cache_path.is_none() {
            config.cache_path = Some(dir.join(UNREAD_CACHE_FILE));
        }
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CHATSYNC_SOCKET_URL") {
            self.socket_url = url;
        }
        if let Some(url) = lookup("CHATSYNC_API_URL") {
            self.api_url = url;
        }
        if let Some(raw) = lookup("CHATSYNC_REQUEST_TIMEOUT_SECS") {
            match raw.parse() {
                Ok(secs) => self.request_timeout_secs = secs,
                Err(_) => warn!("Ignoring invalid CHATSYNC_REQUEST_TIMEOUT_SECS '{}'", raw),
            }
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            base_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn typing_window(&self) -> Duration {
        Duration::from_millis(self.typing_window_ms)
    }

    pub fn confirm_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.confirm_window_ms)
    }

    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.dedup_window_ms)
    }

    pub fn cache_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_load_defaults_and_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.typing_window(), Duration::from_secs(3));
        assert_eq!(config.cache_path, Some(dir.path().join(UNREAD_CACHE_FILE)));

        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"api_url": "https://fleet.example/api", "reconnect_attempts": 2}"#,
        )
        .unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.reconnect_attempts, 2);
        assert_eq!(config.dedup_window_ms, 1000);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();
        assert!(matches!(EngineConfig::load(dir.path()), Err(ChatError::Config(_))));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("CHATSYNC_SOCKET_URL", "wss://fleet.example/socket"),
            ("CHATSYNC_REQUEST_TIMEOUT_SECS", "nope"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.socket_url, "wss://fleet.example/socket");
        assert_eq!(config.request_timeout_secs, 15);
        assert_eq!(config.reconnect_policy().max_attempts, 5);
    }
}

//! Server configuration module
//! Environment-driven server settings plus the JSON room list

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_HISTORY_CAPACITY, DEFAULT_HOST, DEFAULT_HTTP_PORT, DEFAULT_ROOMS_FILE,
    DEFAULT_SOCKET_PORT, SESSION_CLEANUP_INTERVAL_SECS, STALE_SWEEP_INTERVAL_SECS,
    UPDATER_WAIT_TIMEOUT_MS, USER_STALE_TIMEOUT_SECS,
};
use crate::core::room::parse_hex_color;
use crate::error::{ChatError, Result};

/// Server configuration parameters
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Port for the HTTP API and websocket upgrade
    pub http_port: u16,
    /// Port for raw socket clients
    pub socket_port: u16,
    pub rooms_file: PathBuf,
    /// Public messages kept per room
    pub history_capacity: usize,
    /// Web users silent for longer than this are logged out
    pub stale_timeout: Duration,
    pub sweep_interval: Duration,
    pub session_cleanup_interval: Duration,
    /// How long a long-poll request may stay open
    pub poll_timeout: Duration,
    /// Take the client address from proxy headers
    pub trust_proxy_headers: bool,
    pub censored_words_file: Option<PathBuf>,
    pub blocked_words_file: Option<PathBuf>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    /// Create a test configuration
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            http_port: 0,
            socket_port: 0,
            rooms_file: PathBuf::from(DEFAULT_ROOMS_FILE),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            stale_timeout: Duration::from_secs(USER_STALE_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(STALE_SWEEP_INTERVAL_SECS),
            session_cleanup_interval: Duration::from_secs(SESSION_CLEANUP_INTERVAL_SECS),
            poll_timeout: Duration::from_millis(500),
            trust_proxy_headers: false,
            censored_words_file: None,
            blocked_words_file: None,
        }
    }

    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        let host = env::var("RETRO_ROOMS_HOST").unwrap_or(DEFAULT_HOST.to_string());
        let http_port = env_parse("RETRO_ROOMS_HTTP_PORT", DEFAULT_HTTP_PORT);
        let socket_port = env_parse("RETRO_ROOMS_SOCKET_PORT", DEFAULT_SOCKET_PORT);

        let rooms_file = env::var("RETRO_ROOMS_ROOMS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_ROOMS_FILE));

        let history_capacity = env_parse("RETRO_ROOMS_HISTORY_CAPACITY", DEFAULT_HISTORY_CAPACITY);
        let stale_secs = env_parse("RETRO_ROOMS_STALE_TIMEOUT_SECS", USER_STALE_TIMEOUT_SECS);
        let sweep_secs = env_parse("RETRO_ROOMS_SWEEP_INTERVAL_SECS", STALE_SWEEP_INTERVAL_SECS);
        let cleanup_secs = env_parse(
            "RETRO_ROOMS_SESSION_CLEANUP_SECS",
            SESSION_CLEANUP_INTERVAL_SECS,
        );
        let poll_ms = env_parse("RETRO_ROOMS_POLL_TIMEOUT_MS", UPDATER_WAIT_TIMEOUT_MS);
        let trust_proxy_headers = env::var("RETRO_ROOMS_TRUST_PROXY_HEADERS")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(false);

        let censored_words_file = env::var("RETRO_ROOMS_CENSORED_WORDS").ok().map(PathBuf::from);
        let blocked_words_file = env::var("RETRO_ROOMS_BLOCKED_WORDS").ok().map(PathBuf::from);

        let config = Self {
            host,
            http_port,
            socket_port,
            rooms_file,
            history_capacity,
            stale_timeout: Duration::from_secs(stale_secs),
            sweep_interval: Duration::from_secs(sweep_secs),
            session_cleanup_interval: Duration::from_secs(cleanup_secs),
            poll_timeout: Duration::from_millis(poll_ms),
            trust_proxy_headers,
            censored_words_file,
            blocked_words_file,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.http_port != 0 && self.http_port == self.socket_port {
            return Err(ChatError::ConfigError(format!(
                "HTTP and socket ports must differ (both {})",
                self.http_port
            )));
        }
        if self.sweep_interval.is_zero() || self.session_cleanup_interval.is_zero() {
            return Err(ChatError::ConfigError(
                "Background task intervals must be greater than zero".to_string(),
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(ChatError::ConfigError(
                "Poll timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load and validate the room list named by `rooms_file`
    pub fn load_rooms(&self) -> Result<RoomsFile> {
        RoomsFile::load(&self.rooms_file)
    }
}

/// The reserved administrator account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    pub id: String,
    pub nickname: String,
    #[serde(default = "default_admin_color")]
    pub color: String,
    /// Account on the bridged service; the administrator is kept present in bridged rooms
    #[serde(default)]
    pub bridge_id: Option<String>,
}

fn default_admin_color() -> String {
    crate::constants::COLOR_BLACK.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub color: String,
    #[serde(default)]
    pub bridge_channel: Option<String>,
    #[serde(default)]
    pub intro_message: Option<String>,
}

impl RoomConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            color: color.into(),
            bridge_channel: None,
            intro_message: None,
        }
    }
}

/// Contents of the rooms file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsFile {
    #[serde(default)]
    pub admin: AdminConfig,
    pub rooms: Vec<RoomConfig>,
}

impl RoomsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            ChatError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let rooms = Self::from_json(&text)?;
        info!("Loaded {} rooms from {}", rooms.rooms.len(), path.display());
        Ok(rooms)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let rooms: Self = serde_json::from_str(text)?;
        rooms.validate()?;
        Ok(rooms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rooms.is_empty() {
            return Err(ChatError::ConfigError("No rooms configured".to_string()));
        }

        let mut seen = HashSet::new();
        for room in &self.rooms {
            if room.id.trim().is_empty() {
                return Err(ChatError::ConfigError("Room id cannot be empty".to_string()));
            }
            if !seen.insert(room.id.as_str()) {
                return Err(ChatError::ConfigError(format!(
                    "Duplicate room id: {}",
                    room.id
                )));
            }
            if parse_hex_color(&room.color).is_none() {
                return Err(ChatError::ConfigError(format!(
                    "Room {} has invalid color {:?}, expected #RRGGBB",
                    room.id, room.color
                )));
            }
        }

        if !self.admin.nickname.is_empty() && parse_hex_color(&self.admin.color).is_none() {
            return Err(ChatError::ConfigError(format!(
                "Administrator has invalid color {:?}",
                self.admin.color
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOMS: &str = r##"{
        "admin": { "id": "owner", "nickname": "Webmaster", "color": "#FF0000", "bridge_id": "42" },
        "rooms": [
            { "id": "lobby", "name": "Lobby", "description": "Say hi", "color": "#FFFF00" },
            { "id": "games", "name": "Games", "color": "#000080", "bridge_channel": "999",
              "intro_message": "Be kind" }
        ]
    }"##;

    #[test]
    fn test_rooms_file_parses() {
        let rooms = RoomsFile::from_json(ROOMS).unwrap();
        assert_eq!(rooms.rooms.len(), 2);
        assert_eq!(rooms.admin.nickname, "Webmaster");
        assert_eq!(rooms.admin.bridge_id.as_deref(), Some("42"));
        assert_eq!(rooms.rooms[0].bridge_channel, None);
        assert_eq!(rooms.rooms[1].bridge_channel.as_deref(), Some("999"));
        assert_eq!(rooms.rooms[1].description, "");
    }

    #[test]
    fn test_rooms_file_rejects_duplicates() {
        let json = r##"{ "rooms": [
            { "id": "a", "name": "A", "color": "#000000" },
            { "id": "a", "name": "B", "color": "#000000" }
        ] }"##;
        assert!(matches!(
            RoomsFile::from_json(json),
            Err(ChatError::ConfigError(msg)) if msg.contains("Duplicate")
        ));
    }

    #[test]
    fn test_rooms_file_rejects_bad_color_and_empty_list() {
        let bad_color = r#"{ "rooms": [ { "id": "a", "name": "A", "color": "red" } ] }"#;
        assert!(RoomsFile::from_json(bad_color).is_err());
        assert!(RoomsFile::from_json(r#"{ "rooms": [] }"#).is_err());
        assert!(RoomsFile::from_json("not json").is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ServerConfig::for_testing();
        assert!(config.validate().is_ok());

        config.http_port = 4000;
        config.socket_port = 4000;
        assert!(config.validate().is_err());

        config.socket_port = 4001;
        config.poll_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}

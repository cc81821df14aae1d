//! Chat users and their room-scoped identities

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::message::MessageSource;

/// Derive the room-scoped identity of a raw client or session id.
///
/// The same raw id always maps to the same identity within a room, so a
/// reconnecting client gets its user back.
pub fn combined_id(room_id: &str, raw_id: &str) -> String {
    let name = format!("{}{}", room_id, raw_id);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

/// Small snapshot of a user carried inside messages and events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub nickname: String,
    pub color: String,
    pub room_id: String,
}

/// Where a user is connected from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Web,
    Socket,
    Bridge,
}

/// A registered room participant
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub room_id: String,
    pub nickname: String,
    pub color: String,
    pub is_admin: bool,
    pub origin: Origin,
    /// Identifier on the bridged service, if the user came from or is mirrored to it
    pub bridge_id: Option<String>,
    pub client: ClientInfo,
}

impl User {
    pub fn is_web_user(&self) -> bool {
        self.origin == Origin::Web
    }

    pub fn is_bridged(&self) -> bool {
        self.bridge_id.is_some()
    }

    /// Bridged administrators keep a permanent presence in their rooms
    pub fn is_protected(&self) -> bool {
        self.is_admin && self.is_bridged()
    }

    /// Bridged users are mirrored from elsewhere and not listed as online,
    /// except for the administrator
    pub fn is_listed_online(&self) -> bool {
        self.is_admin || !self.is_bridged()
    }

    pub fn to_ref(&self) -> UserRef {
        UserRef {
            id: self.id.clone(),
            nickname: self.nickname.clone(),
            color: self.color.clone(),
            room_id: self.room_id.clone(),
        }
    }
}

pub const PLATFORM_DESKTOP: &str = "desktop";
pub const PLATFORM_WEB: &str = "web";
pub const PLATFORM_BRIDGE: &str = "bridge";

/// Client descriptor sent by native clients, e.g. `plat:(desktop) os:(win31) env:(16-bit) v:(1.2)`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub platform: String,
    pub os: String,
    pub env: String,
    pub version: String,
}

impl ClientInfo {
    pub fn web() -> Self {
        Self {
            platform: PLATFORM_WEB.to_string(),
            ..Self::default()
        }
    }

    pub fn bridge() -> Self {
        Self {
            platform: PLATFORM_BRIDGE.to_string(),
            ..Self::default()
        }
    }

    /// Parse `label:(value)` pairs; unknown labels are ignored
    pub fn parse(descriptor: &str) -> Self {
        let mut info = Self::default();
        let mut rest = descriptor;

        while let Some(open) = rest.find(":(") {
            let label_start = rest[..open]
                .rfind(|c: char| c.is_whitespace())
                .map(|i| i + 1)
                .unwrap_or(0);
            let label = rest[label_start..open].to_ascii_lowercase();
            let after = &rest[open + 2..];
            let Some(close) = after.find(')') else {
                break;
            };
            let value = after[..close].to_string();

            match label.as_str() {
                "plat" => info.platform = value,
                "os" => info.os = value,
                "env" => info.env = value,
                "v" => info.version = value,
                _ => {}
            }

            rest = &after[close + 1..];
        }

        info
    }

    pub fn format(&self) -> String {
        let mut parts = Vec::new();
        if !self.platform.is_empty() {
            parts.push(format!("plat:({})", self.platform));
        }
        if !self.os.is_empty() {
            parts.push(format!("os:({})", self.os));
        }
        if !self.env.is_empty() {
            parts.push(format!("env:({})", self.env));
        }
        if !self.version.is_empty() {
            parts.push(format!("v:({})", self.version));
        }
        parts.join(" ")
    }

    /// Provenance tag stamped on messages sent from this client
    pub fn message_source(&self) -> MessageSource {
        match self.platform.as_str() {
            PLATFORM_DESKTOP if self.env == "16-bit" => MessageSource::Win16,
            PLATFORM_WEB => MessageSource::Web,
            PLATFORM_BRIDGE => MessageSource::Bridge,
            _ => MessageSource::Socket,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_id_is_deterministic_per_room() {
        assert_eq!(combined_id("lobby", "abc"), combined_id("lobby", "abc"));
        assert_ne!(combined_id("lobby", "abc"), combined_id("games", "abc"));
        assert_ne!(combined_id("lobby", "abc"), combined_id("lobby", "abd"));
    }

    #[test]
    fn test_client_info_parse() {
        let info = ClientInfo::parse("plat:(desktop) os:(Windows 3.11) env:(16-bit) v:(0.9)");
        assert_eq!(info.platform, "desktop");
        assert_eq!(info.os, "Windows 3.11");
        assert_eq!(info.env, "16-bit");
        assert_eq!(info.version, "0.9");
        assert_eq!(info.message_source(), MessageSource::Win16);
    }

    #[test]
    fn test_client_info_format_skips_empty() {
        let info = ClientInfo {
            platform: "desktop".to_string(),
            version: "2".to_string(),
            ..ClientInfo::default()
        };
        assert_eq!(info.format(), "plat:(desktop) v:(2)");
        assert_eq!(ClientInfo::parse(&info.format()), info);
        assert_eq!(info.message_source(), MessageSource::Socket);
    }

    #[test]
    fn test_client_info_ignores_garbage() {
        let info = ClientInfo::parse("hello world plat:(web");
        assert_eq!(info, ClientInfo::default());
    }
}

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;

use crate::config::RoomConfig;
use crate::constants::COLOR_BLACK;
use crate::core::message::Message;

/// Represents a chat room configured at startup
#[derive(Debug, Clone, Serialize)]
pub struct Room {
    /// Stable identifier from configuration
    pub id: String,
    /// Display name of the room
    pub name: String,
    pub description: String,
    /// Accent color as `#RRGGBB`
    pub color: String,
    /// Black or white, whichever reads better on top of `color`
    pub text_color: String,
    /// Channel on the bridged service mirrored into this room
    pub bridge_channel: Option<String>,
    /// Private greeting shown to web users after they join
    pub intro_message: Option<String>,
}

impl Room {
    pub fn new(id: impl Into<String>, name: impl Into<String>, color: impl Into<String>) -> Self {
        let color = color.into();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            text_color: contrasting_text_color(&color).to_string(),
            color,
            bridge_channel: None,
            intro_message: None,
        }
    }

    pub fn from_config(config: &RoomConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
            color: config.color.clone(),
            text_color: contrasting_text_color(&config.color).to_string(),
            bridge_channel: config.bridge_channel.clone().filter(|c| !c.is_empty()),
            intro_message: config.intro_message.clone().filter(|m| !m.is_empty()),
        }
    }

    pub fn is_bridged(&self) -> bool {
        self.bridge_channel.is_some()
    }
}

/// Parse a `#RRGGBB` color into its channels
pub fn parse_hex_color(color: &str) -> Option<(u8, u8, u8)> {
    let hex = color.strip_prefix('#')?;
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();
    Some((channel(0..2)?, channel(2..4)?, channel(4..6)?))
}

/// Perceptual lightness (CIE L*, 0..=100) of a `#RRGGBB` color
pub fn lightness(color: &str) -> Option<f64> {
    let (r, g, b) = parse_hex_color(color)?;
    let linear = |c: u8| {
        let c = f64::from(c) / 255.0;
        if c <= 0.04045 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    };
    let y = 0.2126 * linear(r) + 0.7152 * linear(g) + 0.0722 * linear(b);
    let l = if y > 216.0 / 24389.0 {
        116.0 * y.cbrt() - 16.0
    } else {
        y * 24389.0 / 27.0
    };
    Some(l)
}

/// Text color for a background: black on light colors, white on dark ones
pub fn contrasting_text_color(background: &str) -> &'static str {
    match lightness(background) {
        Some(l) if l > 60.0 => COLOR_BLACK,
        Some(_) => "#FFFFFF",
        None => COLOR_BLACK,
    }
}

/// Bounded history of a room's public messages, oldest evicted first
#[derive(Debug)]
pub struct MessageHistory {
    messages: VecDeque<Arc<Message>>,
    max_size: usize,
}

impl MessageHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity),
            max_size: capacity,
        }
    }

    /// Add a message, removing the oldest if at capacity
    pub fn push(&mut self, message: Arc<Message>) {
        if self.max_size == 0 {
            return;
        }
        while self.messages.len() >= self.max_size {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// The most recent `limit` messages, oldest first
    pub fn recent(&self, limit: usize) -> Vec<Arc<Message>> {
        let skip = self.messages.len().saturating_sub(limit);
        self.messages.iter().skip(skip).cloned().collect()
    }

    pub fn all(&self) -> Vec<Arc<Message>> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::user::UserRef;

    fn message(body: &str) -> Arc<Message> {
        let subject = UserRef {
            id: "u".to_string(),
            nickname: "U".to_string(),
            color: COLOR_BLACK.to_string(),
            room_id: "lobby".to_string(),
        };
        let mut msg = Message::system("lobby", body, &subject);
        msg.is_system = false;
        Arc::new(msg)
    }

    #[test]
    fn test_text_color_contrast() {
        assert_eq!(contrasting_text_color("#FFFFFF"), "#000000");
        assert_eq!(contrasting_text_color("#FFFF00"), "#000000");
        assert_eq!(contrasting_text_color("#000080"), "#FFFFFF");
        assert_eq!(contrasting_text_color("#800080"), "#FFFFFF");
        assert_eq!(contrasting_text_color("not-a-color"), "#000000");
    }

    #[test]
    fn test_parse_hex_color() {
        assert_eq!(parse_hex_color("#FF0080"), Some((255, 0, 128)));
        assert_eq!(parse_hex_color("FF0080"), None);
        assert_eq!(parse_hex_color("#FF00"), None);
        assert_eq!(parse_hex_color("#GG0000"), None);
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = MessageHistory::with_capacity(3);
        for body in ["one", "two", "three", "four"] {
            history.push(message(body));
        }
        let bodies: Vec<_> = history.all().iter().map(|m| m.body.clone()).collect();
        assert_eq!(bodies, vec!["two", "three", "four"]);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_history_recent() {
        let mut history = MessageHistory::with_capacity(10);
        for body in ["a", "b", "c"] {
            history.push(message(body));
        }
        let recent: Vec<_> = history.recent(2).iter().map(|m| m.body.clone()).collect();
        assert_eq!(recent, vec!["b", "c"]);
        assert_eq!(history.recent(10).len(), 3);
    }
}

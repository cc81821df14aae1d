use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::NICKNAME_PLACEHOLDER;
use crate::core::user::UserRef;

/// How a message is spoken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpeechMode {
    #[default]
    SaysTo,
    ScreamsAt,
    WhispersTo,
}

impl SpeechMode {
    pub const ALL: [SpeechMode; 3] = [Self::SaysTo, Self::ScreamsAt, Self::WhispersTo];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SaysTo => "says-to",
            Self::ScreamsAt => "screams-at",
            Self::WhispersTo => "whispers-to",
        }
    }

    /// Parse the wire value; unknown values fall back to `None`
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.as_str() == value)
    }

    pub fn is_loud(&self) -> bool {
        matches!(self, Self::ScreamsAt)
    }
}

/// Which transport produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    Web,
    Socket,
    Win16,
    Bridge,
    System,
}

impl MessageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Socket => "socket",
            Self::Win16 => "win16",
            Self::Bridge => "bridge",
            Self::System => "system",
        }
    }
}

/// A chat message. Never mutated once the store has accepted it.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: Uuid,
    /// Position in the room's insertion order, assigned by the store
    pub seq: u64,
    pub room_id: String,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub from: Option<UserRef>,
    pub to: Option<UserRef>,
    pub private: bool,
    pub mode: SpeechMode,
    pub is_system: bool,
    /// User substituted for the nickname placeholder of a system message
    pub subject: Option<UserRef>,
    pub source: MessageSource,
}

impl Message {
    /// A public system message about `subject`
    pub fn system(room_id: &str, template: &str, subject: &UserRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            room_id: room_id.to_string(),
            timestamp: Utc::now(),
            body: template.to_string(),
            from: Some(subject.clone()),
            to: None,
            private: false,
            mode: SpeechMode::SaysTo,
            is_system: true,
            subject: Some(subject.clone()),
            source: MessageSource::System,
        }
    }

    /// A system notice only `recipient` can see
    pub fn notice(room_id: &str, template: &str, recipient: &UserRef) -> Self {
        Self {
            from: None,
            to: Some(recipient.clone()),
            private: true,
            ..Self::system(room_id, template, recipient)
        }
    }

    pub fn sender_id(&self) -> Option<&str> {
        self.from.as_ref().map(|u| u.id.as_str())
    }

    pub fn addressee_id(&self) -> Option<&str> {
        self.to.as_ref().map(|u| u.id.as_str())
    }

    /// Public messages reach everyone; private ones only the sender and addressee
    pub fn is_visible_to(&self, user_id: &str) -> bool {
        !self.private
            || self.sender_id() == Some(user_id)
            || self.addressee_id() == Some(user_id)
    }

    /// Body with the nickname placeholder filled in for system messages
    pub fn rendered_body(&self) -> String {
        match (&self.subject, self.is_system) {
            (Some(subject), true) => self.body.replace(NICKNAME_PLACEHOLDER, &subject.nickname),
            _ => self.body.clone(),
        }
    }
}

/// What a transport submits to the store for posting
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub room_id: String,
    pub from: String,
    pub to: Option<String>,
    pub body: String,
    pub mode: SpeechMode,
    pub private: bool,
    pub source: MessageSource,
}

impl MessageDraft {
    pub fn new(room_id: impl Into<String>, from: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            from: from.into(),
            to: None,
            body: body.into(),
            mode: SpeechMode::SaysTo,
            private: false,
            source: MessageSource::Web,
        }
    }

    pub fn to(mut self, user_id: impl Into<String>) -> Self {
        self.to = Some(user_id.into());
        self
    }

    pub fn privately(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn mode(mut self, mode: SpeechMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn source(mut self, source: MessageSource) -> Self {
        self.source = source;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, nickname: &str) -> UserRef {
        UserRef {
            id: id.to_string(),
            nickname: nickname.to_string(),
            color: "#000000".to_string(),
            room_id: "lobby".to_string(),
        }
    }

    #[test]
    fn test_speech_mode_parse() {
        assert_eq!(SpeechMode::parse("screams-at"), Some(SpeechMode::ScreamsAt));
        assert_eq!(SpeechMode::parse("whispers-to"), Some(SpeechMode::WhispersTo));
        assert_eq!(SpeechMode::parse("yells"), None);
        assert!(SpeechMode::ScreamsAt.is_loud());
    }

    #[test]
    fn test_system_message_renders_subject() {
        let alice = user("a", "Alice");
        let msg = Message::system("lobby", "{nickname} has joined the room!", &alice);
        assert_eq!(msg.rendered_body(), "Alice has joined the room!");
        assert!(msg.is_visible_to("anyone"));
    }

    #[test]
    fn test_notice_is_private_to_recipient() {
        let alice = user("a", "Alice");
        let notice = Message::notice("lobby", "Hi {nickname}", &alice);
        assert!(notice.is_visible_to("a"));
        assert!(!notice.is_visible_to("b"));
        assert_eq!(notice.rendered_body(), "Hi Alice");
    }
}

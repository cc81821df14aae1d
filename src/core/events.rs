//! Room state changes announced on each room's event bus

use std::sync::Arc;

use crate::core::message::Message;
use crate::core::user::UserRef;

#[derive(Debug, Clone)]
pub enum Event {
    MessagePosted(Arc<Message>),
    UserJoined(UserRef),
    UserLeft(UserRef),
    /// The room's user list changed without a join or leave (e.g. total count refresh)
    UserListChanged { room_id: String, total: usize },
    UserKicked { user: UserRef, reason: String },
}

impl Event {
    /// Whether subscribers showing a user list need to refresh it
    pub fn changes_user_list(&self) -> bool {
        match self {
            Event::UserJoined(_)
            | Event::UserLeft(_)
            | Event::UserListChanged { .. }
            | Event::UserKicked { .. } => true,
            Event::MessagePosted(_) => false,
        }
    }

    /// Whether this event delivers a message visible to `user_id`
    pub fn delivers_message_to(&self, user_id: &str) -> bool {
        match self {
            Event::MessagePosted(msg) => msg.is_visible_to(user_id),
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::MessagePosted(_) => "message-posted",
            Event::UserJoined(_) => "user-joined",
            Event::UserLeft(_) => "user-left",
            Event::UserListChanged { .. } => "user-list-changed",
            Event::UserKicked { .. } => "user-kicked",
        }
    }
}

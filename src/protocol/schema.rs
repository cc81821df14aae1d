//! Message types of the socket protocol and their field layouts
//!
//! Fields carry no names on the wire, so each type's field order below is
//! part of the protocol and must not change.

use crate::constants::NICKNAME_COLORS;
use crate::core::message::Message;
use crate::core::room::Room;
use crate::core::user::UserRef;
use crate::error::{ChatError, Result};
use crate::protocol::codec::{decode_fields, decode_list, encode_list, join_fields, Framing};

// Server -> client
pub const ERROR: u16 = 0;
pub const COLOR_LIST: u16 = 1;
pub const ROOM_LIST: u16 = 2;
pub const REGISTRATION_SUCCESS: u16 = 3;
pub const USER_JOINED: u16 = 4;
pub const USER_LEFT: u16 = 5;
pub const USER_LIST_UPDATED: u16 = 6;
pub const MESSAGE_SENT: u16 = 7;
pub const USER_KICKED: u16 = 8;
pub const SERVER_TIME: u16 = 9;
pub const ROOM_LIST_START: u16 = 20;
pub const ROOM_LIST_ITEM: u16 = 21;
pub const ROOM_LIST_END: u16 = 22;

// Client -> server
pub const REGISTER_USER: u16 = 100;
pub const SEND_MESSAGE: u16 = 101;
pub const COLOR_LIST_REQUEST: u16 = 105;
pub const ROOM_LIST_REQUEST: u16 = 106;
pub const PING: u16 = 110;

/// Wire time format for message and clock fields
pub const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    /// `[]` followed by comma-separated items
    List,
    Bool,
    Int,
    /// Nested user record, empty when absent
    User,
}

#[derive(Debug)]
pub struct MessageSchema {
    pub code: u16,
    pub name: &'static str,
    pub fields: &'static [(&'static str, FieldKind)],
}

use FieldKind::{Bool, Int, List, Text, User};

const USER_FIELDS: &[(&str, FieldKind)] = &[
    ("user_id", Text),
    ("nickname", Text),
    ("color", Text),
    ("room_id", Text),
];

pub static SCHEMAS: &[MessageSchema] = &[
    MessageSchema { code: ERROR, name: "error", fields: &[("message", Text)] },
    MessageSchema {
        code: COLOR_LIST,
        name: "color-list",
        fields: &[("colors", List), ("color_names", List)],
    },
    MessageSchema {
        code: ROOM_LIST,
        name: "room-list",
        fields: &[("room_ids", List), ("room_names", List)],
    },
    MessageSchema { code: REGISTRATION_SUCCESS, name: "registration-success", fields: USER_FIELDS },
    MessageSchema { code: USER_JOINED, name: "user-joined", fields: USER_FIELDS },
    MessageSchema {
        code: USER_LEFT,
        name: "user-left",
        fields: &[("user_id", Text), ("room_id", Text)],
    },
    MessageSchema {
        code: USER_LIST_UPDATED,
        name: "user-list-updated",
        fields: &[("room_id", Text), ("total", Int)],
    },
    MessageSchema {
        code: MESSAGE_SENT,
        name: "message-sent",
        fields: &[
            ("room_id", Text),
            ("from", User),
            ("to", User),
            ("privately", Bool),
            ("speech_mode", Text),
            ("time", Text),
            ("is_system_message", Bool),
            ("system_message_subject", User),
            ("is_history", Bool),
            ("message", Text),
        ],
    },
    MessageSchema { code: USER_KICKED, name: "user-kicked", fields: &[("reason", Text)] },
    MessageSchema { code: SERVER_TIME, name: "server-time", fields: &[("time", Text)] },
    MessageSchema { code: ROOM_LIST_START, name: "room-list-start", fields: &[("count", Int)] },
    MessageSchema {
        code: ROOM_LIST_ITEM,
        name: "room-list-item",
        fields: &[("room_id", Text), ("room_name", Text)],
    },
    MessageSchema { code: ROOM_LIST_END, name: "room-list-end", fields: &[] },
    MessageSchema {
        code: REGISTER_USER,
        name: "register-user",
        fields: &[("nickname", Text), ("color", Text), ("room_id", Text), ("client", Text)],
    },
    MessageSchema {
        code: SEND_MESSAGE,
        name: "send-message",
        fields: &[
            ("user_id", Text),
            ("to", Text),
            ("speech_mode", Text),
            ("message", Text),
            ("privately", Bool),
            ("room_id", Text),
        ],
    },
    MessageSchema { code: COLOR_LIST_REQUEST, name: "color-list-request", fields: &[] },
    MessageSchema { code: ROOM_LIST_REQUEST, name: "room-list-request", fields: &[] },
    MessageSchema { code: PING, name: "ping", fields: &[("user_id", Text)] },
];

pub fn schema_for(code: u16) -> Option<&'static MessageSchema> {
    SCHEMAS.iter().find(|schema| schema.code == code)
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        other => Err(ChatError::MessageParseError(format!(
            "expected a boolean, got {:?}",
            other
        ))),
    }
}

fn bool_field(value: bool) -> String {
    let text = if value { "true" } else { "false" };
    text.to_string()
}

impl MessageSchema {
    /// Check the field count and the shape of every typed field
    pub fn check(&self, fields: &[String]) -> Result<()> {
        if fields.len() != self.fields.len() {
            return Err(ChatError::FieldCountMismatch {
                code: self.code,
                expected: self.fields.len(),
                found: fields.len(),
            });
        }
        for ((name, kind), value) in self.fields.iter().zip(fields) {
            let checked = match kind {
                Text => Ok(()),
                Bool => parse_bool(value).map(|_| ()),
                Int => value.parse::<u64>().map(|_| ()).map_err(|_| {
                    ChatError::MessageParseError(format!("{} is not a number: {:?}", name, value))
                }),
                List => decode_list(value).map(|_| ()),
                User => WireUser::decode(value).map(|_| ()),
            };
            checked.map_err(|e| match e {
                ChatError::MessageParseError(msg) => {
                    ChatError::MessageParseError(format!("{} field {}: {}", self.name, name, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

/// A typed protocol message that maps to and from its ordered field list
pub trait WireMessage: Sized {
    fn code(&self) -> u16;
    fn to_fields(&self) -> Vec<String>;
    /// Build from fields already checked against the type's schema
    fn from_checked_fields(code: u16, fields: Vec<String>) -> Result<Self>;

    fn from_fields(code: u16, fields: Vec<String>) -> Result<Self> {
        let schema = schema_for(code).ok_or(ChatError::UnknownMessageType(code))?;
        schema.check(&fields)?;
        Self::from_checked_fields(code, fields)
    }
}

/// User record nested inside a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireUser {
    pub user_id: String,
    pub nickname: String,
    pub color: String,
    pub room_id: String,
}

impl WireUser {
    pub fn encode(user: Option<&WireUser>) -> String {
        match user {
            Some(u) => join_fields(&[
                u.user_id.clone(),
                u.nickname.clone(),
                u.color.clone(),
                u.room_id.clone(),
            ]),
            None => String::new(),
        }
    }

    pub fn decode(value: &str) -> Result<Option<WireUser>> {
        if value.is_empty() {
            return Ok(None);
        }
        let mut fields = decode_fields(value)?.into_iter();
        match (fields.next(), fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(user_id), Some(nickname), Some(color), Some(room_id), None) => Ok(Some(WireUser {
                user_id,
                nickname,
                color,
                room_id,
            })),
            _ => Err(ChatError::MessageParseError(format!(
                "user record needs {} fields",
                USER_FIELDS.len()
            ))),
        }
    }
}

impl From<&UserRef> for WireUser {
    fn from(user: &UserRef) -> Self {
        Self {
            user_id: user.id.clone(),
            nickname: user.nickname.clone(),
            color: user.color.clone(),
            room_id: user.room_id.clone(),
        }
    }
}

/// Fields of a message-sent frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSent {
    pub room_id: String,
    pub from: Option<WireUser>,
    pub to: Option<WireUser>,
    pub privately: bool,
    pub speech_mode: String,
    pub time: String,
    pub is_system_message: bool,
    pub system_message_subject: Option<WireUser>,
    pub is_history: bool,
    pub message: String,
}

impl MessageSent {
    pub fn from_message(message: &Message, is_history: bool) -> Self {
        Self {
            room_id: message.room_id.clone(),
            from: message.from.as_ref().map(WireUser::from),
            to: message.to.as_ref().map(WireUser::from),
            privately: message.private,
            speech_mode: message.mode.as_str().to_string(),
            time: message.timestamp.format(TIME_FORMAT).to_string(),
            is_system_message: message.is_system,
            system_message_subject: message.subject.as_ref().map(WireUser::from),
            is_history,
            message: message.rendered_body(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Error { message: String },
    ColorList { colors: Vec<String>, color_names: Vec<String> },
    RoomList { room_ids: Vec<String>, room_names: Vec<String> },
    RegistrationSuccess(WireUser),
    UserJoined(WireUser),
    UserLeft { user_id: String, room_id: String },
    UserListUpdated { room_id: String, total: u32 },
    MessageSent(MessageSent),
    UserKicked { reason: String },
    ServerTime { time: String },
    RoomListStart { count: u32 },
    RoomListItem { room_id: String, room_name: String },
    RoomListEnd,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn color_list() -> Self {
        ServerMessage::ColorList {
            colors: NICKNAME_COLORS.iter().map(|(c, _)| c.to_string()).collect(),
            color_names: NICKNAME_COLORS.iter().map(|(_, n)| n.to_string()).collect(),
        }
    }

    /// The room list in the shape the framing expects: a single message for
    /// binary clients, a start/item/end sequence for legacy ones
    pub fn room_list(framing: Framing, rooms: &[Room]) -> Vec<ServerMessage> {
        match framing {
            Framing::Binary => vec![ServerMessage::RoomList {
                room_ids: rooms.iter().map(|r| r.id.clone()).collect(),
                room_names: rooms.iter().map(|r| r.name.clone()).collect(),
            }],
            Framing::Legacy => {
                let mut messages = Vec::with_capacity(rooms.len() + 2);
                messages.push(ServerMessage::RoomListStart {
                    count: rooms.len() as u32,
                });
                messages.extend(rooms.iter().map(|r| ServerMessage::RoomListItem {
                    room_id: r.id.clone(),
                    room_name: r.name.clone(),
                }));
                messages.push(ServerMessage::RoomListEnd);
                messages
            }
        }
    }
}

fn user_fields(user: &WireUser) -> Vec<String> {
    vec![
        user.user_id.clone(),
        user.nickname.clone(),
        user.color.clone(),
        user.room_id.clone(),
    ]
}

fn user_from_fields(mut f: std::vec::IntoIter<String>) -> WireUser {
    WireUser {
        user_id: f.next().unwrap_or_default(),
        nickname: f.next().unwrap_or_default(),
        color: f.next().unwrap_or_default(),
        room_id: f.next().unwrap_or_default(),
    }
}

impl WireMessage for ServerMessage {
    fn code(&self) -> u16 {
        match self {
            ServerMessage::Error { .. } => ERROR,
            ServerMessage::ColorList { .. } => COLOR_LIST,
            ServerMessage::RoomList { .. } => ROOM_LIST,
            ServerMessage::RegistrationSuccess(_) => REGISTRATION_SUCCESS,
            ServerMessage::UserJoined(_) => USER_JOINED,
            ServerMessage::UserLeft { .. } => USER_LEFT,
            ServerMessage::UserListUpdated { .. } => USER_LIST_UPDATED,
            ServerMessage::MessageSent(_) => MESSAGE_SENT,
            ServerMessage::UserKicked { .. } => USER_KICKED,
            ServerMessage::ServerTime { .. } => SERVER_TIME,
            ServerMessage::RoomListStart { .. } => ROOM_LIST_START,
            ServerMessage::RoomListItem { .. } => ROOM_LIST_ITEM,
            ServerMessage::RoomListEnd => ROOM_LIST_END,
        }
    }

    fn to_fields(&self) -> Vec<String> {
        match self {
            ServerMessage::Error { message } => vec![message.clone()],
            ServerMessage::ColorList { colors, color_names } => {
                vec![encode_list(colors), encode_list(color_names)]
            }
            ServerMessage::RoomList { room_ids, room_names } => {
                vec![encode_list(room_ids), encode_list(room_names)]
            }
            ServerMessage::RegistrationSuccess(user) | ServerMessage::UserJoined(user) => {
                user_fields(user)
            }
            ServerMessage::UserLeft { user_id, room_id } => vec![user_id.clone(), room_id.clone()],
            ServerMessage::UserListUpdated { room_id, total } => {
                vec![room_id.clone(), total.to_string()]
            }
            ServerMessage::MessageSent(m) => vec![
                m.room_id.clone(),
                WireUser::encode(m.from.as_ref()),
                WireUser::encode(m.to.as_ref()),
                bool_field(m.privately),
                m.speech_mode.clone(),
                m.time.clone(),
                bool_field(m.is_system_message),
                WireUser::encode(m.system_message_subject.as_ref()),
                bool_field(m.is_history),
                m.message.clone(),
            ],
            ServerMessage::UserKicked { reason } => vec![reason.clone()],
            ServerMessage::ServerTime { time } => vec![time.clone()],
            ServerMessage::RoomListStart { count } => vec![count.to_string()],
            ServerMessage::RoomListItem { room_id, room_name } => {
                vec![room_id.clone(), room_name.clone()]
            }
            ServerMessage::RoomListEnd => Vec::new(),
        }
    }

    fn from_checked_fields(code: u16, fields: Vec<String>) -> Result<Self> {
        let mut f = fields.into_iter();
        let mut next = || f.next().unwrap_or_default();
        let message = match code {
            ERROR => ServerMessage::Error { message: next() },
            COLOR_LIST => ServerMessage::ColorList {
                colors: decode_list(&next())?,
                color_names: decode_list(&next())?,
            },
            ROOM_LIST => ServerMessage::RoomList {
                room_ids: decode_list(&next())?,
                room_names: decode_list(&next())?,
            },
            REGISTRATION_SUCCESS | USER_JOINED => {
                let user = user_from_fields(vec![next(), next(), next(), next()].into_iter());
                if code == REGISTRATION_SUCCESS {
                    ServerMessage::RegistrationSuccess(user)
                } else {
                    ServerMessage::UserJoined(user)
                }
            }
            USER_LEFT => ServerMessage::UserLeft {
                user_id: next(),
                room_id: next(),
            },
            USER_LIST_UPDATED => ServerMessage::UserListUpdated {
                room_id: next(),
                total: parse_count(&next())?,
            },
            MESSAGE_SENT => ServerMessage::MessageSent(MessageSent {
                room_id: next(),
                from: WireUser::decode(&next())?,
                to: WireUser::decode(&next())?,
                privately: parse_bool(&next())?,
                speech_mode: next(),
                time: next(),
                is_system_message: parse_bool(&next())?,
                system_message_subject: WireUser::decode(&next())?,
                is_history: parse_bool(&next())?,
                message: next(),
            }),
            USER_KICKED => ServerMessage::UserKicked { reason: next() },
            SERVER_TIME => ServerMessage::ServerTime { time: next() },
            ROOM_LIST_START => ServerMessage::RoomListStart {
                count: parse_count(&next())?,
            },
            ROOM_LIST_ITEM => ServerMessage::RoomListItem {
                room_id: next(),
                room_name: next(),
            },
            ROOM_LIST_END => ServerMessage::RoomListEnd,
            other => return Err(ChatError::UnknownMessageType(other)),
        };
        Ok(message)
    }
}

fn parse_count(value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| ChatError::MessageParseError(format!("not a count: {:?}", value)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    RegisterUser {
        nickname: String,
        color: String,
        room_id: String,
        client: String,
    },
    SendMessage {
        user_id: String,
        to: String,
        speech_mode: String,
        message: String,
        privately: bool,
        room_id: String,
    },
    ColorListRequest,
    RoomListRequest,
    Ping {
        user_id: String,
    },
}

impl WireMessage for ClientMessage {
    fn code(&self) -> u16 {
        match self {
            ClientMessage::RegisterUser { .. } => REGISTER_USER,
            ClientMessage::SendMessage { .. } => SEND_MESSAGE,
            ClientMessage::ColorListRequest => COLOR_LIST_REQUEST,
            ClientMessage::RoomListRequest => ROOM_LIST_REQUEST,
            ClientMessage::Ping { .. } => PING,
        }
    }

    fn to_fields(&self) -> Vec<String> {
        match self {
            ClientMessage::RegisterUser {
                nickname,
                color,
                room_id,
                client,
            } => vec![nickname.clone(), color.clone(), room_id.clone(), client.clone()],
            ClientMessage::SendMessage {
                user_id,
                to,
                speech_mode,
                message,
                privately,
                room_id,
            } => vec![
                user_id.clone(),
                to.clone(),
                speech_mode.clone(),
                message.clone(),
                bool_field(*privately),
                room_id.clone(),
            ],
            ClientMessage::ColorListRequest | ClientMessage::RoomListRequest => Vec::new(),
            ClientMessage::Ping { user_id } => vec![user_id.clone()],
        }
    }

    fn from_checked_fields(code: u16, fields: Vec<String>) -> Result<Self> {
        let mut f = fields.into_iter();
        let mut next = || f.next().unwrap_or_default();
        let message = match code {
            REGISTER_USER => ClientMessage::RegisterUser {
                nickname: next(),
                color: next(),
                room_id: next(),
                client: next(),
            },
            SEND_MESSAGE => ClientMessage::SendMessage {
                user_id: next(),
                to: next(),
                speech_mode: next(),
                message: next(),
                privately: parse_bool(&next())?,
                room_id: next(),
            },
            COLOR_LIST_REQUEST => ClientMessage::ColorListRequest,
            ROOM_LIST_REQUEST => ClientMessage::RoomListRequest,
            PING => ClientMessage::Ping { user_id: next() },
            other => return Err(ChatError::UnknownMessageType(other)),
        };
        Ok(message)
    }
}

use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum ChatError {
    // Lookup errors
    RoomNotFound(String),
    UserNotFound(String),

    // Registration errors
    UserExists,
    NicknameTaken,
    InvalidNickname(String),
    FloodBanned,

    // Message errors
    EmptyMessage,
    MessageTooLarge(usize),

    // Protocol errors
    FrameTooShort(usize),
    FrameLengthMismatch { declared: usize, available: usize },
    UnknownMessageType(u16),
    FieldCountMismatch { code: u16, expected: usize, found: usize },
    MessageParseError(String),

    // Connection errors
    ConnectionError(String),

    // Configuration errors
    ConfigError(String),
}

impl ChatError {
    /// Text suitable for showing to the end user on a form or in an error frame
    pub fn user_message(&self) -> String {
        match self {
            Self::UserExists => "User already logged in.".to_string(),
            Self::NicknameTaken => {
                "Someone is already using this Nickname, try a different one.".to_string()
            }
            Self::InvalidNickname(reason) => reason.clone(),
            Self::FloodBanned => {
                "You have been temporarily kicked out for flooding, try again later.".to_string()
            }
            Self::RoomNotFound(_) => "This room does not exist.".to_string(),
            Self::UserNotFound(_) => "User not found!".to_string(),
            Self::EmptyMessage => "Message cannot be empty.".to_string(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoomNotFound(id) => write!(f, "Room not found: {}", id),
            Self::UserNotFound(id) => write!(f, "User not found: {}", id),
            Self::UserExists => write!(f, "User exists"),
            Self::NicknameTaken => write!(f, "Nickname already in use"),
            Self::InvalidNickname(reason) => write!(f, "Invalid nickname: {}", reason),
            Self::FloodBanned => write!(f, "Client is banned for flooding"),
            Self::EmptyMessage => write!(f, "Message is empty"),
            Self::MessageTooLarge(size) => write!(f, "Message too large: {} bytes", size),
            Self::FrameTooShort(len) => write!(f, "Frame too short: {} bytes", len),
            Self::FrameLengthMismatch { declared, available } => write!(
                f,
                "Frame length mismatch: declared {} bytes, {} available",
                declared, available
            ),
            Self::UnknownMessageType(code) => write!(f, "Unknown message type: {}", code),
            Self::FieldCountMismatch {
                code,
                expected,
                found,
            } => write!(
                f,
                "Message type {} expects {} fields, found {}",
                code, expected, found
            ),
            Self::MessageParseError(msg) => write!(f, "Message parse error: {}", msg),
            Self::ConnectionError(msg) => write!(f, "Connection error: {}", msg),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for ChatError {}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::ConnectionError(err.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::ConfigError(format!("Invalid JSON: {}", err))
    }
}

// Generic result type for the chat core
pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_errors_keep_their_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err: ChatError = io.into();
        assert!(matches!(err, ChatError::ConnectionError(_)));
        assert_eq!(err.user_message(), "Connection error: address in use");
    }
}

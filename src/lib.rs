//! Retro Rooms - a multi-room chat server for web, websocket and raw-socket clients
//!
//! This library provides the room and user store, the per-room event bus,
//! flood control, long-poll support and the socket wire protocol.

pub mod bridge;
pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;
pub mod profanity;
pub mod protocol;

// Re-export main components
pub use config::{AdminConfig, RoomConfig, RoomsFile, ServerConfig};
pub use error::{ChatError, Result};

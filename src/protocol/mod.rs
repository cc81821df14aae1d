//! Socket protocol: typed messages and their framing

pub mod codec;
pub mod schema;

pub use codec::{decode, encode, Frame, FrameReader, Framing};
pub use schema::{ClientMessage, MessageSent, ServerMessage, WireMessage, WireUser};

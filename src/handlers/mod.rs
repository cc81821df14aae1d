//! Transport adapters: raw socket, websocket and the JSON long-poll API

pub mod connection;
pub mod ip;
pub mod poll;
pub mod socket;
pub mod websocket;

use std::convert::Infallible;
use std::sync::Arc;

use warp::Filter;

use crate::core::store::ChatStore;

pub use connection::{Outgoing, ProtocolConnection};
pub use poll::{handle_rejection, poll_routes, PollContext};
pub use socket::{handle_socket_client, run_socket_server};
pub use websocket::{handle_ws_client, ws_route};

// Hand the shared store to a route
pub fn with_store(store: Arc<ChatStore>) -> impl Filter<Extract = (Arc<ChatStore>,), Error = Infallible> + Clone {
    warp::any().map(move || store.clone())
}

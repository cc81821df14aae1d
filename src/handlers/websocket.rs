//! Websocket transport carrying the socket protocol in binary messages

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use log::{error, info};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;
use warp::http::HeaderMap;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use crate::constants::WS_PATH;
use crate::core::store::ChatStore;
use crate::handlers::connection::{Outgoing, ProtocolConnection};
use crate::handlers::ip::extract_client_ip;
use crate::handlers::with_store;
use crate::protocol::Framing;

/// `GET /ws` upgraded to a protocol connection
pub fn ws_route(
    store: Arc<ChatStore>,
    trust_proxy_headers: bool,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path(WS_PATH)
        .and(warp::ws())
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and(with_store(store))
        .map(
            move |ws: Ws, headers: HeaderMap, remote: Option<SocketAddr>, store: Arc<ChatStore>| {
                let client_key = extract_client_ip(&headers, remote, trust_proxy_headers)
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                ws.on_upgrade(move |socket| handle_ws_client(socket, store, client_key))
            },
        )
}

// Handle a WebSocket connection
pub async fn handle_ws_client(ws: WebSocket, store: Arc<ChatStore>, client_key: String) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (closed_tx, mut closed_rx) = watch::channel(false);

    // Spawn a task to forward frames from our channel to the WebSocket
    let writer = tokio::spawn(async move {
        while let Some(outgoing) = rx.recv().await {
            match outgoing {
                Outgoing::Frame(bytes) => {
                    if let Err(e) = ws_tx.send(Message::binary(bytes)).await {
                        error!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Outgoing::Close => break,
            }
        }
        let _ = ws_tx.close().await;
        let _ = closed_tx.send(true);
    });

    let mut connection = ProtocolConnection::new(store, client_key, Framing::Binary, tx);
    info!("WebSocket client connected: {}", connection.id());

    loop {
        tokio::select! {
            next = ws_rx.next() => match next {
                Some(Ok(msg)) => {
                    if msg.is_close() {
                        break;
                    }
                    if msg.is_binary() || msg.is_text() {
                        connection.receive(msg.as_bytes()).await;
                    }
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                None => break,
            },
            _ = closed_rx.changed() => break,
        }
    }

    info!("WebSocket client disconnected: {}", connection.id());
    connection.close().await;
    drop(connection);
    let _ = writer.await;
}

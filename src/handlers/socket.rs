//! Raw TCP transport for native clients

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};

use crate::constants::SERVER_TIME_INTERVAL_SECS;
use crate::core::store::ChatStore;
use crate::error::Result;
use crate::handlers::connection::{Outgoing, ProtocolConnection};
use crate::protocol::Framing;

const READ_BUFFER_SIZE: usize = 4096;

/// Bind `addr` and serve socket clients until the process exits
pub async fn run_socket_server(store: Arc<ChatStore>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Socket server listening on {}", addr);
    serve(listener, store).await
}

/// Accept loop over an already bound listener
pub async fn serve(listener: TcpListener, store: Arc<ChatStore>) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept socket client: {}", e);
                continue;
            }
        };
        let store = store.clone();
        tokio::spawn(async move {
            handle_socket_client(stream, peer, store).await;
        });
    }
}

// Handle a raw socket connection
pub async fn handle_socket_client(stream: TcpStream, peer: SocketAddr, store: Arc<ChatStore>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
    }
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (closed_tx, mut closed_rx) = watch::channel(false);

    // Forward queued frames to the socket
    let writer = tokio::spawn(async move {
        while let Some(outgoing) = rx.recv().await {
            match outgoing {
                Outgoing::Frame(bytes) => {
                    if let Err(e) = write_half.write_all(&bytes).await {
                        debug!("Failed to write to {}: {}", peer, e);
                        break;
                    }
                }
                Outgoing::Close => break,
            }
        }
        let _ = write_half.shutdown().await;
        let _ = closed_tx.send(true);
    });

    let mut connection = ProtocolConnection::new(store, peer.ip().to_string(), Framing::Binary, tx);
    info!("Socket client {} connected from {}", connection.id(), peer);

    let period = Duration::from_secs(SERVER_TIME_INTERVAL_SECS);
    let mut clock = interval_at(Instant::now() + period, period);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            read = read_half.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => connection.receive(&buf[..n]).await,
                Err(e) => {
                    error!("Socket error from {}: {}", peer, e);
                    break;
                }
            },
            _ = clock.tick() => connection.send_server_time(),
            _ = closed_rx.changed() => break,
        }
    }

    info!("Socket client {} disconnected", connection.id());
    connection.close().await;
    // Dropping the last sender ends the writer
    drop(connection);
    let _ = writer.await;
}

//! WebSocket transport.
//!
//! Each accepted TCP stream is upgraded to a WebSocket and bridged to a
//! [`run_connection`] task over two channels. One WebSocket message carries
//! one protocol frame. Frames are sent as text messages (they are ASCII
//! type digits followed by JSON); both text and binary messages are accepted
//! inbound.

use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use threadsync_core::Environment;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::{connection::run_connection, context::ServerContext, error::ServerError, storage::Storage};

/// Inbound frames buffered per connection before the reader waits.
const INBOUND_CAPACITY: usize = 64;

/// TCP listener accepting WebSocket clients.
pub struct WsTransport {
    listener: TcpListener,
}

impl WsTransport {
    /// Bind a listener to `address`.
    pub async fn bind(address: &str) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Transport(format!("failed to bind {addr}: {e}")))?;

        tracing::info!("WebSocket transport bound to {}", addr);
        Ok(Self { listener })
    }

    /// Accept the next TCP connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        self.listener
            .accept()
            .await
            .map_err(|e| ServerError::Transport(format!("accept failed: {e}")))
    }

    /// Local address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }
}

fn to_message(frame: Bytes) -> Message {
    match std::str::from_utf8(&frame) {
        Ok(text) => Message::text(text.to_owned()),
        Err(_) => Message::Binary(frame),
    }
}

/// Upgrade `stream` and serve it until either side closes or `shutdown`
/// fires.
pub async fn serve_websocket<S: Storage, E: Environment>(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: ServerContext<S, E>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| ServerError::Transport(format!("handshake with {addr} failed: {e}")))?;
    let (mut sink, mut source) = ws.split();

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let cancel = shutdown.child_token();
    let task =
        tokio::spawn(run_connection(ctx, Some(addr.ip()), inbound_rx, outbound_tx, cancel.clone()));

    let result = loop {
        tokio::select! {
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if inbound_tx.send(Bytes::copy_from_slice(text.as_bytes())).await.is_err() {
                        break Ok(());
                    }
                },
                Some(Ok(Message::Binary(data))) => {
                    if inbound_tx.send(data).await.is_err() {
                        break Ok(());
                    }
                },
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                // Ping/pong are answered by tungstenite.
                Some(Ok(_)) => {},
                Some(Err(e)) => break Err(ServerError::Transport(format!("read from {addr}: {e}"))),
            },
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(to_message(frame)).await {
                        break Err(ServerError::Transport(format!("write to {addr}: {e}")));
                    }
                },
                // The connection task ended (shutdown).
                None => break Ok(()),
            },
        }
    };

    cancel.cancel();
    drop(inbound_tx);
    if let Err(e) = task.await {
        tracing::error!(%addr, error = %e, "connection task panicked");
    }
    if let Err(e) = sink.close().await {
        tracing::debug!(%addr, error = %e, "websocket close failed");
    }

    result
}

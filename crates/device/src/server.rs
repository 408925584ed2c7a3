// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket server implementation.
//!
//! One task per connection. Each task answers its client's frames and
//! forwards live changes from [`DeviceState`] once the client negotiated.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use ml_core::Frame;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::state::{DeviceState, Push, Session};

/// Run the WebSocket server on the given address.
pub async fn run(addr: SocketAddr, state: DeviceState) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on: {}", addr);
    serve(listener, state).await
}

/// Accepts connections on an already bound listener until it fails.
pub async fn serve(listener: TcpListener, state: DeviceState) -> Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, state).await {
                error!("Connection error from {}: {}", peer_addr, e);
            }
        });
    }
}

/// Handle a single WebSocket connection.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: DeviceState,
) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    info!("New WebSocket connection from: {}", peer_addr);

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let mut pushes = state.subscribe();
    let mut session = Session::default();

    loop {
        tokio::select! {
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = match Frame::decode(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("Dropping frame from {}: {}", peer_addr, e);
                                continue;
                            }
                        };
                        debug!("Received '{}' from {}", frame.type_codes, peer_addr);
                        for reply in state.respond(&frame, &mut session).await {
                            ws_sink.send(Message::Text(reply.encode().into())).await?;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} disconnected", peer_addr);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sink.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("Client {} stream ended", peer_addr);
                        break;
                    }
                }
            }

            push = pushes.recv() => {
                match push {
                    Ok(Push::Frame(frame)) if session.is_negotiated() => {
                        if let Err(e) = ws_sink.send(Message::Text(frame.encode().into())).await {
                            warn!("Failed to push to {}: {}", peer_addr, e);
                            break;
                        }
                    }
                    Ok(Push::Frame(_)) => {}
                    Ok(Push::Disconnect) => {
                        info!("Dropping client {}", peer_addr);
                        let _ = ws_sink.close().await;
                        break;
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("Client {} lagged by {} pushes", peer_addr, n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    info!("Connection closed: {}", peer_addr);
    Ok(())
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;

// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the transport module.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use super::*;
use crate::test_helpers::MockTransport;
use futures_util::{SinkExt, StreamExt};
use ml_core::Frame;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn mock_transport_send_recv() {
    let (mut transport, mut remote) = MockTransport::new();
    transport.connect("ws://mock").await.unwrap();
    let mut link = remote.accept().await;
    assert!(transport.is_connected());

    transport.send(Frame::new("CTS").encode()).await.unwrap();
    assert_eq!(link.next().await.unwrap().type_codes, "CTS");

    link.push(Frame::new("CTY"));
    let text = transport.recv().await.unwrap().unwrap();
    assert_eq!(Frame::decode(&text).unwrap().type_codes, "CTY");
}

#[tokio::test]
async fn mock_transport_remote_close() {
    let (mut transport, mut remote) = MockTransport::new();
    transport.connect("ws://mock").await.unwrap();
    let link = remote.accept().await;
    link.close();
    assert!(transport.recv().await.unwrap().is_none());
    assert!(!transport.is_connected());
    assert!(matches!(
        transport.send("x".into()).await,
        Err(TransportError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn mock_transport_refused() {
    let (mut transport, remote) = MockTransport::new();
    remote.refuse_connections(true);
    assert!(matches!(
        transport.connect("ws://mock").await,
        Err(TransportError::ConnectionFailed(_))
    ));
}

#[tokio::test]
async fn websocket_transport_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                ws.send(Message::Ping(Vec::new().into())).await.unwrap();
                ws.send(Message::Text(text)).await.unwrap();
                break;
            }
        }
        let _ = ws.close(None).await;
    });

    let mut transport = WebSocketTransport::new();
    assert!(!transport.is_connected());
    transport.connect(&format!("ws://{}", addr)).await.unwrap();
    transport.send(Frame::new("CP").encode()).await.unwrap();

    let echoed = transport.recv().await.unwrap().unwrap();
    assert_eq!(Frame::decode(&echoed).unwrap().type_codes, "CP");

    assert!(transport.recv().await.unwrap().is_none());
    assert!(!transport.is_connected());
    server.await.unwrap();
}

#[tokio::test]
async fn websocket_transport_connect_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut transport = WebSocketTransport::new();
    let result = transport.connect(&format!("ws://{}", addr)).await;
    assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
}

#[tokio::test]
async fn websocket_transport_send_without_connection() {
    let mut transport = WebSocketTransport::new();
    assert!(matches!(
        transport.send("x".into()).await,
        Err(TransportError::ConnectionClosed)
    ));
}

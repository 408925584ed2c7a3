// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test helpers: an in-memory transport and frame builders.

#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ml_core::{Frame, ModuleDescriptor};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::transport::{Transport, TransportError, TransportFuture};

/// Client side of the in-memory link.
pub struct MockTransport {
    links: mpsc::UnboundedSender<MockLink>,
    refuse: Arc<AtomicBool>,
    stall: Arc<AtomicBool>,
    current: Option<ClientEnd>,
}

struct ClientEnd {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<Option<String>>,
}

/// Test side: accepts each connection the client makes.
pub struct MockRemote {
    links: mpsc::UnboundedReceiver<MockLink>,
    refuse: Arc<AtomicBool>,
    stall: Arc<AtomicBool>,
}

/// One accepted connection, as seen by the test.
pub struct MockLink {
    to_client: mpsc::UnboundedSender<Option<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MockTransport {
    pub fn new() -> (MockTransport, MockRemote) {
        let (tx, rx) = mpsc::unbounded_channel();
        let refuse = Arc::new(AtomicBool::new(false));
        let stall = Arc::new(AtomicBool::new(false));
        (
            MockTransport {
                links: tx,
                refuse: Arc::clone(&refuse),
                stall: Arc::clone(&stall),
                current: None,
            },
            MockRemote {
                links: rx,
                refuse,
                stall,
            },
        )
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, _url: &str) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if self.stall.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionFailed("mock refused".into()));
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            self.links
                .send(MockLink {
                    to_client: in_tx,
                    from_client: out_rx,
                })
                .map_err(|_| TransportError::ConnectionFailed("remote gone".into()))?;
            self.current = Some(ClientEnd {
                outgoing: out_tx,
                incoming: in_rx,
            });
            Ok(())
        })
    }

    fn disconnect(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.current = None;
            Ok(())
        })
    }

    fn send(&mut self, text: String) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let end = self.current.as_ref().ok_or(TransportError::ConnectionClosed)?;
            end.outgoing
                .send(text)
                .map_err(|_| TransportError::SendFailed("remote closed".into()))
        })
    }

    fn recv(&mut self) -> TransportFuture<'_, Option<String>> {
        Box::pin(async move {
            let end = self.current.as_mut().ok_or(TransportError::ConnectionClosed)?;
            match end.incoming.recv().await {
                Some(Some(text)) => Ok(Some(text)),
                Some(None) | None => {
                    self.current = None;
                    Ok(None)
                }
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.current.is_some()
    }
}

impl MockRemote {
    /// Waits for the client's next connection.
    pub async fn accept(&mut self) -> MockLink {
        self.links.recv().await.expect("client transport dropped")
    }

    /// Makes subsequent connection attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Makes subsequent connection attempts hang until they time out.
    pub fn stall_connections(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }
}

impl MockLink {
    /// Sends a frame to the client.
    pub fn push(&self, frame: Frame) {
        let _ = self.to_client.send(Some(frame.encode()));
    }

    /// Sends raw text to the client.
    pub fn push_raw(&self, text: &str) {
        let _ = self.to_client.send(Some(text.to_string()));
    }

    /// Next frame from the client, `None` once the client hung up.
    pub async fn next(&mut self) -> Option<Frame> {
        let text = self.from_client.recv().await?;
        Some(Frame::decode(&text).expect("client sent a malformed frame"))
    }

    /// Skips frames until one with exactly these type codes arrives.
    pub async fn expect(&mut self, codes: &str) -> Frame {
        loop {
            let frame = self
                .next()
                .await
                .unwrap_or_else(|| panic!("link closed while waiting for {codes}"));
            if frame.type_codes == codes {
                return frame;
            }
        }
    }

    /// Closes the link from the device side.
    pub fn close(&self) {
        let _ = self.to_client.send(None);
    }

    /// Answers negotiation and technical info, returning once `SS` or `SN` arrives.
    pub async fn handshake(&mut self, buff_size: usize) -> Frame {
        self.expect("CTS").await;
        self.push(Frame::new("CTY"));
        self.expect("CI").await;
        self.push(Frame::with_payload(
            "CI",
            json!({"buffSize": buff_size, "version": "1.0"}),
        ));
        loop {
            let frame = self.next().await.expect("link closed during handshake");
            if frame.type_codes == "SS" || frame.type_codes == "SN" {
                return frame;
            }
        }
    }

    /// Streams a full enumeration: header, module objects, done.
    pub fn enumerate(&self, num: u64, modules: &[Value]) {
        self.push(sync_header(modules.len() as u32, num));
        for module in modules {
            self.push(Frame::with_payload("SO", module.clone()));
        }
        self.push(Frame::new("SD"));
    }
}

pub fn sync_header(amount: u32, num: u64) -> Frame {
    Frame::with_payload(
        "SS",
        json!({"amount": amount, "num": num, "name": "Test device", "time": 0, "timeOffset": 0}),
    )
}

/// A root module object as the device enumerates it.
pub fn root_object() -> Value {
    serde_json::to_value(ModuleDescriptor::root()).unwrap()
}

/// A readable value module under `pid`.
pub fn value_object(uid: u32, pid: u32, sid: u32) -> Value {
    json!({
        "uid": uid,
        "des": "VABAS",
        "pid": pid,
        "sid": sid,
        "name": format!("Value {uid}"),
        "access": 1,
        "va": 1,
        "user": 0,
        "user2": 0,
    })
}

pub fn object_with_designator(uid: u32, pid: u32, des: &str) -> Value {
    json!({"uid": uid, "des": des, "pid": pid, "sid": uid, "name": des})
}

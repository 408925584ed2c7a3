// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! modlink - a client engine that mirrors a device's module registry.
//!
//! The engine keeps one WebSocket to the device, negotiates the session,
//! enumerates every module into a local registry and keeps that registry
//! current across link drops. Value, status and instrument readings are
//! polled in bounded batches for whichever modules have listeners.
//!
//! # Main Components
//!
//! - [`Engine`] - cloneable handle to the running engine task
//! - [`ModuleManager`] - the protocol core, free of IO and clocks
//! - [`EngineConfig`] - per-engine configuration, loadable from TOML
//! - [`EngineEvent`] - everything observers can see happen
//! - [`Error`] - error type for all operations
//!
//! ```rust,ignore
//! use modlink::{Engine, EngineConfig, PollChannel};
//!
//! let engine = Engine::spawn(EngineConfig::new("192.168.1.20"))?;
//! engine.wait_synced().await?;
//! engine.subscribe(PollChannel::Value, 12).await?;
//! let mut events = engine.events();
//! while let Ok(event) = events.recv().await {
//!     println!("{}", event);
//! }
//! ```

pub mod cli;
pub mod config;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod events;
pub mod initial_data;
pub mod link;
pub mod manager;
pub mod polling;
pub mod registry;
pub mod session;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use config::EngineConfig;
pub use engine::{Engine, FrameSubscription, MessagePromise};
pub use error::{Error, Result};
pub use events::{EngineEvent, Notice, Operation};
pub use manager::{EngineStatus, ModuleAction, ModuleManager};
pub use polling::PollChannel;
pub use registry::{Module, Reading};
pub use session::AccessLevel;
pub use transport::{Transport, TransportError, WebSocketTransport};

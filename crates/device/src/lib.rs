// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! ml-device: a simulated device speaking the modlink wire protocol.
//!
//! The device holds a module table, a save number and per-module readings,
//! and answers clients over WebSocket the way a real controller would.
//! End-to-end tests drive it from the client side and mutate it through
//! [`DeviceState`] to force live changes and resyncs.

pub mod error;
pub mod server;
pub mod state;

pub use error::{Error, Result};
pub use state::{Device, DeviceState, Session};

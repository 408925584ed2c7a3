// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! ml-core: Shared wire vocabulary for the modlink engine
//!
//! This crate provides the frame codec, the protocol type codes and payloads,
//! and the closed module kind table used by both the modlink client and the
//! ml-device simulator.

pub mod error;
pub mod frame;
pub mod module;
pub mod protocol;

pub use error::{Error, Result};
pub use frame::Frame;
pub use module::{Family, ModuleDescriptor, ModuleKind, ROOT_UID};
pub use protocol::{codes, ConnectionType, Negotiation};

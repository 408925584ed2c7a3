// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

use thiserror::Error;

use crate::registry::RegistryError;
use crate::transport::TransportError;

/// All possible errors surfaced by the modlink engine.
///
/// Transport failures never reach callers of the engine handle; they only
/// drive the reconnect path. They appear here for the transport layer itself.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] ml_core::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("not connected to device")]
    NotConnected,

    #[error("no response to '{codes}' before timeout")]
    RequestTimeout { codes: String },

    #[error("command {num} to module {uid} timed out")]
    CommandTimeout { uid: u32, num: u32 },

    #[error("message {id} was not answered before timeout")]
    PromiseTimeout { id: u32 },

    #[error("module not found: {0}")]
    ModuleNotFound(u32),

    #[error("module {0} has no readable value")]
    NotPollable(u32),

    #[error("access insufficient for module {0}")]
    AccessInsufficient(u32),

    #[error("login rejected by device")]
    LoginRejected,

    #[error("initial data decoder already registered for '{0}'")]
    DecoderExists(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("config parse error: {0}\n  hint: check the TOML syntax of the config file")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("device did not finish syncing within {0:?}")]
    SyncTimeout(std::time::Duration),

    #[error("engine stopped")]
    EngineStopped,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized Result type for modlink operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

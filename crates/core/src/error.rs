// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for ml-core operations.

use thiserror::Error;

/// All possible errors raised while encoding, decoding or interpreting frames.
#[derive(Debug, Error)]
pub enum Error {
    #[error("frame does not start with a group separator")]
    MissingMarker,

    #[error("frame carries no type codes")]
    EmptyTypeCodes,

    #[error("frame too large: {len} bytes exceeds limit of {limit}\n  hint: the device negotiated a smaller buffer size")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("malformed payload for '{codes}': {reason}")]
    MalformedPayload { codes: String, reason: String },

    #[error("frame '{0}' has no payload")]
    MissingPayload(String),

    #[error("unknown designator: '{0}'")]
    UnknownDesignator(String),

    #[error("invalid connection type: '{0}'\n  hint: valid types are: settings, fixed, fixed-simulated")]
    InvalidConnectionType(String),

    #[error("invalid IPv4 address: '{0}'")]
    InvalidAddress(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized Result type for ml-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

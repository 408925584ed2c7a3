// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Wire frame codec.
//!
//! A frame is a single text message:
//!
//! ```text
//! \u{1D} <type codes> [ \u{1F} <json payload> ]
//! ```
//!
//! Type codes are a short ASCII routing key read one character at a time,
//! so `"SOE"` is routed under `S`, then `SO`, then `SOE`.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

/// Marks the start of a frame.
pub const GROUP_SEPARATOR: char = '\u{1D}';

/// Separates type codes from the JSON payload.
pub const UNIT_SEPARATOR: char = '\u{1F}';

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Routing key, e.g. `"SO"` or `"CTY"`.
    pub type_codes: String,
    /// Optional JSON payload.
    pub payload: Option<Value>,
}

impl Frame {
    /// Creates a frame without a payload.
    pub fn new(type_codes: impl Into<String>) -> Self {
        Frame {
            type_codes: type_codes.into(),
            payload: None,
        }
    }

    /// Creates a frame carrying a JSON payload.
    pub fn with_payload(type_codes: impl Into<String>, payload: Value) -> Self {
        Frame {
            type_codes: type_codes.into(),
            payload: Some(payload),
        }
    }

    /// Encodes the frame into its wire text.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.type_codes.len() + 1);
        out.push(GROUP_SEPARATOR);
        out.push_str(&self.type_codes);
        if let Some(payload) = &self.payload {
            out.push(UNIT_SEPARATOR);
            out.push_str(&payload.to_string());
        }
        out
    }

    /// Encodes the frame, rejecting it if the wire text exceeds `limit` bytes.
    pub fn encode_within(&self, limit: usize) -> Result<String> {
        let text = self.encode();
        if text.len() > limit {
            return Err(Error::FrameTooLarge {
                len: text.len(),
                limit,
            });
        }
        Ok(text)
    }

    /// Decodes wire text into a frame.
    ///
    /// A frame without a unit separator has no payload.
    pub fn decode(text: &str) -> Result<Frame> {
        let body = text
            .strip_prefix(GROUP_SEPARATOR)
            .ok_or(Error::MissingMarker)?;
        let (codes, payload) = match body.split_once(UNIT_SEPARATOR) {
            Some((codes, json)) => (codes, Some(serde_json::from_str(json)?)),
            None => (body, None),
        };
        if codes.is_empty() {
            return Err(Error::EmptyTypeCodes);
        }
        Ok(Frame {
            type_codes: codes.to_string(),
            payload,
        })
    }

    /// Returns the type code at `index`, if present.
    pub fn code(&self, index: usize) -> Option<char> {
        self.type_codes.chars().nth(index)
    }

    /// Returns true if the type codes start with `prefix`.
    pub fn matches(&self, prefix: &str) -> bool {
        self.type_codes.starts_with(prefix)
    }

    /// Deserializes the payload into `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| Error::MissingPayload(self.type_codes.clone()))?;
        T::deserialize(payload).map_err(|e| Error::MalformedPayload {
            codes: self.type_codes.clone(),
            reason: e.to_string(),
        })
    }

    /// Returns the payload as a JSON object, if it is one.
    pub fn object(&self) -> Option<&serde_json::Map<String, Value>> {
        self.payload.as_ref().and_then(Value::as_object)
    }
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;

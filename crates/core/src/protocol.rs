// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Protocol vocabulary shared by the client engine and the simulated device.
//!
//! Type codes are grouped by their first character:
//! - `C`: connection (negotiation, technical info, ping, reload)
//! - `S`: sync, module objects, values, status, configs, initial data
//! - `I`: instrument values and commands
//! - `a`: access (login, logout, denial, access changes)
//! - `M`: module commands

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Type code constants.
pub mod codes {
    pub const CONNECTION_TYPE: &str = "CT";
    pub const TECHNICAL_INFO: &str = "CI";
    pub const PING: &str = "CP";
    pub const PONG: &str = "Cp";
    pub const RELOAD: &str = "Cr";

    pub const SYNC_START: &str = "SS";
    pub const SYNC_SAME: &str = "SN";
    pub const SYNC_TIME: &str = "ST";
    pub const SYNC_OBJECT: &str = "SO";
    pub const SYNC_DONE: &str = "SD";
    pub const SYNC_ACK: &str = "Sd";
    pub const SYNC_REMOVE: &str = "SR";

    pub const VALUES: &str = "SV";
    pub const STATUS: &str = "Ss";
    pub const SET_VALUE: &str = "SP";
    pub const CONFIGS: &str = "SM";
    pub const SAVE_CONFIGS: &str = "SC";
    pub const ADD_MODULE: &str = "SA";
    pub const DELETE_MODULE: &str = "SD";
    pub const RENAME: &str = "oR";
    pub const INITIAL_DATA: &str = "SI";

    pub const INSTRUMENT: &str = "IV";
    pub const INSTRUMENT_COMMAND: &str = "IC";

    pub const LOGIN: &str = "aA";
    pub const LOGOUT: &str = "aL";
    pub const ACCESS_DENIED: &str = "aD";
    pub const ACCESS_CHANGE: &str = "aC";

    pub const COMMAND: &str = "M";
}

/// How the client identifies itself during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
    /// Settings-derived client.
    #[default]
    Settings,
    /// Fixed-identity client.
    Fixed,
    /// Fixed client reporting a simulated address.
    FixedSimulated,
}

impl ConnectionType {
    /// The single wire character following `CT`.
    pub fn code(self) -> char {
        match self {
            ConnectionType::Settings => 'S',
            ConnectionType::Fixed => 'F',
            ConnectionType::FixedSimulated => 'f',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'S' => Some(ConnectionType::Settings),
            'F' => Some(ConnectionType::Fixed),
            'f' => Some(ConnectionType::FixedSimulated),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Settings => "settings",
            ConnectionType::Fixed => "fixed",
            ConnectionType::FixedSimulated => "fixed-simulated",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "settings" | "S" => Ok(ConnectionType::Settings),
            "fixed" | "F" => Ok(ConnectionType::Fixed),
            "fixed-simulated" | "f" => Ok(ConnectionType::FixedSimulated),
            _ => Err(Error::InvalidConnectionType(s.to_string())),
        }
    }
}

/// Answer to a connection type negotiation, the third code of `CT?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Accepted,
    TypeNotSupported,
    TooManyUsers,
    AlreadyConnected,
    NotRegistered,
    WrongVariables,
    Unknown(Option<char>),
}

impl Negotiation {
    pub fn from_code(code: Option<char>) -> Self {
        match code {
            Some('Y') => Negotiation::Accepted,
            Some('T') => Negotiation::TypeNotSupported,
            Some('N') => Negotiation::TooManyUsers,
            Some('A') => Negotiation::AlreadyConnected,
            Some('n') => Negotiation::NotRegistered,
            Some('e') => Negotiation::WrongVariables,
            other => Negotiation::Unknown(other),
        }
    }

    pub fn code(self) -> Option<char> {
        match self {
            Negotiation::Accepted => Some('Y'),
            Negotiation::TypeNotSupported => Some('T'),
            Negotiation::TooManyUsers => Some('N'),
            Negotiation::AlreadyConnected => Some('A'),
            Negotiation::NotRegistered => Some('n'),
            Negotiation::WrongVariables => Some('e'),
            Negotiation::Unknown(code) => code,
        }
    }
}

/// Payload of the fixed-simulated negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedAddress {
    pub ip: u32,
}

/// Packs a dotted IPv4 address big-endian into a u32.
pub fn pack_ipv4(addr: &str) -> Result<u32> {
    addr.parse::<Ipv4Addr>()
        .map(u32::from)
        .map_err(|_| Error::InvalidAddress(addr.to_string()))
}

/// Inverse of [`pack_ipv4`].
pub fn unpack_ipv4(packed: u32) -> Ipv4Addr {
    Ipv4Addr::from(packed)
}

/// Technical info sent after a successful negotiation (`CI`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnicalInfo {
    #[serde(rename = "buffSize")]
    pub buff_size: usize,
    #[serde(default)]
    pub version: String,
}

/// Full sync header (`SS`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHeader {
    pub amount: u32,
    pub num: u64,
    #[serde(default)]
    pub name: String,
    /// Device clock in epoch seconds.
    #[serde(default)]
    pub time: Option<f64>,
    #[serde(rename = "timeOffset", default)]
    pub time_offset: Option<i64>,
}

/// Same-as-before probe answer (`SN`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SameProbe {
    pub num: u64,
    pub amount: u32,
}

/// Time header (`ST`). Both fields are optional.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeHeader {
    #[serde(default)]
    pub adjust: Option<f64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

/// Successful login answer (`aA`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user: u32,
    #[serde(
        rename = "accessToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub access_token: Option<String>,
}

/// Login request payload (`aA`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoginRequest {
    Password { password: String, username: String },
    Token {
        #[serde(rename = "accessToken")]
        access_token: String,
    },
}

/// Result block carried by `MR` and `IV?` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerResult {
    #[serde(default)]
    pub code: Value,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub success: bool,
}

impl ServerResult {
    /// Extracts the `result` block of a payload.
    pub fn from_payload(payload: Option<&Value>) -> Option<ServerResult> {
        let result = payload?.get("result")?;
        ServerResult::deserialize(result).ok()
    }
}

/// A module command request or response (`M`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: u32,
    pub num: u32,
    #[serde(default)]
    pub data: Value,
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;

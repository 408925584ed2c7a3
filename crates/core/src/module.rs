// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Module descriptors and the closed table of module kinds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// UID reserved for the root module.
pub const ROOT_UID: u32 = 1;

/// Broad grouping of module kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    General,
    Automation,
    Alarm,
    Control,
    System,
    Wago,
    IoSystem,
}

macro_rules! module_kinds {
    ($($variant:ident => $family:ident),+ $(,)?) => {
        /// Every module kind the engine can instantiate.
        #[allow(clippy::upper_case_acronyms)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ModuleKind {
            $($variant),+
        }

        impl ModuleKind {
            /// All kinds, in table order.
            pub const ALL: &'static [ModuleKind] = &[$(ModuleKind::$variant),+];

            /// The five-letter wire designator.
            pub fn designator(self) -> &'static str {
                match self {
                    $(ModuleKind::$variant => stringify!($variant)),+
                }
            }

            pub fn family(self) -> Family {
                match self {
                    $(ModuleKind::$variant => Family::$family),+
                }
            }

            /// Looks up a kind by designator.
            pub fn from_designator(des: &str) -> Option<ModuleKind> {
                match des {
                    $(stringify!($variant) => Some(ModuleKind::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

module_kinds! {
    VASEQ => General,
    DRIVE => Automation,
    JUNCT => Automation,
    HCOUN => General,
    HCMAN => General,
    CODEL => General,
    VABAS => General,
    ASALL => Alarm,
    ASREG => Alarm,
    ASWUN => Alarm,
    ASALA => Alarm,
    ASBUN => Alarm,
    W8217 => Wago,
    WGDIO => Wago,
    WGDOU => Wago,
    WGDIN => Wago,
    WGAOU => Wago,
    WGAIN => Wago,
    WC626 => Wago,
    WC658 => Wago,
    J19PG => Wago,
    W658O => Wago,
    W658C => Wago,
    W658I => Wago,
    J19SA => Wago,
    W658M => Wago,
    W658J => Wago,
    WC652 => Wago,
    WLOCA => Wago,
    CTELE => Control,
    CTTVC => Control,
    CTALC => Control,
    CTACT => Control,
    CRLDP => Control,
    MODUS => General,
    PLCIF => System,
    DTSRV => System,
    MODMA => System,
    GROUP => System,
    USRMG => System,
    USERU => System,
    DTSCF => System,
    LICES => System,
    DTSRC => System,
    NMEAG => IoSystem,
    NMGGA => IoSystem,
    NMGLL => IoSystem,
    NMGMC => IoSystem,
    NMHDG => IoSystem,
    NMPPE => IoSystem,
    NMWWR => IoSystem,
    NMEAS => IoSystem,
    NMTAK => IoSystem,
    NMSEG => IoSystem,
    FILTE => IoSystem,
    MOVER => IoSystem,
    LICON => IoSystem,
    BITAC => IoSystem,
    TABCO => IoSystem,
    MBNET => IoSystem,
    MBIOV => IoSystem,
    MBTCP => IoSystem,
    MBSER => IoSystem,
    USVAL => IoSystem,
    USVRE => IoSystem,
    CONOD => IoSystem,
    COPDO => IoSystem,
    IOSYS => IoSystem,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.designator())
    }
}

impl FromStr for ModuleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ModuleKind::from_designator(s).ok_or_else(|| Error::UnknownDesignator(s.to_string()))
    }
}

/// The fields of a module object (`SO`) payload.
///
/// Fields the engine does not interpret are kept in `pre_configs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub uid: u32,
    #[serde(rename = "des")]
    pub designator: String,
    /// Parent UID; 0 for the root.
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub sid: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub access: u32,
    /// Value access; 0 means the module has no readable value.
    #[serde(default)]
    pub va: u32,
    #[serde(default)]
    pub user: u32,
    #[serde(default)]
    pub user2: u32,
    /// Save number stamped by the device on live changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num: Option<u64>,
    #[serde(flatten)]
    pub pre_configs: Map<String, Value>,
}

impl ModuleDescriptor {
    pub fn new(uid: u32, designator: impl Into<String>) -> Self {
        ModuleDescriptor {
            uid,
            designator: designator.into(),
            pid: 0,
            sid: 0,
            name: String::new(),
            access: 0,
            va: 0,
            user: 0,
            user2: 0,
            num: None,
            pre_configs: Map::new(),
        }
    }

    /// The descriptor the root module is seeded with before any traffic.
    pub fn root() -> Self {
        ModuleDescriptor {
            sid: 1,
            access: 65488,
            user: 2,
            user2: 2,
            ..ModuleDescriptor::new(ROOT_UID, ModuleKind::MODMA.designator())
        }
    }

    pub fn with_parent(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_sid(mut self, sid: u32) -> Self {
        self.sid = sid;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_value_access(mut self, va: u32) -> Self {
        self.va = va;
        self
    }

    /// Resolves the designator against the kind table.
    pub fn kind(&self) -> Result<ModuleKind> {
        self.designator.parse()
    }
}

#[cfg(test)]
#[path = "module_tests.rs"]
mod tests;

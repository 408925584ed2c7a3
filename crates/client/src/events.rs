// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Engine events and user-facing notices.

use std::fmt;

use ml_core::protocol::ServerResult;
use ml_core::{ModuleKind, Negotiation};
use tokio::sync::broadcast;

use crate::registry::Module;
use crate::session::AccessLevel;

/// Everything an observer of the engine can see happen.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The socket opened; negotiation is under way.
    Opened,
    /// Negotiation finished and technical info arrived.
    Connected { version: String },
    /// The link went from connected to disconnected.
    Closed,
    SyncProgress { amount: u32, total: u32 },
    /// The first full sync finished.
    Synced,
    /// A sync after a reconnect finished.
    Resynced,
    ModuleAdded { uid: u32, kind: ModuleKind },
    ModuleUpdated { uid: u32 },
    /// Carries the module as it was, plus its children at removal time.
    ModuleRemoved { module: Module, children: Vec<u32> },
    ConfigsUpdated { uid: u32 },
    ValuesUpdated(Vec<u32>),
    StatusUpdated(Vec<u32>),
    InstrumentUpdated(Vec<u32>),
    AccessChanged {
        user: u32,
        old_user: u32,
        level: AccessLevel,
    },
    /// A password login returned a token worth persisting.
    TokenSaved(String),
    Notice(Notice),
    /// The device asked clients to reload.
    ReloadRequested,
    /// The engine was torn down.
    Removed,
}

/// Operation named in an access-insufficient notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Remove,
    Rename,
    AddTo,
    Save,
    GetConfigs,
    RunCommand,
    ChangeAccess,
}

impl Operation {
    fn verb(self) -> &'static str {
        match self {
            Operation::Remove => "remove module",
            Operation::Rename => "rename module",
            Operation::AddTo => "add to module",
            Operation::Save => "save module",
            Operation::GetConfigs => "get module configs",
            Operation::RunCommand => "run command",
            Operation::ChangeAccess => "change module access",
        }
    }
}

/// A message meant for the person operating the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// The device refused the connection type negotiation.
    Refused(Negotiation),
    ModuleNotFound,
    AccessInsufficient(Operation),
    NotRenameable,
    NoDataFound,
    AccessDenied,
    /// A failed result reported by the device.
    Failed(ServerResult),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Refused(Negotiation::TypeNotSupported) => {
                f.write_str("connection type not supported")
            }
            Notice::Refused(Negotiation::TooManyUsers) => f.write_str("too many users connected"),
            Notice::Refused(Negotiation::AlreadyConnected) => {
                f.write_str("same client already connected")
            }
            Notice::Refused(Negotiation::NotRegistered) => {
                f.write_str("fixed client not registered in system")
            }
            Notice::Refused(Negotiation::WrongVariables) => f.write_str("sent variables wrong"),
            Notice::Refused(other) => write!(f, "connection refused ({:?})", other.code()),
            Notice::ModuleNotFound => f.write_str("module not found"),
            Notice::AccessInsufficient(op) => write!(f, "access insufficient to {}", op.verb()),
            Notice::NotRenameable => f.write_str("module is not renameable"),
            Notice::NoDataFound => f.write_str("no data found"),
            Notice::AccessDenied => f.write_str("access was denied"),
            Notice::Failed(result) => write!(f, "{} {}", result.code, result.reason),
        }
    }
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::Opened => f.write_str("opened"),
            EngineEvent::Connected { version } => write!(f, "connected (version {})", version),
            EngineEvent::Closed => f.write_str("closed"),
            EngineEvent::SyncProgress { amount, total } => {
                write!(f, "sync progress {}/{}", amount, total)
            }
            EngineEvent::Synced => f.write_str("synced"),
            EngineEvent::Resynced => f.write_str("resynced"),
            EngineEvent::ModuleAdded { uid, kind } => write!(f, "module added {} ({})", uid, kind),
            EngineEvent::ModuleUpdated { uid } => write!(f, "module updated {}", uid),
            EngineEvent::ModuleRemoved { module, .. } => {
                write!(f, "module removed {} ({})", module.uid(), module.kind())
            }
            EngineEvent::ConfigsUpdated { uid } => write!(f, "configs updated {}", uid),
            EngineEvent::ValuesUpdated(uids) => write!(f, "values {:?}", uids),
            EngineEvent::StatusUpdated(uids) => write!(f, "status {:?}", uids),
            EngineEvent::InstrumentUpdated(uids) => write!(f, "instrument {:?}", uids),
            EngineEvent::AccessChanged { user, old_user, .. } => {
                write!(f, "access changed {} -> {}", old_user, user)
            }
            EngineEvent::TokenSaved(_) => f.write_str("access token saved"),
            EngineEvent::Notice(notice) => write!(f, "notice: {}", notice),
            EngineEvent::ReloadRequested => f.write_str("reload requested"),
            EngineEvent::Removed => f.write_str("removed"),
        }
    }
}

/// Fan-out of engine events to any number of observers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Publishes an event; having no observers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(1024)
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;

// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Local mirror of the device's module registry.
//!
//! Modules are stored by UID. Parents are referenced by UID only; children
//! come from a reverse index rebuilt by [`Registry::link_all`].

use std::collections::HashMap;
use std::fmt;

use ml_core::{ModuleDescriptor, ModuleKind, ROOT_UID};
use serde_json::{Map, Value};
use thiserror::Error;

/// Reasons a single module update is dropped.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("module uid missing from config package")]
    MissingUid,

    #[error("designator must be passed")]
    MissingDesignator,

    #[error("designator not registered: {0}")]
    UnknownDesignator(String),

    #[error("malformed module object: {0}")]
    Malformed(String),

    #[error("module {0} already exists")]
    DuplicateUid(u32),

    #[error("module {0} not found")]
    NotFound(u32),

    #[error("module {uid} changed designator from {from} to {to}")]
    DesignatorChanged { uid: u32, from: String, to: String },
}

/// Latest value reading of a module.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Reading {
    /// Nothing received yet.
    #[default]
    Unknown,
    Live(Value),
    /// The device reported a reason instead of a value.
    Fault(String),
    /// The link is down.
    Offline,
}

impl Reading {
    /// Interprets a value pushed by the device; strings are fault reasons.
    pub fn from_wire(value: Value) -> Reading {
        match value {
            Value::String(reason) => Reading::Fault(reason),
            other => Reading::Live(other),
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Unknown => f.write_str("-"),
            Reading::Live(value) => write!(f, "{}", value),
            Reading::Fault(reason) => write!(f, "fault ({})", reason),
            Reading::Offline => f.write_str("offline"),
        }
    }
}

/// One mirrored module.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    kind: ModuleKind,
    descriptor: ModuleDescriptor,
    configs: Option<Value>,
    value: Reading,
    status: Option<Value>,
    instrument: Option<Value>,
    incarnation: u64,
}

impl Module {
    pub fn uid(&self) -> u32 {
        self.descriptor.uid
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    /// Parent UID, `None` for the root and for orphans announced with pid 0.
    pub fn parent(&self) -> Option<u32> {
        match self.descriptor.pid {
            0 => None,
            pid if pid == self.uid() => None,
            pid => Some(pid),
        }
    }

    pub fn sid(&self) -> u32 {
        self.descriptor.sid
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn access(&self) -> u32 {
        self.descriptor.access
    }

    pub fn users(&self) -> (u32, u32) {
        (self.descriptor.user, self.descriptor.user2)
    }

    /// True if the module has a value that can be polled.
    pub fn has_value(&self) -> bool {
        self.descriptor.va > 0
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn pre_configs(&self) -> &Map<String, Value> {
        &self.descriptor.pre_configs
    }

    /// Configs loaded on request, `None` until the device sent them.
    pub fn configs(&self) -> Option<&Value> {
        self.configs.as_ref()
    }

    pub fn value(&self) -> &Reading {
        &self.value
    }

    pub fn status(&self) -> Option<&Value> {
        self.status.as_ref()
    }

    pub fn instrument(&self) -> Option<&Value> {
        self.instrument.as_ref()
    }

    /// Distinguishes an updated module from a recreated one at the same UID.
    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }
}

/// Parses a module object payload.
pub fn parse_descriptor(payload: Option<&Value>) -> Result<ModuleDescriptor, RegistryError> {
    let object = payload
        .and_then(Value::as_object)
        .ok_or_else(|| RegistryError::Malformed("payload is not an object".to_string()))?;
    if !object.get("uid").is_some_and(Value::is_u64) {
        return Err(RegistryError::MissingUid);
    }
    if !object.get("des").is_some_and(Value::is_string) {
        return Err(RegistryError::MissingDesignator);
    }
    serde_json::from_value(Value::Object(object.clone()))
        .map_err(|e| RegistryError::Malformed(e.to_string()))
}

#[derive(Debug, Default)]
pub struct Registry {
    modules: HashMap<u32, Module>,
    children: HashMap<u32, Vec<u32>>,
    next_incarnation: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a module. Fails without side effects on an unknown designator
    /// or an occupied UID.
    pub fn add(&mut self, descriptor: ModuleDescriptor) -> Result<&Module, RegistryError> {
        if descriptor.designator.is_empty() {
            return Err(RegistryError::MissingDesignator);
        }
        let kind = ModuleKind::from_designator(&descriptor.designator)
            .ok_or_else(|| RegistryError::UnknownDesignator(descriptor.designator.clone()))?;
        let uid = descriptor.uid;
        if self.modules.contains_key(&uid) {
            return Err(RegistryError::DuplicateUid(uid));
        }
        self.next_incarnation += 1;
        let module = Module {
            kind,
            descriptor,
            configs: None,
            value: Reading::Unknown,
            status: None,
            instrument: None,
            incarnation: self.next_incarnation,
        };
        Ok(self.modules.entry(uid).or_insert(module))
    }

    /// Updates a module in place. The designator must not change.
    pub fn update(&mut self, descriptor: ModuleDescriptor) -> Result<(), RegistryError> {
        let uid = descriptor.uid;
        let module = self
            .modules
            .get_mut(&uid)
            .ok_or(RegistryError::NotFound(uid))?;
        if module.descriptor.designator != descriptor.designator {
            return Err(RegistryError::DesignatorChanged {
                uid,
                from: module.descriptor.designator.clone(),
                to: descriptor.designator,
            });
        }
        module.descriptor = descriptor;
        Ok(())
    }

    /// Removes a module. The root cannot be removed.
    pub fn remove(&mut self, uid: u32) -> Option<Module> {
        if uid == ROOT_UID {
            return None;
        }
        let module = self.modules.remove(&uid)?;
        if let Some(parent) = module.parent() {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|c| *c != uid);
            }
        }
        self.children.remove(&uid);
        Some(module)
    }

    pub fn get(&self, uid: u32) -> Option<&Module> {
        self.modules.get(&uid)
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.modules.contains_key(&uid)
    }

    pub fn root(&self) -> Option<&Module> {
        self.get(ROOT_UID)
    }

    /// Number of live modules, root included.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// All modules ordered by UID.
    pub fn modules(&self) -> Vec<&Module> {
        let mut all: Vec<&Module> = self.modules.values().collect();
        all.sort_by_key(|m| m.uid());
        all
    }

    pub fn uids(&self) -> Vec<u32> {
        let mut uids: Vec<u32> = self.modules.keys().copied().collect();
        uids.sort_unstable();
        uids
    }

    /// Rebuilds the children index over the whole registry.
    pub fn link_all(&mut self) {
        let mut children: HashMap<u32, Vec<(u32, u32)>> = HashMap::new();
        for module in self.modules.values() {
            if let Some(parent) = module.parent() {
                children
                    .entry(parent)
                    .or_default()
                    .push((module.sid(), module.uid()));
            }
        }
        self.children = children
            .into_iter()
            .map(|(parent, mut kids)| {
                kids.sort_unstable();
                (parent, kids.into_iter().map(|(_, uid)| uid).collect())
            })
            .collect();
    }

    /// Children of `uid` ordered by sid, as of the last link.
    pub fn children(&self, uid: u32) -> Vec<u32> {
        self.children.get(&uid).cloned().unwrap_or_default()
    }

    /// UIDs from the root down to `uid`, empty if `uid` is unknown.
    pub fn path(&self, uid: u32) -> Vec<u32> {
        let mut path = Vec::new();
        let mut current = self.get(uid);
        while let Some(module) = current {
            if path.len() > self.modules.len() {
                break;
            }
            path.push(module.uid());
            current = module.parent().and_then(|p| self.get(p));
        }
        path.reverse();
        path
    }

    pub fn set_value(&mut self, uid: u32, reading: Reading) -> bool {
        self.with_module(uid, |m| m.value = reading)
    }

    pub fn set_status(&mut self, uid: u32, status: Value) -> bool {
        self.with_module(uid, |m| m.status = Some(status))
    }

    pub fn set_instrument(&mut self, uid: u32, instrument: Value) -> bool {
        self.with_module(uid, |m| m.instrument = Some(instrument))
    }

    pub fn set_configs(&mut self, uid: u32, configs: Value) -> bool {
        self.with_module(uid, |m| m.configs = Some(configs))
    }

    /// Marks every value offline and clears every instrument reading.
    pub fn mark_offline(&mut self) {
        for module in self.modules.values_mut() {
            module.value = Reading::Offline;
            module.instrument = None;
        }
    }

    fn with_module(&mut self, uid: u32, f: impl FnOnce(&mut Module)) -> bool {
        match self.modules.get_mut(&uid) {
            Some(module) => {
                f(module);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;

// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Per-designator cache of initial data pushed by the device (`SI`).

use std::collections::HashMap;
use std::fmt;

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Merges one `SI` payload into the stored data for its designator.
pub type Decoder = Box<dyn Fn(&mut Map<String, Value>, Map<String, Value>) + Send + Sync>;

pub struct InitialDataStore {
    decoders: HashMap<String, Decoder>,
    storage: HashMap<String, Map<String, Value>>,
}

impl fmt::Debug for InitialDataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut designators: Vec<&String> = self.decoders.keys().collect();
        designators.sort();
        f.debug_struct("InitialDataStore")
            .field("decoders", &designators)
            .field("storage", &self.storage)
            .finish()
    }
}

impl Default for InitialDataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InitialDataStore {
    /// Store with the built-in decoders registered.
    pub fn new() -> Self {
        let mut store = Self::empty();
        store.decoders.insert("WLOCA".to_string(), Box::new(merge_cards));
        store
    }

    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
            storage: HashMap::new(),
        }
    }

    /// Registers a decoder. Each designator takes one decoder.
    pub fn register(&mut self, designator: &str, decoder: Decoder) -> Result<()> {
        if self.decoders.contains_key(designator) {
            return Err(Error::DecoderExists(designator.to_string()));
        }
        self.decoders.insert(designator.to_string(), decoder);
        Ok(())
    }

    pub fn has_decoder(&self, designator: &str) -> bool {
        self.decoders.contains_key(designator)
    }

    /// Feeds an `SI` payload to its decoder. Returns the designator when
    /// something was decoded.
    pub fn ingest(&mut self, payload: Option<&Value>) -> Option<String> {
        let mut data = payload?.as_object()?.clone();
        let designator = match data.remove("des") {
            Some(Value::String(des)) => des,
            _ => return None,
        };
        let decoder = self.decoders.get(&designator)?;
        decoder(self.storage.entry(designator.clone()).or_default(), data);
        Some(designator)
    }

    pub fn get(&self, designator: &str) -> Option<&Map<String, Value>> {
        self.storage.get(designator)
    }

    pub fn get_key(&self, designator: &str, key: &str) -> Option<&Value> {
        self.get(designator)?.get(key)
    }
}

/// Local IO card catalogue: `cards` entries accumulate across pushes.
fn merge_cards(storage: &mut Map<String, Value>, data: Map<String, Value>) {
    let Some(Value::Object(cards)) = data.get("cards") else {
        return;
    };
    let stored = storage
        .entry("cards")
        .or_insert_with(|| Value::Object(Map::new()));
    if !stored.is_object() {
        *stored = Value::Object(Map::new());
    }
    if let Value::Object(stored) = stored {
        for (key, card) in cards {
            stored.insert(key.clone(), card.clone());
        }
    }
}

#[cfg(test)]
#[path = "initial_data_tests.rs"]
mod tests;

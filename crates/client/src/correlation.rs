// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Matching inbound frames to whoever is waiting for them.
//!
//! Two mechanisms exist side by side:
//! - [`PendingRequests`]: keyed by a type-code prefix, consumed once, each
//!   with its own deadline.
//! - [`Promises`]: keyed by a numeric id drawn from a [`RollingId`].
//!
//! Rolling ids wrap around without collision detection; a registration that
//! reuses a live id replaces the older one.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use tokio::time::Instant;

/// Handle for an entry in a [`PrefixTrie`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug)]
struct Node<T> {
    children: HashMap<char, Node<T>>,
    entries: BTreeMap<SubscriptionId, T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Node {
            children: HashMap::new(),
            entries: BTreeMap::new(),
        }
    }
}

/// Entries keyed by a type-code prefix.
///
/// Looking up a frame's type codes walks one node per character, so the
/// cost depends on the code length, not on the number of subscribers.
#[derive(Debug)]
pub struct PrefixTrie<T> {
    root: Node<T>,
    prefixes: HashMap<SubscriptionId, String>,
    next_id: u64,
}

impl<T> Default for PrefixTrie<T> {
    fn default() -> Self {
        PrefixTrie {
            root: Node::default(),
            prefixes: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<T> PrefixTrie<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, prefix: &str, value: T) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let mut node = &mut self.root;
        for c in prefix.chars() {
            node = node.children.entry(c).or_default();
        }
        node.entries.insert(id, value);
        self.prefixes.insert(id, prefix.to_string());
        id
    }

    pub fn remove(&mut self, id: SubscriptionId) -> Option<T> {
        let prefix = self.prefixes.remove(&id)?;
        Self::remove_at(&mut self.root, &mut prefix.chars(), id)
    }

    fn remove_at(
        node: &mut Node<T>,
        path: &mut std::str::Chars<'_>,
        id: SubscriptionId,
    ) -> Option<T> {
        match path.next() {
            None => node.entries.remove(&id),
            Some(c) => {
                let child = node.children.get_mut(&c)?;
                let value = Self::remove_at(child, path, id);
                if child.entries.is_empty() && child.children.is_empty() {
                    node.children.remove(&c);
                }
                value
            }
        }
    }

    /// Ids of every entry whose prefix starts `codes`, oldest first.
    pub fn matching(&self, codes: &str) -> Vec<SubscriptionId> {
        let mut ids: Vec<SubscriptionId> = self.root.entries.keys().copied().collect();
        let mut node = &self.root;
        for c in codes.chars() {
            match node.children.get(&c) {
                Some(child) => {
                    ids.extend(child.entries.keys().copied());
                    node = child;
                }
                None => break,
            }
        }
        ids.sort_unstable();
        ids
    }

    pub fn get(&self, id: SubscriptionId) -> Option<&T> {
        let prefix = self.prefixes.get(&id)?;
        let mut node = &self.root;
        for c in prefix.chars() {
            node = node.children.get(&c)?;
        }
        node.entries.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SubscriptionId, &T)> + '_ {
        self.prefixes.keys().filter_map(|id| Some((*id, self.get(*id)?)))
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

#[derive(Debug)]
struct Pending<T> {
    codes: String,
    deadline: Instant,
    responder: T,
}

/// Correlated requests awaiting a response whose type codes start with
/// the registered prefix.
#[derive(Debug)]
pub struct PendingRequests<T> {
    trie: PrefixTrie<Pending<T>>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        PendingRequests {
            trie: PrefixTrie::new(),
        }
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, codes: &str, deadline: Instant, responder: T) -> SubscriptionId {
        self.trie.insert(
            codes,
            Pending {
                codes: codes.to_string(),
                deadline,
                responder,
            },
        )
    }

    /// Takes the oldest request matched by a frame with these type codes.
    pub fn resolve(&mut self, codes: &str) -> Option<T> {
        let id = self.trie.matching(codes).into_iter().next()?;
        self.trie.remove(id).map(|p| p.responder)
    }

    /// Takes a request by id, e.g. when its send failed.
    pub fn cancel(&mut self, id: SubscriptionId) -> Option<T> {
        self.trie.remove(id).map(|p| p.responder)
    }

    /// Takes every request whose deadline has passed, with its codes.
    pub fn expire(&mut self, now: Instant) -> Vec<(String, T)> {
        let mut due: Vec<SubscriptionId> = self
            .trie
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id)
            .collect();
        due.sort_unstable();
        due.into_iter()
            .filter_map(|id| self.trie.remove(id))
            .map(|p| (p.codes, p.responder))
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.trie.iter().map(|(_, p)| p.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.trie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }
}

/// A counter cycling through `min..=max`.
#[derive(Debug, Clone, Copy)]
pub struct RollingId {
    next: u32,
    min: u32,
    max: u32,
}

impl RollingId {
    pub fn new(min: u32, max: u32) -> Self {
        RollingId {
            next: min,
            min,
            max,
        }
    }

    /// Ids for device messages: 1 through 9999.
    pub fn message_ids() -> Self {
        RollingId::new(1, 9999)
    }

    /// Per-module command numbers: 0 through 9999.
    pub fn command_nums() -> Self {
        RollingId::new(0, 9999)
    }

    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next = if id >= self.max { self.min } else { id + 1 };
        id
    }
}

/// Resolvers keyed by id, each invoked at most once.
#[derive(Debug)]
pub struct Promises<K, T> {
    entries: HashMap<K, (Instant, T)>,
}

impl<K, T> Default for Promises<K, T> {
    fn default() -> Self {
        Promises {
            entries: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash + Ord, T> Promises<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resolver, returning any older one under the same key.
    pub fn register(&mut self, key: K, deadline: Instant, resolver: T) -> Option<T> {
        self.entries.insert(key, (deadline, resolver)).map(|(_, r)| r)
    }

    pub fn invoke(&mut self, key: K) -> Option<T> {
        self.entries.remove(&key).map(|(_, r)| r)
    }

    pub fn contains(&self, key: K) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn expire(&mut self, now: Instant) -> Vec<(K, T)> {
        let mut due: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        due.sort_unstable();
        due.into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|(_, r)| (k, r)))
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|(deadline, _)| *deadline).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[path = "correlation_tests.rs"]
mod tests;

// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic polling of value, status and instrument readings.
//!
//! Each channel keeps an active list that is polled every interval and a
//! staging list for modules subscribed since the last tick. The tick timer
//! exists exactly while the active list is non-empty.

use std::collections::HashMap;
use std::time::Duration;

use ml_core::codes;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollChannel {
    Value,
    Status,
    Instrument,
}

impl PollChannel {
    /// Type codes of the poll request and of the pushed answer.
    pub fn codes(self) -> &'static str {
        match self {
            PollChannel::Value => codes::VALUES,
            PollChannel::Status => codes::STATUS,
            PollChannel::Instrument => codes::INSTRUMENT,
        }
    }
}

impl std::fmt::Display for PollChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PollChannel::Value => "value",
            PollChannel::Status => "status",
            PollChannel::Instrument => "instrument",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct Batcher {
    channel: PollChannel,
    cap: usize,
    interval: Duration,
    active: Vec<u32>,
    staging: Vec<u32>,
    refs: HashMap<u32, usize>,
    next_tick: Option<Instant>,
}

impl Batcher {
    pub fn new(channel: PollChannel, cap: usize, interval: Duration) -> Self {
        Self {
            channel,
            cap: cap.max(1),
            interval,
            active: Vec::new(),
            staging: Vec::new(),
            refs: HashMap::new(),
            next_tick: None,
        }
    }

    pub fn channel(&self) -> PollChannel {
        self.channel
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap.max(1);
    }

    pub fn active(&self) -> &[u32] {
        &self.active
    }

    pub fn staged(&self) -> &[u32] {
        &self.staging
    }

    pub fn is_polling(&self) -> bool {
        self.next_tick.is_some()
    }

    /// Adds one listener for `uid`. Returns true when this listener started
    /// the timer.
    pub fn register(&mut self, uid: u32, now: Instant) -> bool {
        let count = self.refs.entry(uid).or_insert(0);
        *count += 1;
        if *count > 1 {
            return false;
        }
        if self.active.is_empty() {
            self.active.push(uid);
            self.next_tick = Some(now + self.interval);
            true
        } else {
            self.staging.push(uid);
            false
        }
    }

    /// Drops one listener for `uid`; the module stops being polled when its
    /// last listener leaves.
    pub fn deregister(&mut self, uid: u32) -> bool {
        let Some(count) = self.refs.get_mut(&uid) else {
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return false;
        }
        self.purge(uid);
        true
    }

    /// Removes `uid` regardless of listener count.
    pub fn purge(&mut self, uid: u32) {
        self.refs.remove(&uid);
        self.staging.retain(|u| *u != uid);
        let before = self.active.len();
        self.active.retain(|u| *u != uid);
        if before > 0 && self.active.is_empty() {
            self.active.append(&mut self.staging);
            if self.active.is_empty() {
                self.next_tick = None;
            }
        }
    }

    /// Batches due at `now`, each at most `cap` UIDs. Empty when the timer
    /// is not due.
    pub fn tick(&mut self, now: Instant) -> Vec<Vec<u32>> {
        let Some(due) = self.next_tick else {
            return Vec::new();
        };
        if now < due {
            return Vec::new();
        }
        self.active.append(&mut self.staging);
        let next = due + self.interval;
        self.next_tick = Some(if next > now { next } else { now + self.interval });
        self.active.chunks(self.cap).map(<[u32]>::to_vec).collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_tick
    }
}

#[cfg(test)]
#[path = "polling_tests.rs"]
mod tests;

// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Full sync and resync state machine.
//!
//! The first sync enumerates every module. Later syncs probe the device
//! with the last save number and, if it moved, re-enumerate while diffing
//! against a snapshot of the modules known before the reconnect.

use std::collections::BTreeSet;

use ml_core::{
    protocol::{SameProbe, SyncHeader, TimeHeader},
    ROOT_UID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Disconnected,
    Connecting,
    /// `SN` sent, waiting for the save number.
    AwaitingProbe,
    AwaitingHeader,
    BulkSyncing,
    ResyncDiffing,
    Synced,
}

/// What to ask the device for once the link is negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// `SS`: enumerate everything.
    Full,
    /// `SN`: report save number and module count.
    Probe,
}

/// Identity and clock of the device, taken from sync and time headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerInfo {
    pub name: String,
    pub version: Option<String>,
    /// Device clock minus local clock.
    pub clock_offset_ms: i64,
    /// Device time-zone offset as reported.
    pub time_zone_offset: Option<i64>,
}

/// Result of reaching `Synced`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// True for the first sync of this engine.
    pub first: bool,
    /// Modules known before a resync that the device did not re-announce.
    pub stale: Vec<u32>,
}

#[derive(Debug)]
pub struct SyncEngine {
    phase: SyncPhase,
    save_number: u64,
    save_on_server: Option<u64>,
    amount_on_server: u32,
    once_synced: bool,
    snapshot: Option<BTreeSet<u32>>,
    touched: u32,
    server: ServerInfo,
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEngine {
    pub fn new() -> Self {
        Self {
            phase: SyncPhase::Disconnected,
            save_number: 0,
            save_on_server: None,
            amount_on_server: 0,
            once_synced: false,
            snapshot: None,
            touched: 0,
            server: ServerInfo::default(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn is_synced(&self) -> bool {
        self.phase == SyncPhase::Synced
    }

    /// True while module objects belong to an enumeration.
    pub fn is_enumerating(&self) -> bool {
        matches!(
            self.phase,
            SyncPhase::AwaitingHeader | SyncPhase::BulkSyncing | SyncPhase::ResyncDiffing
        )
    }

    pub fn once_synced(&self) -> bool {
        self.once_synced
    }

    pub fn save_number(&self) -> u64 {
        self.save_number
    }

    pub fn amount_on_server(&self) -> u32 {
        self.amount_on_server
    }

    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    pub fn set_version(&mut self, version: Option<String>) {
        self.server.version = version;
    }

    pub fn connecting(&mut self) {
        self.phase = SyncPhase::Connecting;
    }

    /// Picks the opening request after negotiation.
    pub fn on_connected(&mut self) -> SyncRequest {
        if self.save_number == 0 {
            self.phase = SyncPhase::AwaitingHeader;
            SyncRequest::Full
        } else {
            self.phase = SyncPhase::AwaitingProbe;
            SyncRequest::Probe
        }
    }

    pub fn is_awaiting_probe(&self) -> bool {
        self.phase == SyncPhase::AwaitingProbe
    }

    /// Begins an enumeration. After the first sync, `known` becomes the
    /// snapshot that re-announced modules are struck from.
    pub fn start_sync(&mut self, known: impl IntoIterator<Item = u32>) {
        self.phase = SyncPhase::AwaitingHeader;
        self.touched = 0;
        self.snapshot = self
            .once_synced
            .then(|| known.into_iter().filter(|uid| *uid != ROOT_UID).collect());
    }

    /// Applies an `SS` header. `now_ms` is the local wall clock.
    pub fn on_header(&mut self, header: &SyncHeader, now_ms: i64) {
        self.amount_on_server = header.amount;
        self.save_on_server = Some(header.num);
        self.server.name.clone_from(&header.name);
        if let Some(time) = header.time {
            self.server.clock_offset_ms = clock_offset(time, now_ms);
        }
        if header.time_offset.is_some() {
            self.server.time_zone_offset = header.time_offset;
        }
        self.phase = if self.snapshot.is_some() {
            SyncPhase::ResyncDiffing
        } else {
            SyncPhase::BulkSyncing
        };
    }

    /// Applies an `ST` header.
    pub fn on_time(&mut self, header: &TimeHeader, now_ms: i64) {
        if let Some(adjust) = header.adjust {
            self.server.clock_offset_ms = clock_offset(adjust, now_ms);
        }
        if header.offset.is_some() {
            self.server.time_zone_offset = header.offset;
        }
    }

    /// Compares an `SN` answer with local state. True means nothing changed
    /// and sync can finish without enumeration.
    pub fn on_probe(&self, probe: &SameProbe, live_count: usize) -> bool {
        probe.num == self.save_number && probe.amount as usize == live_count
    }

    /// Records a module object received during enumeration and returns
    /// `(touched, expected)` for progress reporting.
    pub fn touch(&mut self, uid: u32) -> (u32, u32) {
        if let Some(snapshot) = &mut self.snapshot {
            snapshot.remove(&uid);
        }
        self.touched += 1;
        (self.touched, self.amount_on_server)
    }

    /// Handles `SD`: adopts the checkpoint announced by the header and
    /// finishes. `None` if no enumeration is running.
    pub fn on_done(&mut self) -> Option<SyncOutcome> {
        if !self.is_enumerating() {
            return None;
        }
        if let Some(num) = self.save_on_server.take() {
            self.save_number = num;
        }
        Some(self.finish())
    }

    /// Moves to `Synced` and hands back the stale remainder of a resync.
    pub fn finish(&mut self) -> SyncOutcome {
        let first = !self.once_synced;
        let stale = self
            .snapshot
            .take()
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        self.phase = SyncPhase::Synced;
        self.once_synced = true;
        SyncOutcome { first, stale }
    }

    /// Live changes after sync carry the new save number.
    pub fn adopt_save_number(&mut self, num: u64) {
        self.save_number = num;
    }

    /// Link went down: the next connect starts over at the header.
    pub fn on_closed(&mut self) {
        self.phase = SyncPhase::Disconnected;
        self.snapshot = None;
        self.save_on_server = None;
        self.touched = 0;
    }
}

fn clock_offset(device_seconds: f64, now_ms: i64) -> i64 {
    (device_seconds * 1000.0).round() as i64 - now_ms
}

#[cfg(test)]
#[path = "sync_tests.rs"]
mod tests;

// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Connection supervision: reconnect scheduling and the inactivity watchdog.
//!
//! The supervisor performs no IO. It is told what happened (opened, traffic,
//! closed) and asked what is due at a given instant.
//!
//! Reconnects use a fixed delay forever; there is no backoff growth and no
//! retry limit.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::TimingConfig;

/// Lifecycle of the underlying socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No socket, reconnect pending or shut down.
    Down,
    Connecting,
    Open,
}

/// What the watchdog wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// First silence window elapsed.
    Ping,
    /// Second silence window elapsed.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitingTraffic,
    AwaitingPong,
}

#[derive(Debug)]
pub struct Supervisor {
    state: LinkState,
    watchdog: Option<(Instant, Stage)>,
    reconnect_at: Option<Instant>,
    shut_down: bool,
    ping_after: Duration,
    close_after: Duration,
    reconnect_delay: Duration,
}

impl Supervisor {
    /// Creates a supervisor whose first connection attempt is due at `now`.
    pub fn new(timing: &TimingConfig, now: Instant) -> Self {
        Supervisor {
            state: LinkState::Down,
            watchdog: None,
            reconnect_at: Some(now),
            shut_down: false,
            ping_after: timing.watchdog_ping(),
            close_after: timing.watchdog_close(),
            reconnect_delay: timing.reconnect_delay(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Returns true, and moves to `Connecting`, if a connection attempt is due.
    pub fn connect_due(&mut self, now: Instant) -> bool {
        match self.reconnect_at {
            Some(at) if at <= now && !self.shut_down => {
                self.reconnect_at = None;
                self.state = LinkState::Connecting;
                true
            }
            _ => false,
        }
    }

    pub fn opened(&mut self, now: Instant) {
        self.state = LinkState::Open;
        self.activity(now);
    }

    pub fn connect_failed(&mut self, now: Instant) {
        self.state = LinkState::Down;
        self.schedule_reconnect(now);
    }

    /// Restarts the watchdog after inbound traffic.
    pub fn activity(&mut self, now: Instant) {
        if self.state == LinkState::Open {
            self.watchdog = Some((now + self.ping_after, Stage::AwaitingTraffic));
        }
    }

    /// Advances the watchdog, returning the action due at `now`.
    pub fn poll_watchdog(&mut self, now: Instant) -> Option<WatchdogAction> {
        let (deadline, stage) = self.watchdog?;
        if deadline > now {
            return None;
        }
        match stage {
            Stage::AwaitingTraffic => {
                self.watchdog = Some((now + self.close_after, Stage::AwaitingPong));
                Some(WatchdogAction::Ping)
            }
            Stage::AwaitingPong => {
                self.watchdog = None;
                Some(WatchdogAction::Close)
            }
        }
    }

    /// Records that the socket closed.
    ///
    /// Returns true only on the transition from open to down, so callers can
    /// fire their closed notification exactly once however often this runs.
    pub fn closed(&mut self, now: Instant) -> bool {
        let was_open = self.state == LinkState::Open;
        self.state = LinkState::Down;
        self.watchdog = None;
        self.schedule_reconnect(now);
        was_open
    }

    /// Suppresses every further reconnect.
    pub fn shut_down(&mut self) {
        self.shut_down = true;
        self.reconnect_at = None;
        self.watchdog = None;
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        if self.shut_down || self.reconnect_at.is_some() {
            return;
        }
        self.reconnect_at = Some(now + self.reconnect_delay);
    }

    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let watchdog = self.watchdog.map(|(at, _)| at);
        match (watchdog, self.reconnect_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[cfg(test)]
#[path = "link_tests.rs"]
mod tests;

//! Connectivity transitions for the registry connection.
//!
//! Disconnect-bindings and registry subscriptions belong to one physical
//! connection. After a drop, nothing armed on the old connection survives,
//! so a `Reconnected` event is the cue to re-run presence join, re-arm the
//! cursor binding and resubscribe every pipeline.

use log::{info, warn};
use std::collections::VecDeque;
use tokio::sync::watch;

use crate::registry::Connectivity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// First connection came up.
    Connected,
    Disconnected,
    /// A new connection replaced a dropped one.
    Reconnected,
}

impl ConnectionEvent {
    pub fn is_connected(&self) -> bool {
        !matches!(self, ConnectionEvent::Disconnected)
    }
}

/// Turns the raw connectivity signal into transition events. Repeated
/// values produce nothing.
pub struct ConnectionMonitor {
    rx: watch::Receiver<Connectivity>,
    last: Connectivity,
    has_dropped: bool,
    queued: VecDeque<ConnectionEvent>,
}

impl ConnectionMonitor {
    /// Start from the current state; no event is emitted for it.
    pub fn new(mut rx: watch::Receiver<Connectivity>) -> Self {
        let last = *rx.borrow_and_update();
        Self {
            rx,
            last,
            has_dropped: false,
            queued: VecDeque::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.last.connected
    }

    /// Next transition, or `None` when the signal's source is gone.
    pub async fn next(&mut self) -> Option<ConnectionEvent> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Some(event);
            }
            if self.rx.changed().await.is_err() {
                warn!("Connectivity signal closed");
                return None;
            }
            let now = *self.rx.borrow_and_update();
            self.observe(now);
        }
    }

    fn observe(&mut self, now: Connectivity) {
        let prev = self.last;
        self.last = now;

        match (prev.connected, now.connected) {
            (true, false) => self.push_down(),
            (false, true) => self.push_up(),
            // Dropped and replaced between two observations.
            (true, true) if prev.epoch != now.epoch => {
                self.push_down();
                self.push_up();
            }
            _ => {}
        }
    }

    fn push_down(&mut self) {
        info!("Connection lost");
        self.has_dropped = true;
        self.queued.push_back(ConnectionEvent::Disconnected);
    }

    fn push_up(&mut self) {
        let event = if self.has_dropped {
            info!("Connection re-established");
            ConnectionEvent::Reconnected
        } else {
            info!("Connection established");
            ConnectionEvent::Connected
        };
        self.queued.push_back(event);
    }
}

//! Reconnection supervisor for the shared control link.

use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior};

/// State of the control link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Absent,
    Connecting,
    Established,
}

/// Tracks the control link and paces reconnection attempts.
///
/// A dial is started on a tick only while the link is [`LinkState::Absent`],
/// so at most one attempt is ever in flight.
#[derive(Debug)]
pub struct Supervisor {
    state: LinkState,
    interval: Duration,
}

impl Supervisor {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: LinkState::Absent,
            interval,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Builds the ticker driving [`Supervisor::begin_dial`].
    ///
    /// The first tick completes immediately.
    pub fn ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Returns true if a dial should be started now.
    pub fn begin_dial(&mut self) -> bool {
        if self.state != LinkState::Absent {
            return false;
        }
        self.state = LinkState::Connecting;
        true
    }

    /// The dial (and handshake) succeeded.
    pub fn established(&mut self) {
        self.state = LinkState::Established;
    }

    /// The dial failed or the link was lost.
    pub fn lost(&mut self) {
        self.state = LinkState::Absent;
    }
}

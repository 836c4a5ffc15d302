//! Pending pool and pairing for the pooled transport.
//!
//! The server keeps authenticated-but-unpaired downstream sockets in a
//! [`PendingPool`] together with the ids of upstream connections that arrived
//! while no socket was available. Whichever side arrives second is paired with
//! the oldest waiting counterpart.
//!
//! The client keeps the server's pool topped up with a [`Replenisher`].

use std::collections::VecDeque;
use std::time::Duration;

/// Delay before retrying a failed or lost pooled connection.
pub const RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Result of offering a new arrival to the pool.
#[derive(Debug, PartialEq, Eq)]
pub enum Pairing<S> {
    /// Paired with the oldest waiting counterpart.
    Paired(u32, S),
    /// No counterpart yet; the arrival was queued.
    Queued,
    /// The pool is full; the arrival was rejected and handed back.
    Rejected(S),
}

/// FIFO pairing of pending sockets with waiting connection ids.
#[derive(Debug)]
pub struct PendingPool<S> {
    capacity: usize,
    sockets: VecDeque<S>,
    waiting: VecDeque<u32>,
}

impl<S> PendingPool<S> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            sockets: VecDeque::new(),
            waiting: VecDeque::new(),
        }
    }

    /// Returns true when no more unpaired sockets are accepted.
    pub fn is_full(&self) -> bool {
        self.sockets.len() >= self.capacity
    }

    /// Offers an authenticated socket.
    pub fn offer_socket(&mut self, socket: S) -> Pairing<S> {
        if let Some(id) = self.waiting.pop_front() {
            return Pairing::Paired(id, socket);
        }
        if self.is_full() {
            return Pairing::Rejected(socket);
        }
        self.sockets.push_back(socket);
        Pairing::Queued
    }

    /// Offers a connection id that needs a socket.
    ///
    /// Returns the oldest pending socket, or queues the id.
    pub fn offer_id(&mut self, id: u32) -> Option<S> {
        match self.sockets.pop_front() {
            Some(socket) => Some(socket),
            None => {
                self.waiting.push_back(id);
                None
            }
        }
    }

    /// Removes a pending socket that closed before pairing.
    pub fn remove_socket(&mut self, matches: impl Fn(&S) -> bool) -> Option<S> {
        let index = self.sockets.iter().position(matches)?;
        self.sockets.remove(index)
    }

    /// Removes a waiting id whose connection closed before pairing.
    pub fn remove_id(&mut self, id: u32) -> bool {
        match self.waiting.iter().position(|&waiting| waiting == id) {
            Some(index) => {
                self.waiting.remove(index);
                true
            }
            None => false,
        }
    }

    /// Empties the pool, returning every pending socket.
    pub fn drain(&mut self) -> Vec<S> {
        self.waiting.clear();
        self.sockets.drain(..).collect()
    }

    pub fn pending_sockets(&self) -> usize {
        self.sockets.len()
    }

    pub fn waiting_ids(&self) -> usize {
        self.waiting.len()
    }
}

/// When to start a replacement connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Now,
    After(Duration),
}

/// Keeps a target number of pooled connections outstanding.
///
/// A connection counts as outstanding from the moment its dial is handed out
/// until it is reported back as [`Replenisher::consumed`],
/// [`Replenisher::failed`] or [`Replenisher::lost`]. Each report frees one
/// slot and hands out at most one replacement, so the count never exceeds the
/// target.
#[derive(Debug)]
pub struct Replenisher {
    target: usize,
    outstanding: usize,
}

impl Replenisher {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            outstanding: 0,
        }
    }

    /// Attempts needed to reach the target.
    pub fn fill(&mut self) -> Vec<Attempt> {
        let missing = self.target.saturating_sub(self.outstanding);
        self.outstanding += missing;
        vec![Attempt::Now; missing]
    }

    /// A pooled connection was paired by the relay.
    pub fn consumed(&mut self) -> Option<Attempt> {
        self.release();
        self.replace(Attempt::Now)
    }

    /// A connection attempt failed.
    pub fn failed(&mut self) -> Option<Attempt> {
        self.release();
        self.replace(Attempt::After(RETRY_DELAY))
    }

    /// An established pooled connection closed before it was paired.
    pub fn lost(&mut self) -> Option<Attempt> {
        self.release();
        self.replace(Attempt::After(RETRY_DELAY))
    }

    /// Number of pooled connections open or being opened.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn target(&self) -> usize {
        self.target
    }

    fn release(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    fn replace(&mut self, attempt: Attempt) -> Option<Attempt> {
        if self.outstanding >= self.target {
            return None;
        }
        self.outstanding += 1;
        Some(attempt)
    }
}

//! Logical connection registry.
//!
//! A [`Registry`] owns every logical connection of one relay role. Each
//! connection has a *local end* (the socket on this side of the tunnel: the
//! accepted requester on the server, the internal service on the client) and a
//! *link binding* (the shared control link or a dedicated pooled socket).
//!
//! Bytes are queued in two directions:
//!
//! - `outbound`: received from the link, waiting for the local end to connect
//! - `inbound`: read from the local end, waiting for a link to be attached
//!
//! A [`Payload::Close`] in either queue terminates the connection when it is
//! flushed. Purged ids are remembered so late frames cannot resurrect them.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;

use crate::protocol::{Frame, Framing, Payload};
use crate::socket::SocketHandle;

/// Number of purged ids remembered to drop late frames.
pub const RETIRED_ID_CAPACITY: usize = 65_536;

/// What to do with a frame for an id that was never seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownIds {
    /// Create the connection and ask the caller to dial the local end.
    Dial,
    /// Drop the frame.
    Drop,
}

/// Outcome of [`Registry::route_inbound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Queued for (or written to) an existing connection.
    Queued,
    /// A new connection was created; the caller must dial its local end.
    Dial,
    /// Dropped (unknown, retired, or already closing id).
    Dropped,
}

/// State of the socket on this side of the tunnel.
#[derive(Debug)]
enum LocalEnd {
    Connecting,
    Open(SocketHandle),
    Closed,
}

/// How a connection reaches the other relay role.
#[derive(Debug)]
pub enum LinkBinding {
    /// Multiplexed over the registry's shared control link.
    Shared,
    /// A dedicated pooled socket, `None` until paired.
    Dedicated(Option<SocketHandle>),
}

/// One end-to-end tunneled TCP stream.
#[derive(Debug)]
pub struct LogicalConnection {
    id: u32,
    local: LocalEnd,
    link: LinkBinding,
    outbound: VecDeque<Payload>,
    inbound: VecDeque<Payload>,
}

impl LogicalConnection {
    fn new(id: u32, local: LocalEnd, link: LinkBinding) -> Self {
        Self {
            id,
            local,
            link,
            outbound: VecDeque::new(),
            inbound: VecDeque::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// True once the local end has connected (and not yet closed).
    pub fn is_connected(&self) -> bool {
        matches!(self.local, LocalEnd::Open(_))
    }

    /// True while waiting for a dedicated link to be paired.
    pub fn is_unpaired(&self) -> bool {
        matches!(self.link, LinkBinding::Dedicated(None))
    }

    /// Payloads waiting for the local end.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Payloads waiting for a link.
    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }
}

/// Bounded FIFO set of purged ids.
#[derive(Debug)]
struct RetiredIds {
    order: VecDeque<u32>,
    set: HashSet<u32>,
    capacity: usize,
}

impl RetiredIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: u32) {
        if !self.set.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: u32) -> bool {
        self.set.contains(&id)
    }
}

/// Per-role table of logical connections.
#[derive(Debug)]
pub struct Registry {
    framing: Framing,
    unknown_ids: UnknownIds,
    connections: HashMap<u32, LogicalConnection>,
    link: Option<SocketHandle>,
    retired: RetiredIds,
    last_id: u32,
}

impl Registry {
    pub fn new(framing: Framing, unknown_ids: UnknownIds) -> Self {
        Self {
            framing,
            unknown_ids,
            connections: HashMap::new(),
            link: None,
            retired: RetiredIds::new(RETIRED_ID_CAPACITY),
            last_id: 0,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Allocates the next connection id.
    ///
    /// Ids increase monotonically, wrap after `u32::MAX`, never return 0 and
    /// skip ids that are still live.
    pub fn allocate_id(&mut self) -> u32 {
        loop {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id != 0 && !self.connections.contains_key(&self.last_id) {
                return self.last_id;
            }
        }
    }

    /// Registers a connection whose local end is already connected.
    pub fn insert_open(&mut self, id: u32, socket: SocketHandle, link: LinkBinding) {
        tracing::debug!(id, "logical connection opened");
        self.connections
            .insert(id, LogicalConnection::new(id, LocalEnd::Open(socket), link));
    }

    /// Registers a connection whose local end is still being dialed.
    pub fn insert_connecting(&mut self, id: u32, link: LinkBinding) {
        tracing::debug!(id, "logical connection connecting");
        self.connections
            .insert(id, LogicalConnection::new(id, LocalEnd::Connecting, link));
    }

    /// Routes a payload that arrived from the link towards the local end.
    pub fn route_inbound(&mut self, id: u32, payload: Payload) -> Routed {
        if let Some(conn) = self.connections.get_mut(&id) {
            if matches!(conn.local, LocalEnd::Closed) {
                return Routed::Dropped;
            }
            conn.outbound.push_back(payload);
            self.flush_local(id);
            return Routed::Queued;
        }

        if self.retired.contains(id) {
            tracing::debug!(id, "dropping frame for retired connection");
            return Routed::Dropped;
        }

        if self.unknown_ids == UnknownIds::Drop {
            tracing::debug!(id, "dropping frame for unknown connection");
            return Routed::Dropped;
        }

        if payload.is_close() {
            // Nothing to tear down, but later frames must not open it.
            self.retired.insert(id);
            return Routed::Dropped;
        }

        let mut conn = LogicalConnection::new(id, LocalEnd::Connecting, LinkBinding::Shared);
        conn.outbound.push_back(payload);
        self.connections.insert(id, conn);
        tracing::debug!(id, "logical connection requested by peer");
        Routed::Dial
    }

    /// Routes a payload from the local end towards the link.
    pub fn route_outbound(&mut self, id: u32, payload: Payload) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.inbound.push_back(payload);
        self.flush_link(id);
    }

    /// Marks the local end connected and flushes queued payloads in order.
    ///
    /// Returns false if the connection is gone or not waiting; the caller then
    /// owns `socket` and should destroy it.
    pub fn on_local_connected(&mut self, id: u32, socket: SocketHandle) -> bool {
        let Some(conn) = self.connections.get_mut(&id) else {
            return false;
        };
        if !matches!(conn.local, LocalEnd::Connecting) {
            return false;
        }
        conn.local = LocalEnd::Open(socket);
        self.flush_local(id);
        true
    }

    /// Bytes read from the local end.
    pub fn on_local_data(&mut self, id: u32, data: Bytes) {
        let open = self
            .connections
            .get(&id)
            .is_some_and(LogicalConnection::is_connected);
        if open {
            tracing::debug!(id, bytes = data.len(), "local data");
            self.route_outbound(id, Payload::Data(data));
        }
    }

    /// The local end closed, errored or failed to connect.
    pub fn on_local_closed(&mut self, id: u32) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if let LocalEnd::Open(socket) = std::mem::replace(&mut conn.local, LocalEnd::Closed) {
            socket.destroy();
        }
        conn.outbound.clear();

        if conn.is_unpaired() {
            self.purge(id);
            return;
        }
        self.route_outbound(id, Payload::Close);
    }

    /// The dedicated link of a pooled connection closed.
    pub fn on_link_closed(&mut self, id: u32) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if let LinkBinding::Dedicated(link) = &mut conn.link {
            if let Some(socket) = link.take() {
                socket.destroy();
            }
        }
        conn.inbound.clear();

        if matches!(conn.local, LocalEnd::Closed) {
            self.purge(id);
            return;
        }
        self.route_inbound(id, Payload::Close);
    }

    /// Attaches the shared control link and flushes every waiting connection.
    pub fn on_link_up(&mut self, link: SocketHandle) {
        if let Some(old) = self.link.replace(link) {
            old.destroy();
        }

        let mut waiting: Vec<u32> = self
            .connections
            .values()
            .filter(|conn| matches!(conn.link, LinkBinding::Shared) && !conn.inbound.is_empty())
            .map(|conn| conn.id)
            .collect();
        waiting.sort_unstable();

        tracing::debug!(waiting = waiting.len(), "control link attached");
        for id in waiting {
            self.flush_link(id);
        }
    }

    /// Detaches the shared control link. Connections keep buffering.
    pub fn on_link_down(&mut self) {
        if let Some(link) = self.link.take() {
            link.destroy();
            tracing::debug!(connections = self.connections.len(), "control link detached");
        }
    }

    /// Returns the shared control link, if attached.
    pub fn link(&self) -> Option<&SocketHandle> {
        self.link.as_ref()
    }

    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }

    /// Pairs an unpaired connection with its dedicated link and flushes.
    ///
    /// Returns false if the connection is gone or already paired; the caller
    /// then owns `socket`.
    pub fn bind_link(&mut self, id: u32, socket: SocketHandle) -> bool {
        let Some(conn) = self.connections.get_mut(&id) else {
            return false;
        };
        if !conn.is_unpaired() {
            return false;
        }
        conn.link = LinkBinding::Dedicated(Some(socket));
        self.flush_link(id);
        true
    }

    /// Destroys every connection and the shared link.
    pub fn destroy_all(&mut self) {
        for (id, conn) in self.connections.drain() {
            if let LocalEnd::Open(socket) = &conn.local {
                socket.destroy();
            }
            if let LinkBinding::Dedicated(Some(socket)) = &conn.link {
                socket.destroy();
            }
            self.retired.insert(id);
        }
        self.on_link_down();
    }

    pub fn get(&self, id: u32) -> Option<&LogicalConnection> {
        self.connections.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn is_retired(&self, id: u32) -> bool {
        self.retired.contains(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn flush_local(&mut self, id: u32) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let LocalEnd::Open(socket) = &conn.local else {
            return;
        };

        let mut closed = false;
        while let Some(payload) = conn.outbound.pop_front() {
            match payload {
                Payload::Data(data) => {
                    tracing::debug!(id, bytes = data.len(), "write to local end");
                    socket.write(data);
                }
                Payload::Close => {
                    tracing::debug!(id, "peer closed connection");
                    closed = true;
                    break;
                }
            }
        }

        if closed {
            self.purge(id);
        }
    }

    fn flush_link(&mut self, id: u32) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        let mut closed = false;
        match &conn.link {
            LinkBinding::Shared => {
                let Some(link) = &self.link else {
                    return;
                };
                // One write per frame: sentinel peers read one frame per chunk.
                while let Some(payload) = conn.inbound.pop_front() {
                    closed = payload.is_close();
                    link.write(Frame { id, payload }.to_bytes(self.framing));
                    if closed {
                        break;
                    }
                }
            }
            LinkBinding::Dedicated(Some(socket)) => {
                while let Some(payload) = conn.inbound.pop_front() {
                    match payload {
                        Payload::Data(data) => socket.write(data),
                        Payload::Close => {
                            closed = true;
                            break;
                        }
                    }
                }
            }
            LinkBinding::Dedicated(None) => return,
        }

        if closed {
            self.purge(id);
        }
    }

    fn purge(&mut self, id: u32) {
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };
        if let LocalEnd::Open(socket) = &conn.local {
            socket.destroy();
        }
        if let LinkBinding::Dedicated(Some(socket)) = &conn.link {
            socket.destroy();
        }
        self.retired.insert(id);
        tracing::debug!(id, "logical connection closed");
    }
}

//! Server mode implementation for backhaul.
//!
//! The server is the public relay. Requesting clients connect to the
//! upstream-facing listener; the client role connects to the downstream-facing
//! listener, either once (a multiplexed control link) or many times (a pool of
//! dedicated links). A single event loop owns every table; socket, handshake
//! and accept work reports back through one channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

use crate::auth::{challenge_peer, Verifier};
use crate::cli::ServerArgs;
use crate::common::{bind_listener, listen_address, Transport};
use crate::error::Result;
use crate::pool::{Pairing, PendingPool};
use crate::protocol::{FrameDecoder, Framing, Payload, PAIRED_SIGNAL};
use crate::registry::{LinkBinding, Registry, UnknownIds};
use crate::shutdown::{listen_for_interrupt, Shutdown};
use crate::socket::{spawn_socket, SocketEvent, SocketHandle, SocketId};

/// Runs the backhaul server until interrupted.
pub async fn run_server(args: &ServerArgs) -> Result<()> {
    let config = ServerConfig::from_args(args)?;
    let server = RelayServer::bind(config).await?;

    print_startup_message(args, &server);

    let shutdown = Shutdown::new();
    let shutdown_rx = shutdown.subscribe();
    let signals = listen_for_interrupt(shutdown, args.shutdown_timeout);

    let result = server.run(shutdown_rx).await;
    signals.abort();
    result
}

/// Prints the startup message.
fn print_startup_message(args: &ServerArgs, server: &RelayServer) {
    eprintln!("Starting server...");
    eprintln!("  Upstream: {}", server.upstream_addr);
    eprintln!("  Downstream: {}", server.downstream_addr);
    eprintln!("  Transport: {:?}", args.transport);
    eprintln!("  Framing: {:?}", args.framing);
    eprintln!(
        "  Authentication: {}",
        if args.public_key.is_some() { "ed25519" } else { "none" }
    );
    eprintln!("  Max Pending Downstream: {}", args.max_pending_downstream);
    eprintln!("  Auth Timeout: {}", humantime::format_duration(args.auth_timeout));
}

/// Server configuration, resolved from CLI arguments.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub upstream_addr: SocketAddr,
    pub downstream_addr: SocketAddr,
    pub transport: Transport,
    pub framing: Framing,
    pub verifier: Option<Verifier>,
    pub max_pending_downstream: usize,
    pub auth_timeout: Duration,
}

impl ServerConfig {
    pub fn from_args(args: &ServerArgs) -> Result<Self> {
        let verifier = args
            .public_key
            .as_deref()
            .map(Verifier::from_hex)
            .transpose()?;

        Ok(Self {
            upstream_addr: listen_address(args.upstream_binding_ip(), args.upstream_port)?,
            downstream_addr: listen_address(args.downstream_binding_ip(), args.downstream_port)?,
            transport: args.transport,
            framing: args.framing,
            verifier,
            max_pending_downstream: args.max_pending_downstream,
            auth_timeout: args.auth_timeout,
        })
    }
}

/// Bound relay server, ready to run.
#[derive(Debug)]
pub struct RelayServer {
    config: ServerConfig,
    upstream: TcpListener,
    downstream: TcpListener,
    upstream_addr: SocketAddr,
    downstream_addr: SocketAddr,
}

impl RelayServer {
    /// Binds both listeners.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let upstream = bind_listener(config.upstream_addr).await?;
        let downstream = bind_listener(config.downstream_addr).await?;
        let upstream_addr = upstream.local_addr()?;
        let downstream_addr = downstream.local_addr()?;

        tracing::info!(%upstream_addr, "upstream server is listening");
        tracing::info!(%downstream_addr, "downstream server is listening");

        Ok(Self {
            config,
            upstream,
            downstream,
            upstream_addr,
            downstream_addr,
        })
    }

    /// Address requesting clients connect to.
    pub fn upstream_addr(&self) -> SocketAddr {
        self.upstream_addr
    }

    /// Address the client role connects to.
    pub fn downstream_addr(&self) -> SocketAddr {
        self.downstream_addr
    }

    /// Runs the event loop until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut state = ServerState::new(self.config, events_tx);

        loop {
            tokio::select! {
                accepted = self.upstream.accept() => match accepted {
                    Ok((stream, remote)) => state.on_upstream_accepted(stream, remote),
                    Err(e) => tracing::warn!(error = %e, "upstream accept failed"),
                },
                accepted = self.downstream.accept() => match accepted {
                    Ok((stream, remote)) => state.on_downstream_accepted(stream, remote),
                    Err(e) => tracing::warn!(error = %e, "downstream accept failed"),
                },
                Some(event) = events_rx.recv() => state.handle_event(event),
                Some(_) = state.tasks.join_next(), if !state.tasks.is_empty() => {}
                Some(_) = state.handshakes.join_next(), if !state.handshakes.is_empty() => {}
                _ = shutdown.recv() => {
                    tracing::info!("server is closing...");
                    break;
                }
            }
        }

        // Stop accepting before tearing sockets down
        drop(self.upstream);
        drop(self.downstream);
        state.close().await;

        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

enum ServerEvent {
    /// A downstream connection passed the handshake.
    DownstreamReady(TcpStream, SocketAddr),
    Socket(SocketId, SocketEvent),
}

/// What a tracked socket is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketRole {
    /// Accepted requester carrying connection `id`.
    Upstream(u32),
    /// Shared control link (mux transport).
    Link,
    /// Authenticated pooled connection waiting for a requester.
    Pending,
    /// Pooled connection dedicated to connection `id`.
    Paired(u32),
}

struct Tracked {
    handle: SocketHandle,
    role: SocketRole,
}

struct ServerState {
    transport: Transport,
    framing: Framing,
    verifier: Option<Verifier>,
    auth_timeout: Duration,
    registry: Registry,
    pool: PendingPool<SocketHandle>,
    decoder: FrameDecoder,
    link: Option<SocketId>,
    sockets: HashMap<SocketId, Tracked>,
    events: mpsc::UnboundedSender<ServerEvent>,
    tasks: JoinSet<()>,
    handshakes: JoinSet<()>,
}

impl ServerState {
    fn new(config: ServerConfig, events: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            transport: config.transport,
            framing: config.framing,
            verifier: config.verifier,
            auth_timeout: config.auth_timeout,
            registry: Registry::new(config.framing, UnknownIds::Drop),
            pool: PendingPool::new(config.max_pending_downstream),
            decoder: FrameDecoder::new(config.framing),
            link: None,
            sockets: HashMap::new(),
            events,
            tasks: JoinSet::new(),
            handshakes: JoinSet::new(),
        }
    }

    fn track(&mut self, stream: TcpStream, role: SocketRole) -> SocketHandle {
        let handle = spawn_socket(stream, &mut self.tasks, self.events.clone(), ServerEvent::Socket);
        self.sockets.insert(
            handle.id(),
            Tracked {
                handle: handle.clone(),
                role,
            },
        );
        handle
    }

    fn set_role(&mut self, socket: SocketId, role: SocketRole) {
        if let Some(tracked) = self.sockets.get_mut(&socket) {
            tracked.role = role;
        }
    }

    fn on_upstream_accepted(&mut self, stream: TcpStream, remote: SocketAddr) {
        let id = self.registry.allocate_id();
        let handle = self.track(stream, SocketRole::Upstream(id));
        tracing::info!(id, %remote, "incoming upstream connection");

        match self.transport {
            Transport::Mux => {
                self.registry.insert_open(id, handle, LinkBinding::Shared);
            }
            Transport::Pool => {
                self.registry
                    .insert_open(id, handle, LinkBinding::Dedicated(None));
                if let Some(downstream) = self.pool.offer_id(id) {
                    self.pair(id, downstream);
                } else {
                    tracing::debug!(id, "no pending downstream connection, waiting");
                }
            }
        }
    }

    /// Reason to turn a downstream connection away, if any.
    fn downstream_rejection(&self) -> Option<&'static str> {
        match self.transport {
            Transport::Mux if self.link.is_some() => Some("control link already exists"),
            Transport::Pool if self.pool.is_full() => Some("pending pool is full"),
            _ => None,
        }
    }

    fn on_downstream_accepted(&mut self, mut stream: TcpStream, remote: SocketAddr) {
        if let Some(reason) = self.downstream_rejection() {
            tracing::info!(%remote, reason, "ignore incoming downstream connection");
            return;
        }

        let Some(verifier) = self.verifier.clone() else {
            self.on_downstream_ready(stream, remote);
            return;
        };

        let events = self.events.clone();
        let timeout = self.auth_timeout;
        self.handshakes.spawn(async move {
            match challenge_peer(&mut stream, &verifier, timeout).await {
                Ok(()) => {
                    tracing::debug!(%remote, "downstream connection authenticated");
                    let _ = events.send(ServerEvent::DownstreamReady(stream, remote));
                }
                Err(e) => {
                    tracing::warn!(%remote, error = %e, "downstream authentication failed");
                }
            }
        });
    }

    fn on_downstream_ready(&mut self, stream: TcpStream, remote: SocketAddr) {
        // Re-check: the state may have changed during the handshake
        if let Some(reason) = self.downstream_rejection() {
            tracing::info!(%remote, reason, "ignore incoming downstream connection");
            return;
        }

        match self.transport {
            Transport::Mux => {
                let handle = self.track(stream, SocketRole::Link);
                self.link = Some(handle.id());
                self.decoder = FrameDecoder::new(self.framing);
                self.registry.on_link_up(handle);
                tracing::info!(%remote, "control link attached");
            }
            Transport::Pool => {
                let handle = self.track(stream, SocketRole::Pending);
                match self.pool.offer_socket(handle) {
                    Pairing::Paired(id, handle) => self.pair(id, handle),
                    Pairing::Queued => {
                        tracing::debug!(%remote, pending = self.pool.pending_sockets(), "downstream connection pending");
                    }
                    Pairing::Rejected(handle) => handle.destroy(),
                }
            }
        }
    }

    fn pair(&mut self, id: u32, downstream: SocketHandle) {
        self.set_role(downstream.id(), SocketRole::Paired(id));
        // The signal must precede the buffered requester bytes
        downstream.write(Bytes::from_static(&[PAIRED_SIGNAL]));
        if self.registry.bind_link(id, downstream.clone()) {
            tracing::debug!(id, "paired upstream with downstream connection");
        } else {
            downstream.destroy();
        }
    }

    fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::DownstreamReady(stream, remote) => self.on_downstream_ready(stream, remote),
            ServerEvent::Socket(socket, event) => self.on_socket_event(socket, event),
        }
    }

    fn on_socket_event(&mut self, socket: SocketId, event: SocketEvent) {
        let Some(role) = self.sockets.get(&socket).map(|tracked| tracked.role) else {
            return;
        };

        match (role, event) {
            (SocketRole::Upstream(id), SocketEvent::Data(data)) => {
                self.registry.on_local_data(id, data);
            }
            (SocketRole::Upstream(id), SocketEvent::Closed) => {
                self.sockets.remove(&socket);
                self.pool.remove_id(id);
                self.registry.on_local_closed(id);
                tracing::info!(id, "upstream connection closed");
            }
            (SocketRole::Link, SocketEvent::Data(data)) => self.on_link_data(data),
            (SocketRole::Link, SocketEvent::Closed) => self.on_link_lost(),
            (SocketRole::Pending, SocketEvent::Data(data)) => {
                // The client only speaks after the pairing signal
                tracing::debug!(bytes = data.len(), "ignoring data on unpaired downstream connection");
            }
            (SocketRole::Pending, SocketEvent::Closed) => {
                self.sockets.remove(&socket);
                self.pool.remove_socket(|handle| handle.id() == socket);
                tracing::info!("lose pending downstream connection");
            }
            (SocketRole::Paired(id), SocketEvent::Data(data)) => {
                self.registry.route_inbound(id, Payload::Data(data));
            }
            (SocketRole::Paired(id), SocketEvent::Closed) => {
                self.sockets.remove(&socket);
                self.registry.on_link_closed(id);
                tracing::debug!(id, "downstream connection closed");
            }
        }
    }

    fn on_link_data(&mut self, data: Bytes) {
        self.decoder.extend(data);
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => {
                    self.registry.route_inbound(frame.id, frame.payload);
                }
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    tracing::warn!(error = %e, "dropping control link");
                    self.on_link_lost();
                    break;
                }
                Err(e) => tracing::debug!(error = %e, "discarding malformed frame"),
            }
        }
    }

    fn on_link_lost(&mut self) {
        if let Some(link) = self.link.take() {
            self.sockets.remove(&link);
            tracing::info!("lose downstream connection");
        }
        self.registry.on_link_down();
        self.decoder = FrameDecoder::new(self.framing);
    }

    /// Destroys every socket and waits for their writers to finish.
    async fn close(&mut self) {
        self.handshakes.shutdown().await;

        self.registry.destroy_all();
        for handle in self.pool.drain() {
            handle.destroy();
        }
        for tracked in self.sockets.values() {
            tracked.handle.destroy();
        }
        self.sockets.clear();
        self.link = None;

        while self.tasks.join_next().await.is_some() {}
    }
}

//! Client mode implementation for backhaul.
//!
//! The client runs next to the protected internal service. It connects out to
//! the relay's downstream-facing listener and opens a connection to the
//! service for every logical connection the relay announces.
//!
//! With the mux transport a [`Supervisor`] keeps one control link alive and
//! frames carry every connection. With the pool transport a [`Replenisher`]
//! keeps a fixed number of idle links open. When the relay pairs one of them
//! it sends [`PAIRED_SIGNAL`]; the client then connects to the service right
//! away and the link carries that connection exclusively.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

use crate::auth::{answer_challenge, Identity};
use crate::cli::ClientArgs;
use crate::common::Transport;
use crate::error::{Error, Result};
use crate::pool::{Attempt, Replenisher};
use crate::protocol::{FrameDecoder, Framing, Payload, PAIRED_SIGNAL};
use crate::registry::{LinkBinding, Registry, Routed, UnknownIds};
use crate::shutdown::{listen_for_interrupt, Shutdown};
use crate::socket::{spawn_socket, SocketEvent, SocketHandle, SocketId};
use crate::socks::Dialer;
use crate::supervisor::Supervisor;

/// Runs the backhaul client until interrupted.
pub async fn run_client(args: &ClientArgs) -> Result<()> {
    let config = ClientConfig::from_args(args)?;

    print_startup_message(args);

    let shutdown = Shutdown::new();
    let shutdown_rx = shutdown.subscribe();
    let signals = listen_for_interrupt(shutdown, args.shutdown_timeout);

    let result = RelayClient::new(config).run(shutdown_rx).await;
    signals.abort();
    result
}

/// Prints the startup message.
fn print_startup_message(args: &ClientArgs) {
    eprintln!("Starting client...");
    eprintln!("  Relay: {}:{}", args.upstream_ip, args.upstream_port);
    eprintln!("  Service: {}:{}", args.downstream_ip, args.downstream_port);
    eprintln!("  Transport: {:?}", args.transport);
    eprintln!("  Framing: {:?}", args.framing);
    if args.proxy.proxy {
        eprintln!(
            "  Proxy: {}:{}",
            args.proxy.proxy_host.as_deref().unwrap_or_default(),
            args.proxy.proxy_port.unwrap_or_default()
        );
    }
    eprintln!("  Max Pending Downstream: {}", args.max_pending_downstream);
    eprintln!("  Reconnect Interval: {}", humantime::format_duration(args.reconnect_interval));
}

/// Client configuration, resolved from CLI arguments.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_host: String,
    pub relay_port: u16,
    pub service_host: String,
    pub service_port: u16,
    /// Dialer used for connections to the relay.
    pub dialer: Dialer,
    pub identity: Option<Identity>,
    pub transport: Transport,
    pub framing: Framing,
    pub max_pending_downstream: usize,
    pub reconnect_interval: Duration,
    /// Upper bound for one relay dial, proxy exchange included.
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
}

impl ClientConfig {
    pub fn from_args(args: &ClientArgs) -> Result<Self> {
        let identity = args
            .private_key
            .as_deref()
            .map(Identity::from_hex)
            .transpose()?;

        Ok(Self {
            relay_host: args.upstream_ip.clone(),
            relay_port: args.upstream_port,
            service_host: args.downstream_ip.clone(),
            service_port: args.downstream_port,
            dialer: args.proxy.dialer(),
            identity,
            transport: args.transport,
            framing: args.framing,
            max_pending_downstream: args.max_pending_downstream,
            reconnect_interval: args.reconnect_interval,
            connect_timeout: args.connect_timeout,
            auth_timeout: args.auth_timeout,
        })
    }
}

/// The client role.
#[derive(Debug)]
pub struct RelayClient {
    config: ClientConfig,
}

impl RelayClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Runs the event loop until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut state = ClientState::new(self.config, events_tx);
        let mut ticker = state.supervisor.ticker();

        if state.transport == Transport::Pool {
            for attempt in state.replenisher.fill() {
                state.dial_pooled(attempt);
            }
        }

        loop {
            tokio::select! {
                _ = ticker.tick(), if state.transport == Transport::Mux => state.on_tick(),
                Some(event) = events_rx.recv() => state.handle_event(event),
                Some(_) = state.tasks.join_next(), if !state.tasks.is_empty() => {}
                Some(_) = state.dials.join_next(), if !state.dials.is_empty() => {}
                _ = shutdown.recv() => {
                    tracing::info!("client is closing...");
                    break;
                }
            }
        }

        state.close().await;

        tracing::info!("Client shutdown complete");
        Ok(())
    }
}

enum ClientEvent {
    LinkDialed(Result<TcpStream>),
    PooledDialed(Result<TcpStream>),
    ServiceConnected { id: u32, result: Result<TcpStream> },
    Socket(SocketId, SocketEvent),
}

/// What a tracked socket is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketRole {
    /// Shared control link (mux transport).
    Link,
    /// Idle pooled link waiting for the relay to pair it.
    Pooled,
    /// Pooled link carrying connection `id`.
    Bound(u32),
    /// Connection to the internal service for connection `id`.
    Service(u32),
}

struct Tracked {
    handle: SocketHandle,
    role: SocketRole,
}

struct ClientState {
    transport: Transport,
    framing: Framing,
    relay_host: String,
    relay_port: u16,
    service_host: String,
    service_port: u16,
    dialer: Dialer,
    service_dialer: Dialer,
    identity: Option<Identity>,
    connect_timeout: Duration,
    auth_timeout: Duration,
    registry: Registry,
    supervisor: Supervisor,
    replenisher: Replenisher,
    decoder: FrameDecoder,
    link: Option<SocketId>,
    sockets: HashMap<SocketId, Tracked>,
    events: mpsc::UnboundedSender<ClientEvent>,
    tasks: JoinSet<()>,
    dials: JoinSet<()>,
}

/// Connects to the relay and answers its challenge if a key is configured.
async fn dial_relay(
    dialer: Dialer,
    host: String,
    port: u16,
    identity: Option<Identity>,
    connect_timeout: Duration,
    auth_timeout: Duration,
) -> Result<TcpStream> {
    let mut stream = tokio::time::timeout(connect_timeout, dialer.connect(&host, port))
        .await
        .map_err(|_| {
            Error::ConnectFailed(format!(
                "{}:{}: timed out after {}",
                host,
                port,
                humantime::format_duration(connect_timeout)
            ))
        })??;
    if let Some(identity) = identity {
        answer_challenge(&mut stream, &identity, auth_timeout).await?;
    }
    Ok(stream)
}

impl ClientState {
    fn new(config: ClientConfig, events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        let unknown_ids = match config.transport {
            Transport::Mux => UnknownIds::Dial,
            Transport::Pool => UnknownIds::Drop,
        };

        Self {
            transport: config.transport,
            framing: config.framing,
            relay_host: config.relay_host,
            relay_port: config.relay_port,
            service_host: config.service_host,
            service_port: config.service_port,
            dialer: config.dialer,
            service_dialer: Dialer::direct(),
            identity: config.identity,
            connect_timeout: config.connect_timeout,
            auth_timeout: config.auth_timeout,
            registry: Registry::new(config.framing, unknown_ids),
            supervisor: Supervisor::new(config.reconnect_interval),
            replenisher: Replenisher::new(config.max_pending_downstream),
            decoder: FrameDecoder::new(config.framing),
            link: None,
            sockets: HashMap::new(),
            events,
            tasks: JoinSet::new(),
            dials: JoinSet::new(),
        }
    }

    fn track(&mut self, stream: TcpStream, role: SocketRole) -> SocketHandle {
        let handle = spawn_socket(stream, &mut self.tasks, self.events.clone(), ClientEvent::Socket);
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

    fn handle_of(&self, socket: SocketId) -> Option<SocketHandle> {
        self.sockets.get(&socket).map(|tracked| tracked.handle.clone())
    }

    fn on_tick(&mut self) {
        if !self.supervisor.begin_dial() {
            return;
        }
        tracing::debug!(host = %self.relay_host, port = self.relay_port, "connecting to relay");

        let dial = dial_relay(
            self.dialer.clone(),
            self.relay_host.clone(),
            self.relay_port,
            self.identity.clone(),
            self.connect_timeout,
            self.auth_timeout,
        );
        let events = self.events.clone();
        self.dials.spawn(async move {
            let _ = events.send(ClientEvent::LinkDialed(dial.await));
        });
    }

    fn dial_pooled(&mut self, attempt: Attempt) {
        let dial = dial_relay(
            self.dialer.clone(),
            self.relay_host.clone(),
            self.relay_port,
            self.identity.clone(),
            self.connect_timeout,
            self.auth_timeout,
        );
        let events = self.events.clone();
        self.dials.spawn(async move {
            if let Attempt::After(delay) = attempt {
                tokio::time::sleep(delay).await;
            }
            let _ = events.send(ClientEvent::PooledDialed(dial.await));
        });
    }

    fn dial_service(&mut self, id: u32) {
        let dialer = self.service_dialer.clone();
        let host = self.service_host.clone();
        let port = self.service_port;
        let events = self.events.clone();
        self.dials.spawn(async move {
            let result = dialer.connect(&host, port).await;
            let _ = events.send(ClientEvent::ServiceConnected { id, result });
        });
    }

    fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::LinkDialed(result) => self.on_link_dialed(result),
            ClientEvent::PooledDialed(result) => self.on_pooled_dialed(result),
            ClientEvent::ServiceConnected { id, result } => self.on_service_connected(id, result),
            ClientEvent::Socket(socket, event) => self.on_socket_event(socket, event),
        }
    }

    fn on_link_dialed(&mut self, result: Result<TcpStream>) {
        match result {
            Ok(stream) => {
                self.supervisor.established();
                let handle = self.track(stream, SocketRole::Link);
                self.link = Some(handle.id());
                self.decoder = FrameDecoder::new(self.framing);
                self.registry.on_link_up(handle);
                tracing::info!(host = %self.relay_host, port = self.relay_port, "connected to relay");
            }
            Err(e) => {
                self.supervisor.lost();
                tracing::warn!(error = %e, "failed to connect to relay");
            }
        }
    }

    fn on_pooled_dialed(&mut self, result: Result<TcpStream>) {
        match result {
            Ok(stream) => {
                let handle = self.track(stream, SocketRole::Pooled);
                tracing::debug!(socket = handle.id(), "pooled connection established");
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to open pooled connection");
                if let Some(attempt) = self.replenisher.failed() {
                    self.dial_pooled(attempt);
                }
            }
        }
    }

    fn on_service_connected(&mut self, id: u32, result: Result<TcpStream>) {
        match result {
            Ok(stream) => {
                let handle = self.track(stream, SocketRole::Service(id));
                if self.registry.on_local_connected(id, handle.clone()) {
                    tracing::info!(id, "connected to internal service");
                } else {
                    self.sockets.remove(&handle.id());
                    handle.destroy();
                }
            }
            Err(e) => {
                tracing::warn!(id, error = %e, "failed to connect to internal service");
                self.registry.on_local_closed(id);
            }
        }
    }

    fn on_socket_event(&mut self, socket: SocketId, event: SocketEvent) {
        let Some(role) = self.sockets.get(&socket).map(|tracked| tracked.role) else {
            return;
        };

        match (role, event) {
            (SocketRole::Link, SocketEvent::Data(data)) => self.on_link_data(data),
            (SocketRole::Link, SocketEvent::Closed) => self.on_link_lost(),
            (SocketRole::Pooled, SocketEvent::Data(data)) => self.on_pooled_paired(socket, data),
            (SocketRole::Pooled, SocketEvent::Closed) => {
                self.sockets.remove(&socket);
                tracing::debug!(socket, "pooled connection lost before use");
                self.replace_lost_pooled();
            }
            (SocketRole::Bound(id), SocketEvent::Data(data)) => {
                self.registry.route_inbound(id, Payload::Data(data));
            }
            (SocketRole::Bound(id), SocketEvent::Closed) => {
                self.sockets.remove(&socket);
                self.registry.on_link_closed(id);
                tracing::debug!(id, "relay closed pooled connection");
            }
            (SocketRole::Service(id), SocketEvent::Data(data)) => {
                self.registry.on_local_data(id, data);
            }
            (SocketRole::Service(id), SocketEvent::Closed) => {
                self.sockets.remove(&socket);
                self.registry.on_local_closed(id);
                tracing::info!(id, "internal service connection closed");
            }
        }
    }

    /// The relay paired an idle pooled link with a requester.
    fn on_pooled_paired(&mut self, socket: SocketId, mut data: Bytes) {
        let Some(handle) = self.handle_of(socket) else {
            return;
        };
        if data.first() != Some(&PAIRED_SIGNAL) {
            tracing::warn!(socket, "unexpected data on idle pooled connection");
            self.sockets.remove(&socket);
            handle.destroy();
            self.replace_lost_pooled();
            return;
        }
        data.advance(1);

        let id = self.registry.allocate_id();
        self.set_role(socket, SocketRole::Bound(id));
        self.registry
            .insert_connecting(id, LinkBinding::Dedicated(Some(handle)));
        if !data.is_empty() {
            self.registry.route_inbound(id, Payload::Data(data));
        }
        tracing::info!(id, "incoming connection on pooled link");

        // Services that speak first need the connection before any requester byte
        self.dial_service(id);
        if let Some(attempt) = self.replenisher.consumed() {
            self.dial_pooled(attempt);
        }
    }

    fn replace_lost_pooled(&mut self) {
        if let Some(attempt) = self.replenisher.lost() {
            self.dial_pooled(attempt);
        }
    }

    fn on_link_data(&mut self, data: Bytes) {
        self.decoder.extend(data);
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => {
                    if self.registry.route_inbound(frame.id, frame.payload) == Routed::Dial {
                        tracing::info!(id = frame.id, "incoming connection on control link");
                        self.dial_service(frame.id);
                    }
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
            tracing::info!("lose connection to relay");
        }
        self.supervisor.lost();
        self.registry.on_link_down();
        self.decoder = FrameDecoder::new(self.framing);
    }

    /// Destroys every socket and waits for their writers to finish.
    async fn close(&mut self) {
        self.dials.shutdown().await;

        self.registry.destroy_all();
        for tracked in self.sockets.values() {
            tracked.handle.destroy();
        }
        self.sockets.clear();
        self.link = None;

        while self.tasks.join_next().await.is_some() {}
    }
}

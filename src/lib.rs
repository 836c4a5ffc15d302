//! backhaul - Multiplexed, authenticated TCP tunnel between two private
//! networks through a public relay.
//!
//! The relay (`server`) accepts requesting clients on its upstream-facing
//! listener and the private side (`client`) on its downstream-facing listener.
//! Logical connections are carried either as frames over one control link or
//! over a pool of dedicated, pre-opened links.

pub mod auth;
pub mod cli;
pub mod client;
pub mod common;
pub mod error;
pub mod forward;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod socket;
pub mod socks;
pub mod supervisor;

pub use auth::{answer_challenge, challenge_peer, generate_keypair, AuthError, Identity, Verifier};
pub use cli::{BuildInfo, Cli, ClientArgs, Command, ForwardArgs, ProxyArgs, ServerArgs};
pub use client::{run_client, ClientConfig, RelayClient};
pub use common::{DnsResolver, Transport, READ_BUFFER_SIZE};
pub use error::{Error, ExitCode, Result};
pub use forward::{run_forward, Forwarder};
pub use pool::{PendingPool, Replenisher};
pub use protocol::{
    Frame, FrameDecoder, Framing, Payload, ProtocolError, ProtocolResult, PAIRED_SIGNAL,
};
pub use registry::{LinkBinding, Registry, Routed, UnknownIds};
pub use server::{run_server, RelayServer, ServerConfig};
pub use shutdown::Shutdown;
pub use socket::{SocketEvent, SocketHandle};
pub use socks::{Dialer, ProxyConfig, SocksError};
pub use supervisor::{LinkState, Supervisor};

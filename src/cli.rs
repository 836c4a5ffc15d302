//! CLI definitions for backhaul.

use clap::{builder::PossibleValuesParser, Args, Parser, Subcommand};
use std::time::Duration;

use crate::auth::KEY_SIZE;
use crate::common::Transport;
use crate::protocol::Framing;
use crate::socks::{Dialer, ProxyConfig};

/// Default bind address for the relay listeners.
pub const DEFAULT_BINDING_IP: &str = "127.0.0.1";

/// Default number of unpaired pooled connections.
pub const DEFAULT_MAX_PENDING_DOWNSTREAM: usize = 5;

/// Parse a duration from a human-readable string.
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Accepts a hex-encoded 32-byte key.
fn parse_hex_key(s: &str) -> Result<String, String> {
    let key = s.trim();
    if key.len() != KEY_SIZE * 2 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("expected {} hex characters", KEY_SIZE * 2));
    }
    Ok(key.to_ascii_lowercase())
}

/// Multiplexed, authenticated TCP tunnel between two private networks.
#[derive(Debug, Parser)]
#[command(name = "backhaul")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, global = true, default_value = "info", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the public relay (upstream-facing and downstream-facing listeners)
    Server(ServerArgs),

    /// Run the private side, connecting the relay to an internal service
    Client(ClientArgs),

    /// Forward one TCP port to another, optionally through a SOCKS5 proxy
    Forward(ForwardArgs),

    /// Generate an Ed25519 keypair
    Keygen,

    /// Show version information
    Version,
}

/// Arguments for the server subcommand.
#[derive(Debug, Parser)]
pub struct ServerArgs {
    /// Port requesting clients connect to
    #[arg(long)]
    pub upstream_port: u16,

    /// Port the client role connects to
    #[arg(long)]
    pub downstream_port: u16,

    /// Upstream-facing binding IP address
    #[arg(long, default_value = DEFAULT_BINDING_IP)]
    pub upstream_ip: String,

    /// Downstream-facing binding IP address
    #[arg(long, default_value = DEFAULT_BINDING_IP)]
    pub downstream_ip: String,

    /// Binding IP address for both listeners (overrides --upstream-ip and --downstream-ip)
    #[arg(long)]
    pub binding_ip: Option<String>,

    /// Ed25519 public key (hex); enables the challenge-response handshake
    #[arg(long, value_parser = parse_hex_key)]
    pub public_key: Option<String>,

    /// Physical link layout between the relay roles
    #[arg(long, value_enum, default_value_t = Transport::Pool)]
    pub transport: Transport,

    /// Wire framing on the shared control link
    #[arg(long, value_enum, default_value_t = Framing::LengthPrefixed)]
    pub framing: Framing,

    /// Max number of unpaired downstream connections
    #[arg(long, default_value_t = DEFAULT_MAX_PENDING_DOWNSTREAM)]
    pub max_pending_downstream: usize,

    /// Time allowed for a peer to answer the challenge
    #[arg(long, value_parser = parse_duration, default_value = "1s")]
    pub auth_timeout: Duration,

    /// Time allowed for graceful shutdown before forcing exit
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub shutdown_timeout: Duration,
}

impl ServerArgs {
    /// Effective upstream-facing binding IP.
    pub fn upstream_binding_ip(&self) -> &str {
        self.binding_ip.as_deref().unwrap_or(&self.upstream_ip)
    }

    /// Effective downstream-facing binding IP.
    pub fn downstream_binding_ip(&self) -> &str {
        self.binding_ip.as_deref().unwrap_or(&self.downstream_ip)
    }
}

/// SOCKS5 proxy options.
#[derive(Debug, Clone, Args)]
pub struct ProxyArgs {
    /// Connect through a SOCKS5 proxy
    #[arg(long, default_value_t = false, requires_all = ["proxy_host", "proxy_port"])]
    pub proxy: bool,

    /// Proxy host
    #[arg(long)]
    pub proxy_host: Option<String>,

    /// Proxy port
    #[arg(long)]
    pub proxy_port: Option<u16>,

    /// Proxy username
    #[arg(long)]
    pub proxy_username: Option<String>,

    /// Proxy password
    #[arg(long)]
    pub proxy_password: Option<String>,
}

impl ProxyArgs {
    /// Builds the dialer for outbound connections.
    pub fn dialer(&self) -> Dialer {
        match (self.proxy, &self.proxy_host, self.proxy_port) {
            (true, Some(host), Some(port)) => Dialer::socks5(ProxyConfig {
                host: host.clone(),
                port,
                username: self.proxy_username.clone(),
                password: self.proxy_password.clone(),
            }),
            _ => Dialer::direct(),
        }
    }
}

/// Arguments for the client subcommand.
#[derive(Debug, Parser)]
pub struct ClientArgs {
    /// Relay host (its downstream-facing listener)
    #[arg(long)]
    pub upstream_ip: String,

    /// Relay port (its downstream-facing listener)
    #[arg(long)]
    pub upstream_port: u16,

    /// Internal service host
    #[arg(long, default_value = DEFAULT_BINDING_IP)]
    pub downstream_ip: String,

    /// Internal service port
    #[arg(long)]
    pub downstream_port: u16,

    #[command(flatten)]
    pub proxy: ProxyArgs,

    /// Ed25519 private key (hex); answers the relay's challenge
    #[arg(long, value_parser = parse_hex_key)]
    pub private_key: Option<String>,

    /// Physical link layout between the relay roles
    #[arg(long, value_enum, default_value_t = Transport::Pool)]
    pub transport: Transport,

    /// Wire framing on the shared control link
    #[arg(long, value_enum, default_value_t = Framing::LengthPrefixed)]
    pub framing: Framing,

    /// Number of pooled connections kept open
    #[arg(long, default_value_t = DEFAULT_MAX_PENDING_DOWNSTREAM)]
    pub max_pending_downstream: usize,

    /// Interval between control link reconnection attempts
    #[arg(long, value_parser = parse_duration, default_value = "1s")]
    pub reconnect_interval: Duration,

    /// Time allowed to open a connection to the relay, proxy included
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub connect_timeout: Duration,

    /// Time allowed to receive and answer the challenge
    #[arg(long, value_parser = parse_duration, default_value = "1s")]
    pub auth_timeout: Duration,

    /// Time allowed for graceful shutdown before forcing exit
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub shutdown_timeout: Duration,
}

/// Arguments for the forward subcommand.
#[derive(Debug, Parser)]
pub struct ForwardArgs {
    /// Listen port
    #[arg(long)]
    pub listen_port: u16,

    /// Forward port
    #[arg(long)]
    pub forward_port: u16,

    /// Binding IP address
    #[arg(long)]
    pub binding_ip: String,

    /// Forward host
    #[arg(long)]
    pub forward_ip: String,

    #[command(flatten)]
    pub proxy: ProxyArgs,

    /// Time allowed for graceful shutdown before forcing exit
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub shutdown_timeout: Duration,
}

/// Build information for version command.
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub built: &'static str,
}

impl BuildInfo {
    /// Returns build information from environment variables or defaults.
    pub fn get() -> Self {
        Self {
            version: option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
            commit: option_env!("BACKHAUL_COMMIT").unwrap_or("unknown"),
            built: option_env!("BACKHAUL_BUILD_DATE").unwrap_or("unknown"),
        }
    }

    /// Format version output.
    pub fn format(&self) -> String {
        format!(
            "backhaul version {}\n  commit: {}\n  built:  {}",
            self.version, self.commit, self.built
        )
    }
}

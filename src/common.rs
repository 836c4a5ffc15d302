//! Common types and functions shared across the server, client and forward
//! modes.

use crate::error::{Error, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Buffer size for reading data from TCP sockets.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Transport used between the two relay roles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Transport {
    /// One control link carrying every connection as framed messages.
    Mux,
    /// One pre-opened, dedicated socket per connection.
    #[default]
    Pool,
}

/// Builds a listen address from an IP string and port.
pub fn listen_address(ip: &str, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| Error::Config(format!("invalid listen address '{}'", ip)))?;
    Ok(SocketAddr::new(ip, port))
}

/// Binds a TCP listener, mapping failures to [`Error::ListenFailed`].
pub async fn bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ListenFailed(format!("{}: {}", addr, e)))
}

type TokioResolver =
    hickory_resolver::Resolver<hickory_resolver::name_server::TokioConnectionProvider>;

/// Shared DNS resolver, lazily initialized and reused across resolutions.
#[derive(Clone)]
pub struct DnsResolver {
    resolver: Arc<Mutex<Option<TokioResolver>>>,
}

impl DnsResolver {
    /// Creates a new DNS resolver.
    pub fn new() -> Self {
        Self {
            resolver: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolves a hostname to a SocketAddr asynchronously using hickory-resolver.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        // First try parsing as IP address
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let mut resolver_guard = self.resolver.lock().await;
        if resolver_guard.is_none() {
            let resolver = hickory_resolver::Resolver::builder_tokio()
                .map_err(|e| Error::Config(format!("failed to create DNS resolver: {}", e)))?
                .build();
            *resolver_guard = Some(resolver);
        }
        let Some(resolver) = resolver_guard.as_ref() else {
            return Err(Error::Config("DNS resolver unavailable".to_string()));
        };

        let response = resolver
            .lookup_ip(host)
            .await
            .map_err(|e| Error::Config(format!("failed to resolve '{}': {}", host, e)))?;

        response
            .iter()
            .next()
            .map(|ip| SocketAddr::new(ip, port))
            .ok_or_else(|| Error::Config(format!("no addresses found for '{}'", host)))
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver").finish_non_exhaustive()
    }
}

//! Outbound dialing, directly or through a SOCKS5 proxy (RFC 1928, with
//! RFC 1929 username/password authentication).

use std::net::IpAddr;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::common::DnsResolver;
use crate::error::{Error, Result};

const SOCKS5_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const USER_PASS_VERSION: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;

/// SOCKS5 client errors.
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("invalid SOCKS version: {0:#04x}")]
    InvalidVersion(u8),

    #[error("proxy accepted no offered authentication method")]
    NoAcceptableMethods,

    #[error("proxy rejected credentials")]
    AuthRejected,

    #[error("{0} longer than 255 bytes")]
    FieldTooLong(&'static str),

    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("proxy refused CONNECT: {}", reply_message(.0))]
    ConnectRefused(u8),

    #[error("proxy I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn reply_message(code: &u8) -> &'static str {
    match *code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// SOCKS5 proxy settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (None, None) => None,
            (username, password) => Some((
                username.as_deref().unwrap_or_default(),
                password.as_deref().unwrap_or_default(),
            )),
        }
    }
}

/// Socket factory for every outbound connection.
#[derive(Debug, Clone)]
pub enum Dialer {
    Direct(DnsResolver),
    Socks5 {
        proxy: ProxyConfig,
        resolver: DnsResolver,
    },
}

impl Dialer {
    pub fn direct() -> Self {
        Dialer::Direct(DnsResolver::new())
    }

    pub fn socks5(proxy: ProxyConfig) -> Self {
        Dialer::Socks5 {
            proxy,
            resolver: DnsResolver::new(),
        }
    }

    /// Opens a TCP connection to `host:port`.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        match self {
            Dialer::Direct(resolver) => {
                let addr = resolver.resolve(host, port).await?;
                TcpStream::connect(addr)
                    .await
                    .map_err(|e| Error::ConnectFailed(format!("{}: {}", addr, e)))
            }
            Dialer::Socks5 { proxy, resolver } => {
                let proxy_addr = resolver.resolve(&proxy.host, proxy.port).await?;
                let mut stream = TcpStream::connect(proxy_addr).await.map_err(|e| {
                    Error::ConnectFailed(format!("proxy {}: {}", proxy_addr, e))
                })?;
                socks5_connect(&mut stream, host, port, proxy.credentials()).await?;
                tracing::debug!(%proxy_addr, host, port, "connected through SOCKS5 proxy");
                Ok(stream)
            }
        }
    }
}

/// Runs the client side of a SOCKS5 CONNECT on an open proxy connection.
///
/// Domain names are passed to the proxy unresolved.
pub async fn socks5_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<(&str, &str)>,
) -> std::result::Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Method negotiation
    if credentials.is_some() {
        stream
            .write_all(&[SOCKS5_VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS])
            .await?;
    } else {
        stream.write_all(&[SOCKS5_VERSION, 1, METHOD_NO_AUTH]).await?;
    }

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(SocksError::InvalidVersion(choice[0]));
    }

    match (choice[1], credentials) {
        (METHOD_NO_AUTH, _) => {}
        (METHOD_USER_PASS, Some((username, password))) => {
            authenticate(stream, username, password).await?;
        }
        _ => return Err(SocksError::NoAcceptableMethods),
    }

    // CONNECT request
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let domain = host.as_bytes();
            let len = u8::try_from(domain.len()).map_err(|_| SocksError::FieldTooLong("domain"))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(domain);
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    // VER REP RSV ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(SocksError::InvalidVersion(header[0]));
    }
    if header[1] != REPLY_SUCCEEDED {
        return Err(SocksError::ConnectRefused(header[1]));
    }

    // Bound address is not needed; consume it
    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(SocksError::UnsupportedAddressType(other)),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

async fn authenticate<S>(
    stream: &mut S,
    username: &str,
    password: &str,
) -> std::result::Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ulen = u8::try_from(username.len()).map_err(|_| SocksError::FieldTooLong("username"))?;
    let plen = u8::try_from(password.len()).map_err(|_| SocksError::FieldTooLong("password"))?;

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(USER_PASS_VERSION);
    request.push(ulen);
    request.extend_from_slice(username.as_bytes());
    request.push(plen);
    request.extend_from_slice(password.as_bytes());
    stream.write_all(&request).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(SocksError::AuthRejected);
    }
    Ok(())
}

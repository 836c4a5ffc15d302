//! Forward mode: a plain 1:1 TCP port forwarder.
//!
//! Every accepted connection gets its own outbound connection (direct or
//! through SOCKS5) and the two are spliced until either side closes.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::cli::ForwardArgs;
use crate::common::{bind_listener, listen_address};
use crate::error::Result;
use crate::shutdown::{listen_for_interrupt, Shutdown};
use crate::socks::Dialer;

/// Runs the forwarder until interrupted.
pub async fn run_forward(args: &ForwardArgs) -> Result<()> {
    let listen_addr = listen_address(&args.binding_ip, args.listen_port)?;
    let forwarder = Forwarder::bind(
        listen_addr,
        args.forward_ip.clone(),
        args.forward_port,
        args.proxy.dialer(),
    )
    .await?;

    eprintln!("Starting forwarder...");
    eprintln!("  Listen: {}", forwarder.local_addr());
    eprintln!("  Forward: {}:{}", args.forward_ip, args.forward_port);

    let shutdown = Shutdown::new();
    let shutdown_rx = shutdown.subscribe();
    let signals = listen_for_interrupt(shutdown, args.shutdown_timeout);

    let result = forwarder.run(shutdown_rx).await;
    signals.abort();
    result
}

/// Bound forwarder, ready to run.
#[derive(Debug)]
pub struct Forwarder {
    listener: TcpListener,
    local_addr: SocketAddr,
    target_host: String,
    target_port: u16,
    dialer: Dialer,
}

impl Forwarder {
    pub async fn bind(
        listen_addr: SocketAddr,
        target_host: String,
        target_port: u16,
        dialer: Dialer,
    ) -> Result<Self> {
        let listener = bind_listener(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, target = %target_host, target_port, "forward server is listening");

        Ok(Self {
            listener,
            local_addr,
            target_host,
            target_port,
            dialer,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts and forwards connections until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((inbound, remote)) => {
                        tracing::info!(%remote, "incoming connection");
                        connections.spawn(forward(
                            inbound,
                            remote,
                            self.dialer.clone(),
                            self.target_host.clone(),
                            self.target_port,
                        ));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.recv() => {
                    tracing::info!("forward server is closing...");
                    break;
                }
            }
        }

        drop(self.listener);
        // Dropping the tasks closes both sockets of every connection
        connections.shutdown().await;

        tracing::info!("Forwarder shutdown complete");
        Ok(())
    }
}

async fn forward(
    mut inbound: TcpStream,
    remote: SocketAddr,
    dialer: Dialer,
    host: String,
    port: u16,
) {
    let mut outbound = match dialer.connect(&host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(%remote, error = %e, "forward connection failed");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
        Ok((sent, received)) => {
            tracing::info!(%remote, sent, received, "connection closed");
        }
        Err(e) => {
            tracing::debug!(%remote, error = %e, "connection closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_forwards_both_directions() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let forwarder = Forwarder::bind(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1".to_string(),
            target_addr.port(),
            Dialer::direct(),
        )
        .await
        .unwrap();
        let listen_addr = forwarder.local_addr();

        let shutdown = Shutdown::new();
        let handle = tokio::spawn(forwarder.run(shutdown.subscribe()));

        let mut client = TcpStream::connect(listen_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello");

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_target_closes_inbound() {
        // Grab a free port, then release it so nothing listens there
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = unused.local_addr().unwrap().port();
        drop(unused);

        let forwarder = Forwarder::bind(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1".to_string(),
            dead_port,
            Dialer::direct(),
        )
        .await
        .unwrap();
        let listen_addr = forwarder.local_addr();

        let shutdown = Shutdown::new();
        let _handle = tokio::spawn(forwarder.run(shutdown.subscribe()));

        let mut client = TcpStream::connect(listen_addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}

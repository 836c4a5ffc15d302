//! Shutdown coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::ExitCode;

/// Coordinator for graceful shutdown.
///
/// Event loops subscribe to the broadcast channel; the first
/// [`Shutdown::trigger`] wins and later ones are ignored.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal. Returns true only for the first call.
    pub fn trigger(&self) -> bool {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(());
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Force-exits the process with [`ExitCode::Failure`] after `grace`.
pub fn spawn_watchdog(grace: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        tracing::error!(
            timeout = %humantime::format_duration(grace),
            "graceful shutdown timed out, forcing exit"
        );
        std::process::exit(ExitCode::Failure.into());
    })
}

/// Triggers `shutdown` on the first interrupt and arms the watchdog.
///
/// Further interrupts are ignored. Abort the returned task once the event
/// loop has finished.
pub fn listen_for_interrupt(shutdown: Shutdown, grace: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for interrupt");
                return;
            }
            if shutdown.trigger() {
                tracing::info!("received interrupt, shutting down");
                spawn_watchdog(grace);
            } else {
                tracing::debug!("shutdown already in progress");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_only_once() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert!(!shutdown.is_triggered());

        assert!(shutdown.trigger());
        assert!(!shutdown.clone().trigger());
        assert!(shutdown.is_triggered());

        rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let shutdown = Shutdown::new();
        let other = shutdown.clone();
        let mut rx = other.subscribe();

        shutdown.trigger();
        assert!(other.is_triggered());
        rx.recv().await.unwrap();
    }
}

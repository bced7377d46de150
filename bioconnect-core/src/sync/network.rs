//! Connectivity transitions consumed by the sync engine.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info};

/// Publishes connectivity state. Subscribers only wake on transitions.
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    pub fn new(initially_connected: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_connected);
        Self { tx }
    }

    /// Record the current connectivity. Returns `true` on a transition.
    pub fn set_connected(&self, connected: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == connected {
                return false;
            }
            *current = connected;
            true
        });
        if changed {
            info!(
                "Connectivity {}",
                if connected { "regained" } else { "lost" }
            );
        }
        changed
    }

    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Periodically probe `addr` with a TCP connect and publish the result.
    pub fn spawn_probe(&self, addr: String, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reachable = matches!(
                    time::timeout(interval, TcpStream::connect(&addr)).await,
                    Ok(Ok(_))
                );
                debug!("Probe {} reachable={}", addr, reachable);
                monitor.set_connected(reachable);
            }
        })
    }
}

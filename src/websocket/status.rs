use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Fans connected/disconnected transitions out to any number of listeners.
///
/// Listeners register with [`listen`](Self::listen) and unregister by dropping
/// the returned [`StatusListener`]. Each listener sees events in publish order.
pub struct StatusBroadcaster {
    tx: broadcast::Sender<bool>,
    current: AtomicBool,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            tx,
            current: AtomicBool::new(false),
        }
    }

    pub fn publish(&self, connected: bool) {
        self.current.store(connected, Ordering::SeqCst);
        // No listeners is fine.
        let delivered = self.tx.send(connected).unwrap_or(0);
        trace!("Status {} delivered to {} listeners", connected, delivered);
    }

    pub fn listen(&self) -> StatusListener {
        StatusListener {
            rx: self.tx.subscribe(),
        }
    }

    /// Last published value.
    pub fn current(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct StatusListener {
    rx: broadcast::Receiver<bool>,
}

impl StatusListener {
    /// Next status event. `None` once the broadcaster is gone.
    ///
    /// A listener that fell behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<bool> {
        loop {
            match self.rx.recv().await {
                Ok(status) => return Some(status),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Status listener lagged, skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Waits until `wanted` is published, giving up after `within`.
    pub async fn wait_for(&mut self, wanted: bool, within: Duration) -> bool {
        tokio::time::timeout(within, async {
            while let Some(status) = self.recv().await {
                if status == wanted {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }
}

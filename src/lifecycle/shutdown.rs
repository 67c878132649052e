//! Shutdown coordination.
//!
//! A broadcast channel fans the shutdown signal out to the accept loop and
//! every running session. Handles are cheap to clone and can be subscribed
//! to from any task.

use tokio::sync::broadcast;

/// Cloneable shutdown signal.
#[derive(Debug)]
pub struct Shutdown {
    sender: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    /// Signals all subscribers. Safe to call more than once.
    pub fn trigger(&self) {
        let _ = self.sender.send(());
    }

    /// Creates a receiver that resolves when shutdown is triggered.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_subscriber() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        shutdown.trigger();
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_signal() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut rx = shutdown.subscribe();
        assert!(rx.try_recv().is_err());
    }
}

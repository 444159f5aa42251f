// Direct same-device channel: an in-process broadcast hub every session of the
// origin attaches to.

use anyhow::Result;
use tokio::sync::broadcast;

use super::SignalTransport;

/// Messages buffered per subscriber before a slow one starts losing messages.
pub const DEFAULT_HUB_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ChannelHub {
    tx: broadcast::Sender<String>,
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(DEFAULT_HUB_CAPACITY)
    }
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl SignalTransport for ChannelHub {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn send(&self, raw: String) -> Result<()> {
        // Zero receivers only means no peer is listening right now.
        let _ = self.tx.send(raw);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

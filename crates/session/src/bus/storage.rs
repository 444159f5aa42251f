// Storage fallback transport.
//
// Publishing writes `{ message, ts, nonce }` under a fresh Lease Store key per
// message, so a store that batches change notifications never coalesces two
// signals. Peers pick records up from the store's change notifications and
// unwrap `message`, which is the exact JSON the direct channel would have
// carried. Senders delete their own records once they are older than
// `SIGNAL_RETENTION`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::SignalTransport;
use crate::store::{LeaseStore, StoreChange};

/// Prefix of the Lease Store keys the fallback transport writes through.
pub const SIGNAL_KEY_PREFIX: &str = "concord.signal.";

/// How long a written signal stays in the store for slow pollers.
pub const SIGNAL_RETENTION: Duration = Duration::from_secs(5);

const FORWARD_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredSignal {
    message: String,
    ts: i64,
    /// Makes consecutive identical messages distinct writes.
    nonce: Uuid,
}

pub struct StorageTransport {
    store: Arc<dyn LeaseStore>,
    forward_tx: broadcast::Sender<String>,
    forwarder: JoinHandle<()>,
    /// Keys written by this transport, oldest first.
    written: Mutex<VecDeque<(i64, String)>>,
}

impl StorageTransport {
    /// Attach to `store`. Must be called inside a tokio runtime.
    pub fn start(store: Arc<dyn LeaseStore>) -> Self {
        let (forward_tx, _) = broadcast::channel(FORWARD_CAPACITY);
        let forwarder = tokio::spawn(forward_store_changes(store.watch(), forward_tx.clone()));
        Self { store, forward_tx, forwarder, written: Mutex::new(VecDeque::new()) }
    }

    /// Number of this transport's records still in the store.
    pub fn retained(&self) -> usize {
        self.written.lock().map(|written| written.len()).unwrap_or(0)
    }

    fn prune_written(&self, now: i64) {
        let cutoff = now - i64::try_from(SIGNAL_RETENTION.as_millis()).unwrap_or(i64::MAX);
        let expired: Vec<String> = match self.written.lock() {
            Ok(mut written) => {
                let mut expired = Vec::new();
                while written.front().is_some_and(|(ts, _)| *ts < cutoff) {
                    if let Some((_, key)) = written.pop_front() {
                        expired.push(key);
                    }
                }
                expired
            }
            Err(_) => return,
        };
        for key in expired {
            if let Err(error) = self.store.remove(&key) {
                debug!(key = %key, error = %error, "failed to remove expired stored signal");
            }
        }
    }
}

fn signal_key(ts: i64, nonce: Uuid) -> String {
    format!("{SIGNAL_KEY_PREFIX}{ts:013}.{nonce}")
}

impl Drop for StorageTransport {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

impl SignalTransport for StorageTransport {
    fn name(&self) -> &'static str {
        "storage"
    }

    fn send(&self, raw: String) -> Result<()> {
        let ts = chrono::Utc::now().timestamp_millis();
        let record = StoredSignal { message: raw, ts, nonce: Uuid::new_v4() };
        let key = signal_key(ts, record.nonce);
        let encoded = serde_json::to_string(&record).context("failed to encode stored signal")?;
        self.store.set(&key, &encoded).context("failed to write stored signal")?;

        if let Ok(mut written) = self.written.lock() {
            written.push_back((ts, key));
        }
        self.prune_written(ts);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.forward_tx.subscribe()
    }
}

async fn forward_store_changes(
    mut changes: broadcast::Receiver<StoreChange>,
    forward_tx: broadcast::Sender<String>,
) {
    loop {
        match changes.recv().await {
            Ok(StoreChange { key, value: Some(value) }) if key.starts_with(SIGNAL_KEY_PREFIX) => {
                match serde_json::from_str::<StoredSignal>(&value) {
                    Ok(stored) => {
                        let _ = forward_tx.send(stored.message);
                    }
                    Err(error) => debug!(error = %error, "ignoring malformed stored signal"),
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "storage transport lagged behind lease store changes");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// Leader-only refresh poller.
//
// Only the elected session polls the server for watched records. When a
// record's version moves (a write from another device, or a peer whose
// invalidation was lost) the leader announces it to every session. If
// leadership flaps two sessions may both poll for a while; that only costs
// an extra request.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{ClientError, RecordClient};
use crate::invalidation::InvalidationRelay;
use crate::leader::LeaderPhase;

type WatchedRecords = BTreeMap<(String, String), Option<i64>>;

pub struct RecordPoller {
    inner: Arc<PollerInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct PollerInner {
    client: RecordClient,
    relay: InvalidationRelay,
    /// `(type, id)` to last version seen by this session.
    watched: Mutex<WatchedRecords>,
}

impl RecordPoller {
    /// Poll every `interval` while `leader` reports leadership.
    pub fn spawn(
        client: RecordClient,
        relay: InvalidationRelay,
        leader: watch::Receiver<LeaderPhase>,
        interval: Duration,
    ) -> Self {
        let inner = Arc::new(PollerInner { client, relay, watched: Mutex::new(BTreeMap::new()) });
        let task = tokio::spawn(poll_loop(inner.clone(), leader, interval));
        Self { inner, task: Mutex::new(Some(task)) }
    }

    pub fn watch_record(&self, resource_type: &str, id: &str) {
        if let Ok(mut watched) = self.inner.watched.lock() {
            watched.entry((resource_type.to_owned(), id.to_owned())).or_insert(None);
        }
    }

    pub fn unwatch_record(&self, resource_type: &str, id: &str) {
        if let Ok(mut watched) = self.inner.watched.lock() {
            watched.remove(&(resource_type.to_owned(), id.to_owned()));
        }
    }

    /// Last version observed for a watched record.
    pub fn last_seen_version(&self, resource_type: &str, id: &str) -> Option<i64> {
        let watched = self.inner.watched.lock().ok()?;
        watched.get(&(resource_type.to_owned(), id.to_owned())).copied().flatten()
    }

    /// One polling pass regardless of leadership. Returns how many records
    /// were announced as changed.
    pub async fn poll_once(&self) -> usize {
        self.inner.poll_once().await
    }

    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

impl Drop for RecordPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PollerInner {
    async fn poll_once(&self) -> usize {
        let targets: Vec<(String, String)> = self
            .watched
            .lock()
            .map(|watched| watched.keys().cloned().collect())
            .unwrap_or_default();

        let mut changed = 0;
        for (resource_type, id) in targets {
            let current = match self.client.get(&resource_type, &id).await {
                Ok(record) => record.version,
                Err(ClientError::NotFound) => {
                    debug!(resource_type = %resource_type, id = %id, "watched record does not exist yet");
                    continue;
                }
                Err(error) => {
                    warn!(resource_type = %resource_type, id = %id, error = %error, "record poll failed");
                    continue;
                }
            };

            let previous = match self.watched.lock() {
                Ok(mut watched) => match watched.get_mut(&(resource_type.clone(), id.clone())) {
                    Some(slot) => slot.replace(current),
                    // Unwatched while the request was in flight.
                    None => continue,
                },
                Err(_) => continue,
            };

            if previous.is_some_and(|previous| previous != current) {
                info!(
                    resource_type = %resource_type,
                    id = %id,
                    ?previous,
                    current,
                    "record changed on server"
                );
                self.relay.mark_stale(&resource_type, Some(&id));
                self.relay.notify_changed(&resource_type, Some(&id));
                changed += 1;
            }
        }
        changed
    }
}

async fn poll_loop(inner: Arc<PollerInner>, leader: watch::Receiver<LeaderPhase>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let phase = *leader.borrow();
        if phase == LeaderPhase::Resigned {
            debug!("leader resigned, stopping record poller");
            break;
        }
        if !phase.is_leader() {
            continue;
        }
        inner.poll_once().await;
    }
}

// Leader election among the sessions of one origin.
//
// The leader holds a TTL lease in the Lease Store and renews it on every
// heartbeat, verifying it is still the recorded holder. Followers re-check
// after TTL + margin, or immediately when the lease key is removed.
// Leadership is a hint for who does background work, never a guarantee.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use concord_common::protocol::lease::{LeaseRecord, LEADER_LEASE_KEY};
use concord_common::protocol::signal::Signal;
use concord_common::types::SessionId;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{SignalBus, Subscription};
use crate::store::{LeaseStore, StoreChange};

// ── Leader state ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderPhase {
    /// Another session holds the lease, or nobody has tried yet.
    Unclaimed,
    /// Reading the lease and attempting to write ourselves in.
    Claiming,
    Leader,
    /// Leader, in the middle of a heartbeat renewal.
    Renewing,
    /// Stepped down for good; the coordinator is shut down.
    Resigned,
}

impl LeaderPhase {
    pub fn is_leader(self) -> bool {
        matches!(self, Self::Leader | Self::Renewing)
    }
}

/// Last `LEADER_HEARTBEAT` observed from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedHeartbeat {
    pub session_id: SessionId,
    pub ts: i64,
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub lease_key: String,
    /// A lease not renewed for this long is abandoned.
    pub ttl: Duration,
    /// How often the leader renews (must be well under the TTL).
    pub heartbeat_interval: Duration,
    /// Extra wait on top of the TTL before a follower re-checks.
    pub recheck_margin: Duration,
}

impl LeaderConfig {
    pub fn new(ttl: Duration) -> Self {
        Self {
            lease_key: LEADER_LEASE_KEY.to_owned(),
            ttl,
            heartbeat_interval: ttl / 3,
            recheck_margin: Duration::from_secs(1),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_recheck_margin(mut self, margin: Duration) -> Self {
        self.recheck_margin = margin;
        self
    }

    fn follower_recheck(&self) -> Duration {
        self.ttl + self.recheck_margin
    }
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

// ── Coordinator ─────────────────────────────────────────────────────

/// Per-session election participant. Created once at session start.
pub struct LeaderCoordinator {
    inner: Arc<LeaderInner>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    _heartbeats: Subscription,
}

struct LeaderInner {
    config: LeaderConfig,
    session_id: SessionId,
    store: Arc<dyn LeaseStore>,
    bus: SignalBus,
    state_tx: watch::Sender<LeaderPhase>,
    is_leader: AtomicBool,
    /// Epoch millis of our last successful claim or renewal.
    last_renewed_ms: AtomicI64,
    last_heartbeat: Mutex<Option<ObservedHeartbeat>>,
    recheck: Notify,
}

/// Start the election loop for `bus`'s session. Must be called inside a
/// tokio runtime.
pub fn start_leader_election(
    config: LeaderConfig,
    store: Arc<dyn LeaseStore>,
    bus: SignalBus,
) -> LeaderCoordinator {
    let (state_tx, _) = watch::channel(LeaderPhase::Unclaimed);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let inner = Arc::new(LeaderInner {
        config,
        session_id: bus.session_id(),
        store,
        bus: bus.clone(),
        state_tx,
        is_leader: AtomicBool::new(false),
        last_renewed_ms: AtomicI64::new(0),
        last_heartbeat: Mutex::new(None),
        recheck: Notify::new(),
    });

    let heartbeat_inner = Arc::downgrade(&inner);
    let heartbeats = bus.subscribe(move |envelope| {
        if let Signal::LeaderHeartbeat { ts } = envelope.signal {
            if let Some(inner) = heartbeat_inner.upgrade() {
                inner.observe_heartbeat(envelope.session_id, ts);
            }
        }
        Ok(())
    });

    let changes = inner.store.watch();
    let task = tokio::spawn(leader_loop(inner.clone(), changes, shutdown_rx));

    LeaderCoordinator {
        inner,
        shutdown_tx,
        task: Mutex::new(Some(task)),
        _heartbeats: heartbeats,
    }
}

impl LeaderCoordinator {
    /// Last known leadership. A hint for policy decisions only.
    pub fn is_leader(&self) -> bool {
        self.inner.is_leader.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> LeaderPhase {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaderPhase> {
        self.inner.state_tx.subscribe()
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    pub fn last_heartbeat_from(&self) -> Option<ObservedHeartbeat> {
        self.inner.last_heartbeat.lock().ok().and_then(|guard| *guard)
    }

    /// Stop the loop and, if leader, remove our lease so a peer can claim
    /// without waiting for the TTL.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = task.await;
        }

        self.inner.release_own_lease();
        self.inner.set_phase(LeaderPhase::Resigned);
    }
}

impl Drop for LeaderCoordinator {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl LeaderInner {
    fn set_phase(&self, phase: LeaderPhase) {
        let was_leader = self.is_leader.swap(phase.is_leader(), Ordering::SeqCst);
        let previous = self.state_tx.send_replace(phase);
        if previous != phase {
            debug!(session_id = %self.session_id, ?previous, ?phase, "leader phase changed");
        }
        if was_leader && !phase.is_leader() {
            info!(session_id = %self.session_id, lease = %self.config.lease_key, "stepped down as leader");
        }
    }

    fn observe_heartbeat(&self, session_id: SessionId, ts: i64) {
        if let Ok(mut last) = self.last_heartbeat.lock() {
            *last = Some(ObservedHeartbeat { session_id, ts });
        }
        // Someone else believes they lead: verify our lease now instead of at
        // the next heartbeat.
        if self.is_leader.load(Ordering::SeqCst) {
            self.recheck.notify_one();
        }
    }

    fn read_lease(&self) -> anyhow::Result<(Option<String>, Option<LeaseRecord>)> {
        let raw = self.store.get(&self.config.lease_key)?;
        let record = raw.as_deref().and_then(|raw| match LeaseRecord::decode(raw) {
            Ok(record) => Some(record),
            Err(error) => {
                warn!(lease = %self.config.lease_key, error = %error, "ignoring corrupt lease record");
                None
            }
        });
        Ok((raw, record))
    }

    /// One election attempt. Returns how long to wait before the next step.
    fn try_claim(&self) -> Duration {
        self.set_phase(LeaderPhase::Claiming);
        let now = now_millis();

        let (raw, record) = match self.read_lease() {
            Ok(lease) => lease,
            Err(error) => {
                warn!(lease = %self.config.lease_key, error = %error, "lease read failed");
                self.set_phase(LeaderPhase::Unclaimed);
                return self.config.heartbeat_interval;
            }
        };

        let claimable = match record {
            None => true,
            Some(record) => {
                !record.is_live_at(now, self.config.ttl) || record.is_held_by(self.session_id)
            }
        };
        if !claimable {
            debug!(
                session_id = %self.session_id,
                holder = ?record.map(|r| r.holder_id),
                "lease held by a live peer"
            );
            self.set_phase(LeaderPhase::Unclaimed);
            return self.config.follower_recheck();
        }

        match self.write_own_record(raw.as_deref(), now) {
            Ok(true) => {
                info!(session_id = %self.session_id, lease = %self.config.lease_key, "became leader");
                self.set_phase(LeaderPhase::Leader);
                self.bus.publish(Signal::LeaderHeartbeat { ts: now });
                self.config.heartbeat_interval
            }
            Ok(false) => {
                debug!(session_id = %self.session_id, "lost lease race, re-reading");
                self.set_phase(LeaderPhase::Unclaimed);
                Duration::ZERO
            }
            Err(error) => {
                warn!(lease = %self.config.lease_key, error = %error, "lease claim failed");
                self.set_phase(LeaderPhase::Unclaimed);
                self.config.heartbeat_interval
            }
        }
    }

    /// Heartbeat while leader. Resigns when someone else holds the lease.
    fn renew(&self) -> Duration {
        self.set_phase(LeaderPhase::Renewing);
        let now = now_millis();

        let outcome = self.read_lease().and_then(|(raw, record)| match record {
            Some(record) if record.is_held_by(self.session_id) => {
                self.write_own_record(raw.as_deref(), now)
            }
            _ => Ok(false),
        });

        match outcome {
            Ok(true) => {
                debug!(session_id = %self.session_id, "lease renewed");
                self.set_phase(LeaderPhase::Leader);
                self.bus.publish(Signal::LeaderHeartbeat { ts: now });
                self.config.heartbeat_interval
            }
            Ok(false) => {
                warn!(session_id = %self.session_id, lease = %self.config.lease_key, "lease lost to another session");
                self.set_phase(LeaderPhase::Unclaimed);
                Duration::ZERO
            }
            Err(error) => {
                let since_renewal = now - self.last_renewed_ms.load(Ordering::SeqCst);
                if since_renewal >= duration_millis(self.config.ttl) {
                    warn!(error = %error, "lease renew failing past TTL, resigning");
                    self.set_phase(LeaderPhase::Unclaimed);
                    return self.config.heartbeat_interval;
                }
                // Possibly transient; our record stays live until the TTL.
                warn!(error = %error, "lease renew failed");
                self.set_phase(LeaderPhase::Leader);
                self.config.heartbeat_interval
            }
        }
    }

    fn write_own_record(&self, expected: Option<&str>, now: i64) -> anyhow::Result<bool> {
        let encoded = LeaseRecord::new(self.session_id, now).encode()?;
        let written = self.store.compare_and_swap(&self.config.lease_key, expected, Some(&encoded))?;
        if written {
            self.last_renewed_ms.store(now, Ordering::SeqCst);
        }
        Ok(written)
    }

    fn release_own_lease(&self) {
        let (raw, record) = match self.read_lease() {
            Ok(lease) => lease,
            Err(error) => {
                warn!(error = %error, "failed to read lease during shutdown");
                return;
            }
        };
        let Some(record) = record else { return };
        if !record.is_held_by(self.session_id) {
            return;
        }

        match self.store.compare_and_swap(&self.config.lease_key, raw.as_deref(), None) {
            Ok(true) => info!(session_id = %self.session_id, "leader lease released on shutdown"),
            Ok(false) => debug!(session_id = %self.session_id, "lease changed hands during shutdown"),
            Err(error) => warn!(error = %error, "failed to release lease on shutdown"),
        }
    }

    fn is_release_of_our_lease(&self, change: &StoreChange) -> bool {
        change.key == self.config.lease_key && change.value.is_none()
    }
}

async fn leader_loop(
    inner: Arc<LeaderInner>,
    mut changes: broadcast::Receiver<StoreChange>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut changes_open = true;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let wait = if inner.is_leader.load(Ordering::SeqCst) {
            inner.renew()
        } else {
            inner.try_claim()
        };

        let deadline = Instant::now() + wait;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = inner.recheck.notified() => break,
                change = changes.recv(), if changes_open => match change {
                    Ok(change) => {
                        if !inner.is_leader.load(Ordering::SeqCst) && inner.is_release_of_our_lease(&change) {
                            debug!(session_id = %inner.session_id, "lease released by holder, claiming now");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => changes_open = false,
                },
                _ = shutdown_rx.changed() => {
                    debug!(session_id = %inner.session_id, "leader loop shutting down");
                    return;
                }
            }
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// ── Tests ───────────────────────────────────────────────────────────

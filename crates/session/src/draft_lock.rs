// Advisory draft locks built from peer broadcasts.
//
// A claim is a UX hint that another session is editing a resource. Claims are
// TTL-driven only: every broadcast refreshes `last_seen`, and a claim not seen
// for `lock_timeout` counts as released. Writes stay protected by the server's
// version check whether or not any of this reaches a peer.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use concord_common::protocol::signal::{Signal, SignalEnvelope};
use concord_common::types::SessionId;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::bus::{SignalBus, Subscription};

/// Default time after which an unrenewed claim is ignored.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// A peer's claim on `resource_key` as last observed locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftLockClaim {
    pub resource_key: String,
    pub holder_session_id: SessionId,
    /// Epoch millis of the first broadcast of this claim.
    pub claimed_at: i64,
    pub last_seen: Instant,
}

impl DraftLockClaim {
    pub fn is_live_at(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) < timeout
    }
}

pub struct DraftLockRegistry {
    inner: Arc<RegistryInner>,
    renew_task: Mutex<Option<JoinHandle<()>>>,
    _subscription: Subscription,
}

struct RegistryInner {
    bus: SignalBus,
    lock_timeout: Duration,
    /// Claims received from peers, keyed by resource.
    claims: Mutex<HashMap<String, DraftLockClaim>>,
    /// Resources this session currently claims.
    held: Mutex<BTreeSet<String>>,
}

impl DraftLockRegistry {
    /// Start tracking peer claims on `bus`. Held locks are re-broadcast every
    /// `lock_timeout / 3` until released.
    pub fn start(bus: SignalBus, lock_timeout: Duration) -> Self {
        let inner = Arc::new(RegistryInner {
            bus: bus.clone(),
            lock_timeout,
            claims: Mutex::new(HashMap::new()),
            held: Mutex::new(BTreeSet::new()),
        });

        let handler_inner = Arc::downgrade(&inner);
        let subscription = bus.subscribe(move |envelope| {
            if let Some(inner) = handler_inner.upgrade() {
                inner.observe(envelope);
            }
            Ok(())
        });

        let renew_task = tokio::spawn(renew_loop(Arc::downgrade(&inner), lock_timeout / 3));

        Self { inner, renew_task: Mutex::new(Some(renew_task)), _subscription: subscription }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.inner.lock_timeout
    }

    /// Announce that this session is editing `resource_key`.
    pub fn acquire(&self, resource_key: &str) {
        if let Ok(mut held) = self.inner.held.lock() {
            held.insert(resource_key.to_owned());
        }
        debug!(resource_key, "draft lock acquired");
        self.inner.bus.publish(Signal::DraftLockAcquired { resource_key: resource_key.to_owned() });
    }

    pub fn release(&self, resource_key: &str) {
        let was_held = self.inner.held.lock().map(|mut held| held.remove(resource_key)).unwrap_or(false);
        if !was_held {
            return;
        }
        debug!(resource_key, "draft lock released");
        self.inner.bus.publish(Signal::DraftLockReleased { resource_key: resource_key.to_owned() });
    }

    /// Release every lock this session holds. Returns how many were released.
    pub fn release_all(&self) -> usize {
        let held: Vec<String> = self
            .inner
            .held
            .lock()
            .map(|mut held| std::mem::take(&mut *held).into_iter().collect())
            .unwrap_or_default();
        for resource_key in &held {
            self.inner.bus.publish(Signal::DraftLockReleased { resource_key: resource_key.clone() });
        }
        held.len()
    }

    pub fn held_keys(&self) -> Vec<String> {
        self.inner.held.lock().map(|held| held.iter().cloned().collect()).unwrap_or_default()
    }

    /// Whether a live claim by another session exists for `resource_key`.
    pub fn is_locked_by_other(&self, resource_key: &str) -> bool {
        self.holder(resource_key).is_some()
    }

    /// Session holding a live claim on `resource_key`, if any.
    pub fn holder(&self, resource_key: &str) -> Option<SessionId> {
        let now = Instant::now();
        let claims = self.inner.claims.lock().ok()?;
        claims
            .get(resource_key)
            .filter(|claim| claim.is_live_at(now, self.inner.lock_timeout))
            .map(|claim| claim.holder_session_id)
    }

    /// Live peer claims, sorted by resource key.
    pub fn active_claims(&self) -> Vec<DraftLockClaim> {
        let now = Instant::now();
        let mut claims: Vec<DraftLockClaim> = self
            .inner
            .claims
            .lock()
            .map(|claims| {
                claims
                    .values()
                    .filter(|claim| claim.is_live_at(now, self.inner.lock_timeout))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        claims.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        claims
    }

    /// Drop expired claims from the local map. Returns how many were dropped.
    pub fn prune_expired(&self) -> usize {
        self.inner.prune_expired(Instant::now())
    }

    /// Release held locks and stop renewing.
    pub fn shutdown(&self) {
        let released = self.release_all();
        if let Ok(mut slot) = self.renew_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        debug!(released, "draft lock registry stopped");
    }
}

impl Drop for DraftLockRegistry {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.renew_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

impl RegistryInner {
    fn observe(&self, envelope: &SignalEnvelope) {
        let Ok(mut claims) = self.claims.lock() else { return };
        match &envelope.signal {
            Signal::DraftLockAcquired { resource_key } => {
                let now = Instant::now();
                let claimed_at = claims
                    .get(resource_key)
                    .filter(|claim| claim.holder_session_id == envelope.session_id)
                    .map(|claim| claim.claimed_at)
                    .unwrap_or_else(|| Utc::now().timestamp_millis());
                trace!(resource_key = %resource_key, holder = %envelope.session_id, "draft lock claim seen");
                claims.insert(
                    resource_key.clone(),
                    DraftLockClaim {
                        resource_key: resource_key.clone(),
                        holder_session_id: envelope.session_id,
                        claimed_at,
                        last_seen: now,
                    },
                );
            }
            Signal::DraftLockReleased { resource_key } => {
                // A release from a session that no longer holds the claim is stale.
                let from_holder = claims
                    .get(resource_key)
                    .is_some_and(|claim| claim.holder_session_id == envelope.session_id);
                if from_holder {
                    claims.remove(resource_key);
                    trace!(resource_key = %resource_key, holder = %envelope.session_id, "draft lock release seen");
                }
            }
            _ => {}
        }
    }

    fn prune_expired(&self, now: Instant) -> usize {
        let Ok(mut claims) = self.claims.lock() else { return 0 };
        let before = claims.len();
        claims.retain(|_, claim| claim.is_live_at(now, self.lock_timeout));
        before - claims.len()
    }

    fn renew_held(&self) {
        let held: Vec<String> = self.held.lock().map(|held| held.iter().cloned().collect()).unwrap_or_default();
        for resource_key in held {
            self.bus.publish(Signal::DraftLockAcquired { resource_key });
        }
    }
}

async fn renew_loop(inner: std::sync::Weak<RegistryInner>, period: Duration) {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        inner.renew_held();
        let pruned = inner.prune_expired(Instant::now());
        if pruned > 0 {
            debug!(pruned, "expired draft lock claims pruned");
        }
    }
}

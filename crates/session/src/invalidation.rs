// Cache invalidation relay.
//
// After a successful mutation the writing session announces `{resourceType,
// resourceId?}`; peers mark their local copy stale and notify whoever
// subscribed to that resource type. No acknowledgement, no retry.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use concord_common::protocol::signal::Signal;
use concord_common::types::SessionId;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::bus::{SignalBus, Subscription};

/// A resource (or a whole resource type) that changed on the server.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InvalidationEvent {
    pub resource_type: String,
    /// `None` invalidates every resource of the type.
    pub resource_id: Option<String>,
}

impl InvalidationEvent {
    pub fn resource(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self { resource_type: resource_type.into(), resource_id: Some(resource_id.into()) }
    }

    pub fn whole_type(resource_type: impl Into<String>) -> Self {
        Self { resource_type: resource_type.into(), resource_id: None }
    }

    /// Whether this event invalidates `resource_id` of `resource_type`.
    pub fn covers(&self, resource_type: &str, resource_id: &str) -> bool {
        self.resource_type == resource_type
            && self.resource_id.as_deref().map_or(true, |id| id == resource_id)
    }
}

/// An invalidation as handed to subscribers, with the session that made the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationNotice {
    pub origin_session_id: SessionId,
    pub event: InvalidationEvent,
}

#[derive(Clone)]
pub struct InvalidationRelay {
    inner: Arc<RelayInner>,
    _subscription: Arc<Subscription>,
}

struct RelayInner {
    bus: SignalBus,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<InvalidationNotice>>>>,
    stale: Mutex<BTreeSet<InvalidationEvent>>,
}

impl InvalidationRelay {
    pub fn start(bus: SignalBus) -> Self {
        let inner = Arc::new(RelayInner {
            bus: bus.clone(),
            subscribers: Mutex::new(HashMap::new()),
            stale: Mutex::new(BTreeSet::new()),
        });

        let handler_inner = Arc::downgrade(&inner);
        let subscription = bus.subscribe(move |envelope| {
            if let Signal::CacheInvalidate { resource_type, resource_id } = &envelope.signal {
                if let Some(inner) = handler_inner.upgrade() {
                    inner.deliver(
                        envelope.session_id,
                        InvalidationEvent {
                            resource_type: resource_type.clone(),
                            resource_id: resource_id.clone(),
                        },
                    );
                }
            }
            Ok(())
        });

        Self { inner, _subscription: Arc::new(subscription) }
    }

    /// Announce that this session changed a resource.
    pub fn notify_changed(&self, resource_type: &str, resource_id: Option<&str>) -> bool {
        debug!(resource_type, resource_id, "publishing cache invalidation");
        self.inner.bus.publish(Signal::CacheInvalidate {
            resource_type: resource_type.to_owned(),
            resource_id: resource_id.map(str::to_owned),
        })
    }

    /// Mark a change this session learned about itself, without announcing it.
    /// Local subscribers are notified as if a peer had sent it.
    pub fn mark_stale(&self, resource_type: &str, resource_id: Option<&str>) {
        self.inner.deliver(
            self.inner.bus.session_id(),
            InvalidationEvent {
                resource_type: resource_type.to_owned(),
                resource_id: resource_id.map(str::to_owned),
            },
        );
    }

    /// Receive invalidations for `resource_type`. The channel closes when the
    /// relay is dropped.
    pub fn subscribe(&self, resource_type: &str) -> mpsc::UnboundedReceiver<InvalidationNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.entry(resource_type.to_owned()).or_default().push(tx);
        }
        rx
    }

    /// Whether this resource was invalidated since the last `take_stale`.
    pub fn is_stale(&self, resource_type: &str, resource_id: &str) -> bool {
        self.inner
            .stale
            .lock()
            .map(|stale| stale.iter().any(|event| event.covers(resource_type, resource_id)))
            .unwrap_or(false)
    }

    /// Drain the set of stale entries for refetching.
    pub fn take_stale(&self) -> Vec<InvalidationEvent> {
        self.inner
            .stale
            .lock()
            .map(|mut stale| std::mem::take(&mut *stale).into_iter().collect())
            .unwrap_or_default()
    }
}

impl RelayInner {
    fn deliver(&self, from: SessionId, event: InvalidationEvent) {
        trace!(
            from = %from,
            resource_type = %event.resource_type,
            resource_id = ?event.resource_id,
            "cache invalidation received"
        );

        if let Ok(mut stale) = self.stale.lock() {
            if event.resource_id.is_none() {
                // A type-wide entry subsumes individual ones.
                stale.retain(|entry| entry.resource_type != event.resource_type);
            }
            let subsumed = stale
                .iter()
                .any(|entry| entry.resource_type == event.resource_type && entry.resource_id.is_none());
            if !subsumed {
                stale.insert(event.clone());
            }
        }

        if let Ok(mut subscribers) = self.subscribers.lock() {
            if let Some(senders) = subscribers.get_mut(&event.resource_type) {
                let notice = InvalidationNotice { origin_session_id: from, event: event.clone() };
                senders.retain(|tx| tx.send(notice.clone()).is_ok());
                if senders.is_empty() {
                    subscribers.remove(&event.resource_type);
                }
            }
        }
    }
}

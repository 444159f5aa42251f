// Signal Bus: best-effort publish/subscribe between sessions of one origin.
//
// Transports move raw JSON strings; the bus owns encoding, drops the sender's
// own messages, and isolates handler failures from each other.

pub mod channel;
pub mod storage;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use anyhow::Result;
use concord_common::protocol::signal::{Signal, SignalEnvelope};
use concord_common::types::SessionId;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

pub use channel::ChannelHub;
pub use storage::StorageTransport;

/// Moves encoded messages between sessions.
pub trait SignalTransport: Send + Sync + 'static {
    /// Short label for logs.
    fn name(&self) -> &'static str;

    fn send(&self, raw: String) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<String>;
}

/// Callback for received messages. Errors and panics are logged and contained.
pub type SignalHandler = Arc<dyn Fn(&SignalEnvelope) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct SignalBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    session_id: SessionId,
    transport: Arc<dyn SignalTransport>,
    handlers: RwLock<Vec<(u64, SignalHandler)>>,
    next_handler_id: AtomicU64,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalBus {
    /// Attach `session_id` to `transport` and start dispatching. Must be
    /// called inside a tokio runtime.
    pub fn start(session_id: SessionId, transport: Arc<dyn SignalTransport>) -> Self {
        let receiver = transport.subscribe();
        let inner = Arc::new(BusInner {
            session_id,
            transport,
            handlers: RwLock::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            dispatch_task: Mutex::new(None),
        });

        let task = tokio::spawn(dispatch_loop(Arc::downgrade(&inner), receiver));
        if let Ok(mut slot) = inner.dispatch_task.lock() {
            *slot = Some(task);
        }

        debug!(session_id = %session_id, transport = inner.transport.name(), "signal bus started");
        Self { inner }
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }

    /// Send `signal` to every other session. Returns whether the transport
    /// accepted it; failures are logged and never propagated.
    pub fn publish(&self, signal: Signal) -> bool {
        let kind = signal.kind();
        let envelope = SignalEnvelope::new(self.inner.session_id, signal);
        let raw = match envelope.encode() {
            Ok(raw) => raw,
            Err(error) => {
                warn!(kind, error = %error, "failed to encode signal");
                return false;
            }
        };

        match self.inner.transport.send(raw) {
            Ok(()) => {
                trace!(kind, session_id = %self.inner.session_id, "signal published");
                true
            }
            Err(error) => {
                warn!(
                    kind,
                    transport = self.inner.transport.name(),
                    error = %error,
                    "signal delivery failed, peers stay uninformed"
                );
                false
            }
        }
    }

    /// Register `handler` for messages from other sessions. The handler stays
    /// registered until the returned [`Subscription`] is dropped.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SignalEnvelope) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        match self.inner.handlers.write() {
            Ok(mut handlers) => handlers.push((id, Arc::new(handler))),
            Err(_) => error!("signal bus handler registry poisoned, handler not registered"),
        }
        Subscription { bus: Arc::downgrade(&self.inner), id }
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().map(|handlers| handlers.len()).unwrap_or(0)
    }

    /// Stop receiving. Publishing keeps working until the bus is dropped.
    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.inner.dispatch_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    /// Deliver one raw message to local handlers as if it came off the transport.
    pub(crate) fn dispatch_raw(&self, raw: &str) {
        self.inner.dispatch(raw);
    }
}

impl BusInner {
    fn dispatch(&self, raw: &str) {
        let envelope = match SignalEnvelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(error) => {
                debug!(error = %error, "dropping undecodable signal");
                return;
            }
        };
        if envelope.session_id == self.session_id {
            return;
        }

        let handlers: Vec<(u64, SignalHandler)> = match self.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(_) => {
                error!("signal bus handler registry poisoned, dropping signal");
                return;
            }
        };

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(handler = id, kind = envelope.signal.kind(), error = %error, "signal handler failed");
                }
                Err(_) => {
                    error!(handler = id, kind = envelope.signal.kind(), "signal handler panicked");
                }
            }
        }
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.dispatch_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

/// Keeps a handler registered; dropping it unregisters the handler.
pub struct Subscription {
    bus: Weak<BusInner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            if let Ok(mut handlers) = bus.handlers.write() {
                handlers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

async fn dispatch_loop(bus: Weak<BusInner>, mut receiver: broadcast::Receiver<String>) {
    loop {
        match receiver.recv().await {
            Ok(raw) => {
                let Some(inner) = bus.upgrade() else { break };
                inner.dispatch(&raw);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "signal bus lagged, messages lost");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLeaseStore;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> impl Fn(&SignalEnvelope) -> Result<()> {
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn heartbeat() -> Signal {
        Signal::LeaderHeartbeat { ts: 1 }
    }

    #[tokio::test]
    async fn peers_receive_but_sender_does_not() {
        let hub = Arc::new(ChannelHub::default());
        let a = SignalBus::start(SessionId::generate(), hub.clone());
        let b = SignalBus::start(SessionId::generate(), hub.clone());

        let a_count = Arc::new(AtomicUsize::new(0));
        let b_count = Arc::new(AtomicUsize::new(0));
        let _a_sub = a.subscribe(counting_handler(a_count.clone()));
        let _b_sub = b.subscribe(counting_handler(b_count.clone()));

        assert!(a.publish(heartbeat()));
        settle().await;

        assert_eq!(a_count.load(Ordering::SeqCst), 0);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_do_not_block_others() {
        let hub = Arc::new(ChannelHub::default());
        let sender = SignalBus::start(SessionId::generate(), hub.clone());
        let receiver = SignalBus::start(SessionId::generate(), hub.clone());

        let delivered = Arc::new(AtomicUsize::new(0));
        let _err = receiver.subscribe(|_| Err(anyhow!("handler failure")));
        let _panic = receiver.subscribe(|_| panic!("handler panic"));
        let _ok = receiver.subscribe(counting_handler(delivered.clone()));

        sender.publish(heartbeat());
        sender.publish(heartbeat());
        settle().await;

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters_handler() {
        let hub = Arc::new(ChannelHub::default());
        let sender = SignalBus::start(SessionId::generate(), hub.clone());
        let receiver = SignalBus::start(SessionId::generate(), hub.clone());

        let count = Arc::new(AtomicUsize::new(0));
        let subscription = receiver.subscribe(counting_handler(count.clone()));
        assert_eq!(receiver.handler_count(), 1);
        subscription.unsubscribe();
        assert_eq!(receiver.handler_count(), 0);

        sender.publish(heartbeat());
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn storage_fallback_delivers_the_same_shape() {
        let store: Arc<dyn crate::store::LeaseStore> = Arc::new(MemoryLeaseStore::new());
        let a = SignalBus::start(SessionId::generate(), Arc::new(StorageTransport::start(store.clone())));
        let b = SignalBus::start(SessionId::generate(), Arc::new(StorageTransport::start(store)));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = b.subscribe(move |envelope| {
            seen_clone.lock().unwrap().push(envelope.clone());
            Ok(())
        });

        a.publish(Signal::CacheInvalidate {
            resource_type: "note".into(),
            resource_id: Some("note123".into()),
        });
        settle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].session_id, a.session_id());
        assert_eq!(
            seen[0].signal,
            Signal::CacheInvalidate { resource_type: "note".into(), resource_id: Some("note123".into()) }
        );
    }

    #[tokio::test]
    async fn transport_failure_is_swallowed() {
        struct BrokenTransport {
            tx: broadcast::Sender<String>,
        }

        impl SignalTransport for BrokenTransport {
            fn name(&self) -> &'static str {
                "broken"
            }

            fn send(&self, _raw: String) -> Result<()> {
                Err(anyhow!("quota exceeded"))
            }

            fn subscribe(&self) -> broadcast::Receiver<String> {
                self.tx.subscribe()
            }
        }

        let (tx, _) = broadcast::channel(4);
        let bus = SignalBus::start(SessionId::generate(), Arc::new(BrokenTransport { tx }));
        assert!(!bus.publish(heartbeat()));
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped() {
        let hub = Arc::new(ChannelHub::default());
        let bus = SignalBus::start(SessionId::generate(), hub);
        let count = Arc::new(AtomicUsize::new(0));
        let _sub = bus.subscribe(counting_handler(count.clone()));

        bus.dispatch_raw("{not json");
        bus.dispatch_raw("{\"type\":\"UNKNOWN\",\"sessionId\":\"00000000-0000-0000-0000-000000000001\"}");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}

// Per-session coordinator wiring.
//
// One `SessionRuntime` is created when a session starts and torn down when
// it ends. Consumers get it by reference; it is never rebuilt mid-session.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use concord_common::types::{SessionId, SessionIdentity};
use tokio::task::JoinHandle;
use tracing::info;

use crate::bus::{ChannelHub, SignalBus, SignalTransport, StorageTransport};
use crate::client::RecordClient;
use crate::config::{SessionConfig, TransportKind};
use crate::draft_lock::DraftLockRegistry;
use crate::invalidation::InvalidationRelay;
use crate::leader::{start_leader_election, LeaderConfig, LeaderCoordinator};
use crate::poller::RecordPoller;
use crate::store::{LeaseStore, SqliteLeaseStore};

/// How often a SQLite-backed store checks for writes by other processes.
const STORE_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct SessionRuntime {
    identity: SessionIdentity,
    store: Arc<dyn LeaseStore>,
    bus: SignalBus,
    leader: LeaderCoordinator,
    draft_locks: DraftLockRegistry,
    invalidations: InvalidationRelay,
    client: Option<RecordClient>,
    poller: Option<RecordPoller>,
    background: Vec<JoinHandle<()>>,
}

impl SessionRuntime {
    /// Start a session over an already shared Lease Store and transport.
    pub fn start(
        identity: SessionIdentity,
        config: &SessionConfig,
        store: Arc<dyn LeaseStore>,
        transport: Arc<dyn SignalTransport>,
    ) -> Result<Self> {
        config.validate().context("invalid session config")?;

        let bus = SignalBus::start(identity.session_id, transport);
        let leader_config = LeaderConfig::new(config.lease_ttl())
            .with_heartbeat_interval(config.heartbeat_interval())
            .with_recheck_margin(config.recheck_margin());
        let leader = start_leader_election(leader_config, store.clone(), bus.clone());
        let draft_locks = DraftLockRegistry::start(bus.clone(), config.lock_timeout());
        let invalidations = InvalidationRelay::start(bus.clone());

        let client = match &config.server_url {
            Some(url) => Some(
                RecordClient::new(url, identity.actor_id.clone())
                    .with_context(|| format!("failed to build client for `{url}`"))?
                    .with_relay(invalidations.clone()),
            ),
            None => None,
        };
        let poller = client.as_ref().map(|client| {
            RecordPoller::spawn(
                client.clone(),
                invalidations.clone(),
                leader.subscribe(),
                config.heartbeat_interval(),
            )
        });

        info!(
            actor_id = %identity.actor_id,
            session_id = %identity.session_id,
            transport = bus.transport_name(),
            "session started"
        );

        Ok(Self {
            identity,
            store,
            bus,
            leader,
            draft_locks,
            invalidations,
            client,
            poller,
            background: Vec::new(),
        })
    }

    /// Start a session over the configured SQLite Lease Store. `hub` is the
    /// in-process channel used when the config selects the channel transport.
    pub fn open(identity: SessionIdentity, config: &SessionConfig, hub: &Arc<ChannelHub>) -> Result<Self> {
        let sqlite = SqliteLeaseStore::open(&config.lease_store_path).with_context(|| {
            format!("failed to open lease store `{}`", config.lease_store_path.display())
        })?;
        let store_poller = sqlite.spawn_change_poller(STORE_POLL_INTERVAL);
        let store: Arc<dyn LeaseStore> = Arc::new(sqlite);

        let transport: Arc<dyn SignalTransport> = match config.transport {
            TransportKind::Channel => hub.clone(),
            TransportKind::Storage => Arc::new(StorageTransport::start(store.clone())),
        };

        let mut runtime = Self::start(identity, config, store, transport)?;
        runtime.background.push(store_poller);
        Ok(runtime)
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn session_id(&self) -> SessionId {
        self.identity.session_id
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    pub fn bus(&self) -> &SignalBus {
        &self.bus
    }

    pub fn leader(&self) -> &LeaderCoordinator {
        &self.leader
    }

    pub fn draft_locks(&self) -> &DraftLockRegistry {
        &self.draft_locks
    }

    pub fn invalidations(&self) -> &InvalidationRelay {
        &self.invalidations
    }

    /// Record API client, when a server URL is configured.
    pub fn client(&self) -> Option<&RecordClient> {
        self.client.as_ref()
    }

    pub fn poller(&self) -> Option<&RecordPoller> {
        self.poller.as_ref()
    }

    /// Release draft locks, hand over leadership and stop background work.
    pub async fn shutdown(mut self) {
        self.draft_locks.shutdown();
        if let Some(poller) = &self.poller {
            poller.shutdown();
        }
        self.leader.shutdown().await;
        self.bus.shutdown();
        for task in self.background.drain(..) {
            task.abort();
        }
        info!(session_id = %self.identity.session_id, "session stopped");
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        for task in self.background.drain(..) {
            task.abort();
        }
    }
}

// Sessions talking to a real record server over HTTP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use concord_common::types::{ActorId, EnrichRequest, SessionIdentity, VersionedRecord};
use concord_server::api::ApiState;
use concord_server::app::build_app;
use concord_server::enrich::{Enricher, TextStatsEnricher};
use concord_server::guard::RecordStore;
use concord_server::idempotency::IdempotencyCache;
use concord_session::bus::{ChannelHub, SignalTransport};
use concord_session::client::{ClientError, RecordClient};
use concord_session::config::SessionConfig;
use concord_session::runtime::SessionRuntime;
use concord_session::store::{LeaseStore, MemoryLeaseStore};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Slow enricher that counts how often it actually ran.
#[derive(Default)]
struct CountingEnricher {
    runs: AtomicUsize,
}

impl Enricher for CountingEnricher {
    fn enrich(&self, record: &VersionedRecord) -> anyhow::Result<Value> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        TextStatsEnricher.enrich(record)
    }
}

async fn spawn_server(enricher: Arc<dyn Enricher>) -> String {
    let state = ApiState {
        records: RecordStore::memory(),
        idempotency: IdempotencyCache::memory(),
        enricher,
    };
    let app = build_app(state, None);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server runs");
    });
    format!("http://{addr}")
}

fn actor() -> ActorId {
    ActorId::parse("user-1").expect("actor")
}

fn client(base_url: &str) -> RecordClient {
    RecordClient::new(base_url, actor()).expect("client")
}

async fn wait_for<F: Fn() -> bool>(condition: F, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_write_gets_conflict_with_current_record() {
    let base_url = spawn_server(Arc::new(TextStatsEnricher)).await;
    let a = client(&base_url);
    let b = client(&base_url);

    a.create("note", "note123", json!({"body": "v1"})).await.expect("create");
    a.update("note", "note123", Some(1), json!({"body": "v2"})).await.expect("v2");
    b.update("note", "note123", Some(2), json!({"body": "v3"})).await.expect("v3");

    let seen_by_a = a.get("note", "note123").await.expect("get");
    assert_eq!(seen_by_a.version, 3);

    // B moves on while A is still editing version 3.
    b.update("note", "note123", Some(3), json!({"body": "from b"})).await.expect("v4");

    let error = a
        .update("note", "note123", Some(seen_by_a.version), json!({"body": "from a"}))
        .await
        .expect_err("stale write must be rejected");
    let ClientError::Conflict(conflict) = &error else { panic!("expected conflict, got {error}") };
    assert_eq!(conflict.current_version, 4);
    assert_eq!(conflict.current_record.data["body"], "from b");

    // Nothing was written by the rejected update.
    assert_eq!(a.get("note", "note123").await.expect("get").data["body"], "from b");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enrich_runs_once_and_both_see_same_result() {
    let enricher = Arc::new(CountingEnricher::default());
    let base_url = spawn_server(enricher.clone()).await;
    let a = client(&base_url);
    let b = client(&base_url);
    a.create("note", "note123", json!({"body": "enrich me please"})).await.expect("create");

    let request = EnrichRequest { base_version: Some(1) };
    let (first, second) = tokio::join!(
        a.enrich("note", "note123", "note123:enrich", &request),
        b.enrich("note", "note123", "note123:enrich", &request),
    );
    let first = first.expect("first enrich");
    let second = second.expect("second enrich");

    assert_eq!(enricher.runs.load(Ordering::SeqCst), 1);
    assert_eq!(first.status, second.status);
    assert_eq!(first.response, second.response);
    assert_eq!([first.replayed, second.replayed].iter().filter(|replayed| **replayed).count(), 1);

    let stored = a.get("note", "note123").await.expect("get");
    assert_eq!(stored.version, 2);
    assert_eq!(stored.data["enrichment"]["wordCount"], 3);
}

#[tokio::test]
async fn reusing_an_enrich_key_for_another_request_is_rejected() {
    let base_url = spawn_server(Arc::new(TextStatsEnricher)).await;
    let a = client(&base_url);
    a.create("note", "note123", json!({"body": "text"})).await.expect("create");

    a.enrich("note", "note123", "op-1", &EnrichRequest { base_version: Some(1) }).await.expect("enrich");
    let error = a
        .enrich("note", "note123", "op-1", &EnrichRequest { base_version: Some(2) })
        .await
        .expect_err("different payload under the same key");
    let ClientError::Api { status, body } = error else { panic!("expected api error") };
    assert_eq!(status, 422);
    assert_eq!(body.code, "IDEMPOTENCY_KEY_REUSED");
}

/// Transport that accepts every message and delivers none.
struct DroppingTransport {
    never: broadcast::Sender<String>,
}

impl DroppingTransport {
    fn new() -> Self {
        Self { never: broadcast::channel(1).0 }
    }
}

impl SignalTransport for DroppingTransport {
    fn name(&self) -> &'static str {
        "dropping"
    }

    fn send(&self, _raw: String) -> anyhow::Result<()> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.never.subscribe()
    }
}

fn session_config(base_url: &str) -> SessionConfig {
    SessionConfig {
        server_url: Some(base_url.to_owned()),
        lease_ttl_ms: 300,
        heartbeat_interval_ms: Some(50),
        recheck_margin_ms: 20,
        lock_timeout_ms: 200,
        ..SessionConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_writes_invalidate_peers() {
    let base_url = spawn_server(Arc::new(TextStatsEnricher)).await;
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
    let hub = Arc::new(ChannelHub::default());
    let config = session_config(&base_url);
    let a = SessionRuntime::start(SessionIdentity::new(actor()), &config, store.clone(), hub.clone())
        .expect("session a");
    let b = SessionRuntime::start(SessionIdentity::new(actor()), &config, store, hub).expect("session b");

    let a_client = a.client().expect("server configured");
    a_client.create("note", "note123", json!({"body": "v1"})).await.expect("create");
    assert!(wait_for(|| b.invalidations().is_stale("note", "note123"), Duration::from_secs(1)).await);
    assert!(!a.invalidations().is_stale("note", "note123"));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_poll_announces_changes_made_elsewhere() {
    let base_url = spawn_server(Arc::new(TextStatsEnricher)).await;
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
    let hub = Arc::new(ChannelHub::default());
    let config = session_config(&base_url);

    let leader = SessionRuntime::start(SessionIdentity::new(actor()), &config, store.clone(), hub.clone())
        .expect("leader session");
    assert!(wait_for(|| leader.leader().is_leader(), Duration::from_secs(1)).await);
    let follower =
        SessionRuntime::start(SessionIdentity::new(actor()), &config, store, hub).expect("follower session");

    // A writer outside this group of sessions, with no invalidation relay.
    let elsewhere = client(&base_url);
    elsewhere.create("note", "shared", json!({"body": "v1"})).await.expect("create");

    let poller = leader.poller().expect("leader polls");
    poller.watch_record("note", "shared");
    assert!(wait_for(|| poller.last_seen_version("note", "shared") == Some(1), Duration::from_secs(2)).await);
    assert!(!follower.invalidations().is_stale("note", "shared"));

    elsewhere.update("note", "shared", Some(1), json!({"body": "v2"})).await.expect("update");
    assert!(wait_for(|| follower.invalidations().is_stale("note", "shared"), Duration::from_secs(2)).await);
    assert!(leader.invalidations().is_stale("note", "shared"));
    assert_eq!(poller.last_seen_version("note", "shared"), Some(2));

    poller.unwatch_record("note", "shared");
    assert_eq!(poller.last_seen_version("note", "shared"), None);
    assert_eq!(poller.poll_once().await, 0);

    leader.shutdown().await;
    follower.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicts_are_caught_without_any_signalling() {
    let base_url = spawn_server(Arc::new(TextStatsEnricher)).await;
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
    let transport = Arc::new(DroppingTransport::new());
    let config = session_config(&base_url);
    let a = SessionRuntime::start(SessionIdentity::new(actor()), &config, store.clone(), transport.clone())
        .expect("session a");
    let b = SessionRuntime::start(SessionIdentity::new(actor()), &config, store, transport).expect("session b");

    let a_client = a.client().expect("server configured");
    let b_client = b.client().expect("server configured");
    a_client.create("note", "note123", json!({"body": "v1"})).await.expect("create");

    // Both believe they are the only editor.
    a.draft_locks().acquire("note123");
    b.draft_locks().acquire("note123");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!a.draft_locks().is_locked_by_other("note123"));
    assert!(!b.draft_locks().is_locked_by_other("note123"));

    let (from_a, from_b) = tokio::join!(
        a_client.update("note", "note123", Some(1), json!({"body": "from a"})),
        b_client.update("note", "note123", Some(1), json!({"body": "from b"})),
    );
    let results = [from_a, from_b];
    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    let conflict = results
        .iter()
        .find_map(|result| match result {
            Err(ClientError::Conflict(conflict)) => Some(conflict.clone()),
            _ => None,
        })
        .expect("the other write is a conflict");
    assert_eq!(conflict.current_version, 2);
    assert_eq!(a_client.get("note", "note123").await.expect("get").version, 2);

    a.shutdown().await;
    b.shutdown().await;
}

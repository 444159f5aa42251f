// concord-session: headless session entry point.
//
// Joins the election and signal bus of the configured Lease Store and logs
// leadership changes until interrupted.

use std::sync::Arc;

use anyhow::Context;
use concord_common::types::{ActorId, SessionIdentity};
use concord_session::bus::ChannelHub;
use concord_session::config::SessionConfig;
use concord_session::runtime::SessionRuntime;
use tracing::info;

const ACTOR_ID_ENV: &str = "CONCORD_ACTOR_ID";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let actor = std::env::var(ACTOR_ID_ENV).unwrap_or_else(|_| "local".to_string());
    let actor_id = ActorId::parse(actor).with_context(|| format!("invalid {ACTOR_ID_ENV}"))?;
    let config = SessionConfig::load();

    // Only used with `transport = "channel"`, which stays inside this process.
    let hub = Arc::new(ChannelHub::default());
    let runtime = SessionRuntime::open(SessionIdentity::new(actor_id), &config, &hub)
        .context("failed to start session")?;

    let mut phases = runtime.leader().subscribe();
    loop {
        tokio::select! {
            changed = phases.changed() => {
                if changed.is_err() {
                    break;
                }
                let phase = *phases.borrow_and_update();
                info!(?phase, session_id = %runtime.session_id(), "leadership phase");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down session");
                break;
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}

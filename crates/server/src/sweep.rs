// Periodic removal of expired idempotency entries.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::idempotency::IdempotencyCache;

pub fn spawn_sweeper(cache: IdempotencyCache, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match cache.purge_expired().await {
                Ok(0) => debug!("idempotency sweep found nothing to purge"),
                Ok(purged) => info!(purged, "purged expired idempotency entries"),
                Err(error) => warn!(error = %error, "idempotency sweep failed"),
            }
        }
    })
}

use std::sync::Arc;

use anyhow::Context;
use concord_server::{
    api::ApiState,
    app::build_app,
    config::ServerConfig,
    db::{
        migrations::run_migrations,
        pool::{check_pool_health, create_pg_pool, PoolConfig},
    },
    enrich::TextStatsEnricher,
    guard::RecordStore,
    idempotency::IdempotencyCache,
    sweep::spawn_sweeper,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    tracing_subscriber::fmt().json().with_env_filter(EnvFilter::new(&config.log_filter)).init();

    let (records, idempotency) = match config.database_url.as_deref() {
        Some(database_url) => {
            let pool = create_pg_pool(database_url, PoolConfig::from_env())
                .await
                .context("failed to initialize PostgreSQL pool")?;
            check_pool_health(&pool).await?;
            run_migrations(&pool).await?;
            (RecordStore::Postgres(pool.clone()), IdempotencyCache::postgres(pool))
        }
        None => {
            warn!("CONCORD_SERVER_DATABASE_URL unset; records and idempotency entries are kept in memory");
            (RecordStore::memory(), IdempotencyCache::memory())
        }
    };
    let idempotency = idempotency.with_retention(config.idempotency_retention);
    let sweeper = spawn_sweeper(idempotency.clone(), config.sweep_interval);

    let state = ApiState { records, idempotency, enricher: Arc::new(TextStatsEnricher) };
    let app = build_app(state, config.cors_origins.as_deref());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        postgres = config.uses_postgres(),
        retention_secs = config.idempotency_retention.as_secs(),
        "starting record server"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("record server exited unexpectedly");
    sweeper.abort();
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

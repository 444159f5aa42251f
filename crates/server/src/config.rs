// Record server configuration.
//
// Environment variables with development defaults. The database pool reads
// its own `CONCORD_SERVER_DB_*` tuning variables in `db::pool`.

use std::net::SocketAddr;
use std::time::Duration;

use crate::idempotency::DEFAULT_RETENTION;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string. Without it the server keeps records and
    /// idempotency entries in memory.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `concord_server=debug`).
    pub log_filter: String,
    pub idempotency_retention: Duration,
    /// How often expired idempotency entries are deleted.
    pub sweep_interval: Duration,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CONCORD_SERVER_HOST` | `0.0.0.0` |
    /// | `CONCORD_SERVER_PORT` | `8080` |
    /// | `CONCORD_SERVER_DATABASE_URL` | *(none, in-memory stores)* |
    /// | `CONCORD_SERVER_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `CONCORD_SERVER_LOG_FILTER` | `info` |
    /// | `CONCORD_SERVER_IDEMPOTENCY_RETENTION_SECS` | `86400` |
    /// | `CONCORD_SERVER_SWEEP_INTERVAL_SECS` | `300` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("CONCORD_SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("CONCORD_SERVER_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url = env("CONCORD_SERVER_DATABASE_URL").ok().filter(|url| !url.trim().is_empty());
        let cors_origins = env("CONCORD_SERVER_CORS_ORIGINS").ok();
        let log_filter = env("CONCORD_SERVER_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let idempotency_retention = positive_secs(&env, "CONCORD_SERVER_IDEMPOTENCY_RETENTION_SECS")
            .unwrap_or(DEFAULT_RETENTION);
        let sweep_interval =
            positive_secs(&env, "CONCORD_SERVER_SWEEP_INTERVAL_SECS").unwrap_or(DEFAULT_SWEEP_INTERVAL);

        Self { listen_addr, database_url, cors_origins, log_filter, idempotency_retention, sweep_interval }
    }

    pub fn uses_postgres(&self) -> bool {
        self.database_url.is_some()
    }
}

fn positive_secs<F>(env: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    env(key).ok().and_then(|v| v.trim().parse::<u64>().ok()).filter(|secs| *secs > 0).map(Duration::from_secs)
}

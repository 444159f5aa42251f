// Durable lease store in a device-local SQLite file.
//
// Every session process opens its own connection to the same file. Writes from
// other connections are detected by polling `PRAGMA data_version`, which only
// moves when another connection commits, and diffing the table against the
// last snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{LeaseStore, StoreChange, CHANGE_CHANNEL_CAPACITY};

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE lease_entries (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SqliteLeaseStore {
    inner: Arc<SqliteInner>,
}

#[derive(Debug)]
struct SqliteInner {
    path: PathBuf,
    state: Mutex<SqliteState>,
    changes: broadcast::Sender<StoreChange>,
}

#[derive(Debug)]
struct SqliteState {
    conn: Connection,
    data_version: i64,
    snapshot: HashMap<String, String>,
}

impl SqliteLeaseStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create lease store parent directory `{}`", parent.display())
            })?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("failed to open lease store at `{}`", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT).context("failed to set lease store busy timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("failed to configure sqlite pragmas for lease store")?;

        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;

        let data_version = data_version(&conn)?;
        let snapshot = load_entries(&conn)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(SqliteInner {
                path: path.to_path_buf(),
                state: Mutex::new(SqliteState { conn, data_version, snapshot }),
                changes,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn schema_version(&self) -> Result<i64> {
        current_schema_version(&self.state()?.conn)
    }

    /// Emit notifications for rows changed by other connections since the
    /// last poll. Returns the number of changed keys.
    pub fn poll_changes(&self) -> Result<usize> {
        let changes = {
            let mut state = self.state()?;
            let version = data_version(&state.conn)?;
            if version == state.data_version {
                return Ok(0);
            }
            state.data_version = version;

            let current = load_entries(&state.conn)?;
            let changes = diff_entries(&state.snapshot, &current);
            state.snapshot = current;
            changes
        };

        for change in &changes {
            self.emit(change.clone());
        }
        Ok(changes.len())
    }

    /// Poll for foreign writes every `interval` until the store is dropped.
    pub fn spawn_change_poller(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<SqliteInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("lease store dropped, stopping change poller");
                    break;
                };
                let store = SqliteLeaseStore { inner };
                if let Err(error) = store.poll_changes() {
                    warn!(path = %store.path().display(), error = %error, "lease store poll failed");
                }
            }
        })
    }

    fn state(&self) -> Result<MutexGuard<'_, SqliteState>> {
        self.inner.state.lock().map_err(|_| anyhow!("sqlite lease store lock poisoned"))
    }

    fn emit(&self, change: StoreChange) {
        let _ = self.inner.changes.send(change);
    }
}

impl LeaseStore for SqliteLeaseStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let state = self.state()?;
        read_value(&state.conn, key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        {
            let mut state = self.state()?;
            upsert_value(&state.conn, key, value)?;
            state.snapshot.insert(key.to_owned(), value.to_owned());
        }
        self.emit(StoreChange { key: key.to_owned(), value: Some(value.to_owned()) });
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let removed = {
            let mut state = self.state()?;
            let deleted = delete_value(&state.conn, key)?;
            state.snapshot.remove(key);
            deleted
        };
        if removed {
            self.emit(StoreChange { key: key.to_owned(), value: None });
        }
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool> {
        {
            let mut state = self.state()?;
            let tx = state
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start lease store transaction")?;

            let current = read_value(&tx, key)?;
            if current.as_deref() != expected {
                return Ok(false);
            }
            match new {
                Some(value) => upsert_value(&tx, key, value)?,
                None => {
                    delete_value(&tx, key)?;
                }
            }
            tx.commit().context("failed to commit lease store transaction")?;

            match new {
                Some(value) => {
                    state.snapshot.insert(key.to_owned(), value.to_owned());
                }
                None => {
                    state.snapshot.remove(key);
                }
            }
        }
        self.emit(StoreChange { key: key.to_owned(), value: new.map(ToOwned::to_owned) });
        Ok(true)
    }

    fn watch(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.changes.subscribe()
    }
}

fn read_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row("SELECT value FROM lease_entries WHERE key = ?1", params![key], |row| {
        row.get(0)
    })
    .optional()
    .with_context(|| format!("failed to read lease store key `{key}`"))
}

fn upsert_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO lease_entries (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, chrono::Utc::now().to_rfc3339()],
    )
    .with_context(|| format!("failed to write lease store key `{key}`"))?;
    Ok(())
}

fn delete_value(conn: &Connection, key: &str) -> Result<bool> {
    let deleted = conn
        .execute("DELETE FROM lease_entries WHERE key = ?1", params![key])
        .with_context(|| format!("failed to delete lease store key `{key}`"))?;
    Ok(deleted > 0)
}

fn load_entries(conn: &Connection) -> Result<HashMap<String, String>> {
    let mut stmt = conn
        .prepare("SELECT key, value FROM lease_entries")
        .context("failed to prepare lease store scan")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .context("failed to scan lease store")?;

    let mut entries = HashMap::new();
    for row in rows {
        let (key, value) = row.context("failed to decode lease store row")?;
        entries.insert(key, value);
    }
    Ok(entries)
}

fn data_version(conn: &Connection) -> Result<i64> {
    conn.query_row("PRAGMA data_version", [], |row| row.get(0))
        .context("failed to read sqlite data_version")
}

fn diff_entries(
    before: &HashMap<String, String>,
    after: &HashMap<String, String>,
) -> Vec<StoreChange> {
    let mut changes: BTreeMap<&str, Option<&str>> = BTreeMap::new();
    for (key, value) in after {
        if before.get(key) != Some(value) {
            changes.insert(key.as_str(), Some(value.as_str()));
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            changes.insert(key.as_str(), None);
        }
    }

    changes
        .into_iter()
        .map(|(key, value)| StoreChange { key: key.to_owned(), value: value.map(ToOwned::to_owned) })
        .collect()
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply lease store migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        current_version = *version;
    }

    Ok(())
}

// Optimistic concurrency guard over versioned records.
//
// A mutation names the version it was based on. The check and the increment
// happen under one per-row lock (`SELECT ... FOR UPDATE` in PostgreSQL, the
// store write lock in memory), so of two writers with the same base version
// exactly one wins and the other sees the new version. An omitted base
// version skips the check but still bumps the version.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use concord_common::types::VersionedRecord;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("stale base version {base_version}; record is at version {}", .current.version)]
    Conflict { base_version: i64, current: Box<VersionedRecord> },
    #[error("record {resource_type}/{id} not found")]
    NotFound { resource_type: String, id: String },
    #[error("record {resource_type}/{id} already exists")]
    AlreadyExists { resource_type: String, id: String },
    /// The mutation itself refused the current record.
    #[error("mutation rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<sqlx::Error> for GuardError {
    fn from(error: sqlx::Error) -> Self {
        Self::Storage(error.into())
    }
}

#[derive(Clone)]
pub enum RecordStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryRecords>>),
}

#[derive(Default)]
pub struct MemoryRecords {
    records: HashMap<(String, String), VersionedRecord>,
}

impl MemoryRecords {
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    resource_type: String,
    id: String,
    version: i64,
    data: Value,
    updated_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RecordRow> for VersionedRecord {
    fn from(row: RecordRow) -> Self {
        Self {
            resource_type: row.resource_type,
            id: row.id,
            version: row.version,
            data: row.data,
            updated_by: row.updated_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl RecordStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryRecords::default())))
    }

    /// Insert a record at version 1.
    pub async fn create(
        &self,
        resource_type: &str,
        id: &str,
        data: Value,
        actor_id: &str,
    ) -> Result<VersionedRecord, GuardError> {
        let record = match self {
            Self::Postgres(pool) => create_pg(pool, resource_type, id, data, actor_id).await?,
            Self::Memory(store) => {
                let mut state = store.write().await;
                let key = (resource_type.to_owned(), id.to_owned());
                if state.records.contains_key(&key) {
                    return Err(already_exists(resource_type, id));
                }
                let now = Utc::now();
                let record = VersionedRecord {
                    resource_type: resource_type.to_owned(),
                    id: id.to_owned(),
                    version: 1,
                    data,
                    updated_by: Some(actor_id.to_owned()),
                    created_at: now,
                    updated_at: now,
                };
                state.records.insert(key, record.clone());
                record
            }
        };
        debug!(resource_type, id, "record created");
        Ok(record)
    }

    pub async fn get(&self, resource_type: &str, id: &str) -> Result<VersionedRecord, GuardError> {
        let found = match self {
            Self::Postgres(pool) => sqlx::query_as::<_, RecordRow>(
                r#"
                SELECT resource_type, id, version, data, updated_by, created_at, updated_at
                FROM versioned_records
                WHERE resource_type = $1 AND id = $2
                "#,
            )
            .bind(resource_type)
            .bind(id)
            .fetch_optional(pool)
            .await?
            .map(VersionedRecord::from),
            Self::Memory(store) => {
                store.read().await.records.get(&(resource_type.to_owned(), id.to_owned())).cloned()
            }
        };
        found.ok_or_else(|| not_found(resource_type, id))
    }

    /// Replace the record's data if it is still at `base_version`.
    pub async fn update(
        &self,
        resource_type: &str,
        id: &str,
        base_version: Option<i64>,
        data: Value,
        actor_id: &str,
    ) -> Result<VersionedRecord, GuardError> {
        self.apply(resource_type, id, base_version, actor_id, move |_| Ok(data)).await
    }

    /// Compute new data from the locked current record and store it with the
    /// version bumped by one. `mutate` runs while the row is locked and must
    /// not block.
    pub async fn apply<F>(
        &self,
        resource_type: &str,
        id: &str,
        base_version: Option<i64>,
        actor_id: &str,
        mutate: F,
    ) -> Result<VersionedRecord, GuardError>
    where
        F: FnOnce(&VersionedRecord) -> Result<Value, GuardError> + Send,
    {
        let record = match self {
            Self::Postgres(pool) => {
                apply_pg(pool, resource_type, id, base_version, actor_id, mutate).await?
            }
            Self::Memory(store) => {
                let mut state = store.write().await;
                let Some(current) = state.records.get_mut(&(resource_type.to_owned(), id.to_owned()))
                else {
                    return Err(not_found(resource_type, id));
                };
                check_base_version(current, base_version)?;

                let data = mutate(current)?;
                current.data = data;
                current.version += 1;
                current.updated_by = Some(actor_id.to_owned());
                current.updated_at = Utc::now();
                current.clone()
            }
        };
        debug!(resource_type, id, ?base_version, version = record.version, "record updated");
        Ok(record)
    }
}

fn check_base_version(current: &VersionedRecord, base_version: Option<i64>) -> Result<(), GuardError> {
    match base_version {
        Some(base_version) if base_version != current.version => Err(GuardError::Conflict {
            base_version,
            current: Box::new(current.clone()),
        }),
        _ => Ok(()),
    }
}

fn not_found(resource_type: &str, id: &str) -> GuardError {
    GuardError::NotFound { resource_type: resource_type.to_owned(), id: id.to_owned() }
}

fn already_exists(resource_type: &str, id: &str) -> GuardError {
    GuardError::AlreadyExists { resource_type: resource_type.to_owned(), id: id.to_owned() }
}

async fn create_pg(
    pool: &PgPool,
    resource_type: &str,
    id: &str,
    data: Value,
    actor_id: &str,
) -> Result<VersionedRecord, GuardError> {
    let row = sqlx::query_as::<_, RecordRow>(
        r#"
        INSERT INTO versioned_records (resource_type, id, version, data, updated_by)
        VALUES ($1, $2, 1, $3, $4)
        ON CONFLICT (resource_type, id) DO NOTHING
        RETURNING resource_type, id, version, data, updated_by, created_at, updated_at
        "#,
    )
    .bind(resource_type)
    .bind(id)
    .bind(data)
    .bind(actor_id)
    .fetch_optional(pool)
    .await?;

    row.map(VersionedRecord::from).ok_or_else(|| already_exists(resource_type, id))
}

async fn apply_pg<F>(
    pool: &PgPool,
    resource_type: &str,
    id: &str,
    base_version: Option<i64>,
    actor_id: &str,
    mutate: F,
) -> Result<VersionedRecord, GuardError>
where
    F: FnOnce(&VersionedRecord) -> Result<Value, GuardError> + Send,
{
    let mut tx = pool.begin().await?;

    let current = sqlx::query_as::<_, RecordRow>(
        r#"
        SELECT resource_type, id, version, data, updated_by, created_at, updated_at
        FROM versioned_records
        WHERE resource_type = $1 AND id = $2
        FOR UPDATE
        "#,
    )
    .bind(resource_type)
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .map(VersionedRecord::from)
    .ok_or_else(|| not_found(resource_type, id))?;

    // Dropping `tx` on any early return rolls back and releases the row lock.
    check_base_version(&current, base_version)?;
    let data = mutate(&current)?;

    let row = sqlx::query_as::<_, RecordRow>(
        r#"
        UPDATE versioned_records
        SET data = $3,
            version = version + 1,
            updated_by = $4,
            updated_at = now()
        WHERE resource_type = $1 AND id = $2
        RETURNING resource_type, id, version, data, updated_by, created_at, updated_at
        "#,
    )
    .bind(resource_type)
    .bind(id)
    .bind(data)
    .bind(actor_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(row.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    async fn seeded() -> RecordStore {
        let store = RecordStore::memory();
        store.create("note", "note123", json!({"body": "v1"}), "user-a").await.unwrap();
        store
    }

    #[tokio::test]
    async fn create_starts_at_version_one() {
        let store = RecordStore::memory();
        let record = store.create("note", "n1", json!({}), "user-a").await.unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.updated_by.as_deref(), Some("user-a"));

        let error = store.create("note", "n1", json!({}), "user-b").await.unwrap_err();
        assert!(matches!(error, GuardError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn matching_base_version_increments() {
        let store = seeded().await;
        let record =
            store.update("note", "note123", Some(1), json!({"body": "v2"}), "user-b").await.unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.data["body"], "v2");
        assert_eq!(record.updated_by.as_deref(), Some("user-b"));
    }

    #[tokio::test]
    async fn stale_base_version_conflicts_with_current_snapshot() {
        let store = seeded().await;
        store.update("note", "note123", Some(1), json!({"body": "a"}), "user-a").await.unwrap();

        let error =
            store.update("note", "note123", Some(1), json!({"body": "b"}), "user-b").await.unwrap_err();
        let GuardError::Conflict { base_version, current } = error else {
            panic!("expected conflict, got {error:?}");
        };
        assert_eq!(base_version, 1);
        assert_eq!(current.version, 2);
        assert_eq!(current.data["body"], "a");

        // The rejected write left no trace.
        assert_eq!(store.get("note", "note123").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn force_save_skips_check_but_bumps_version() {
        let store = seeded().await;
        store.update("note", "note123", Some(1), json!({"body": "a"}), "user-a").await.unwrap();
        let record =
            store.update("note", "note123", None, json!({"body": "forced"}), "user-b").await.unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(record.data["body"], "forced");
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let store = RecordStore::memory();
        let error = store.update("note", "nope", Some(1), json!({}), "user-a").await.unwrap_err();
        assert!(matches!(error, GuardError::NotFound { .. }));
        assert!(matches!(store.get("note", "nope").await, Err(GuardError::NotFound { .. })));
    }

    #[tokio::test]
    async fn rejected_mutation_leaves_record_untouched() {
        let store = seeded().await;
        let error = store
            .apply("note", "note123", Some(1), "user-a", |_| Err(GuardError::Rejected("no".into())))
            .await
            .unwrap_err();
        assert!(matches!(error, GuardError::Rejected(_)));
        assert_eq!(store.get("note", "note123").await.unwrap().version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_with_same_base_version_yield_one_winner() {
        let store = seeded().await;
        let mut tasks = Vec::new();
        for writer in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .update("note", "note123", Some(1), json!({ "writer": writer }), "user-a")
                    .await
            }));
        }

        let mut wins = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(record) => {
                    assert_eq!(record.version, 2);
                    wins += 1;
                }
                Err(GuardError::Conflict { current, .. }) => {
                    assert_eq!(current.version, 2);
                    conflicts += 1;
                }
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(store.get("note", "note123").await.unwrap().version, 2);
    }

    proptest! {
        #[test]
        fn version_counts_successful_writes(bases in proptest::collection::vec(proptest::option::of(0i64..6), 1..24)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let store = seeded().await;
                let mut successes = 0i64;
                for base in bases {
                    let current = store.get("note", "note123").await.unwrap().version;
                    match store.update("note", "note123", base, json!({}), "user-a").await {
                        Ok(record) => {
                            successes += 1;
                            prop_assert!(base.is_none() || base == Some(current));
                            prop_assert_eq!(record.version, current + 1);
                        }
                        Err(GuardError::Conflict { current: snapshot, .. }) => {
                            prop_assert_ne!(base, Some(current));
                            prop_assert_eq!(snapshot.version, current);
                        }
                        Err(other) => prop_assert!(false, "unexpected error {:?}", other),
                    }
                }
                let final_version = store.get("note", "note123").await.unwrap().version;
                prop_assert_eq!(final_version, 1 + successes);
                Ok(())
            })?;
        }
    }
}

// Lease Store: device-local key/value area shared by every session.
//
// Values are opaque strings (JSON in practice). Writers coordinate only through
// `compare_and_swap`; readers learn about writes from `watch`.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use tokio::sync::broadcast;

pub use memory::MemoryLeaseStore;
pub use sqlite::SqliteLeaseStore;

/// Capacity of the change-notification channel.
pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// A key was written (`Some`) or removed (`None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    pub value: Option<String>,
}

pub trait LeaseStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Atomically replace the value under `key` when it currently equals
    /// `expected` (`None` = absent). A `new` of `None` deletes the key.
    ///
    /// Returns `false` without writing when the current value differs.
    fn compare_and_swap(&self, key: &str, expected: Option<&str>, new: Option<&str>)
        -> Result<bool>;

    /// Change notifications for every key, including this handle's own writes.
    fn watch(&self) -> broadcast::Receiver<StoreChange>;
}

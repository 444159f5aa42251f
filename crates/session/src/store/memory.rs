// In-process lease store. Clones share one map, like tabs sharing one origin's
// storage area.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use tokio::sync::broadcast;

use super::{LeaseStore, StoreChange, CHANGE_CHANNEL_CAPACITY};

#[derive(Debug, Clone)]
pub struct MemoryLeaseStore {
    inner: Arc<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    entries: Mutex<HashMap<String, String>>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { inner: Arc::new(MemoryInner { entries: Mutex::new(HashMap::new()), changes }) }
    }

    pub fn len(&self) -> usize {
        self.entries().map(|entries| entries.len()).unwrap_or(0)
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, String>>> {
        self.inner.entries.lock().map_err(|_| anyhow!("memory lease store lock poisoned"))
    }

    fn emit(&self, key: &str, value: Option<&str>) {
        // No receivers is fine: nobody is watching yet.
        let _ = self
            .inner
            .changes
            .send(StoreChange { key: key.to_owned(), value: value.map(ToOwned::to_owned) });
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries()?.insert(key.to_owned(), value.to_owned());
        self.emit(key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let removed = self.entries()?.remove(key);
        if removed.is_some() {
            self.emit(key, None);
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
            let mut entries = self.entries()?;
            if entries.get(key).map(String::as_str) != expected {
                return Ok(false);
            }
            match new {
                Some(value) => {
                    entries.insert(key.to_owned(), value.to_owned());
                }
                None => {
                    entries.remove(key);
                }
            }
        }
        self.emit(key, new);
        Ok(true)
    }

    fn watch(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_entries() {
        let a = MemoryLeaseStore::new();
        let b = a.clone();
        a.set("k", "v").unwrap();
        assert_eq!(b.get("k").unwrap().as_deref(), Some("v"));
        b.remove("k").unwrap();
        assert_eq!(a.get("k").unwrap(), None);
    }

    #[test]
    fn compare_and_swap_only_writes_on_match() {
        let store = MemoryLeaseStore::new();
        assert!(store.compare_and_swap("k", None, Some("one")).unwrap());
        assert!(!store.compare_and_swap("k", None, Some("two")).unwrap());
        assert!(!store.compare_and_swap("k", Some("stale"), Some("two")).unwrap());
        assert_eq!(store.get("k").unwrap().as_deref(), Some("one"));

        assert!(store.compare_and_swap("k", Some("one"), None).unwrap());
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn watchers_see_writes_and_removals() {
        let store = MemoryLeaseStore::new();
        let mut rx = store.watch();

        store.set("k", "v").unwrap();
        store.remove("k").unwrap();
        store.remove("k").unwrap();

        assert_eq!(rx.try_recv().unwrap(), StoreChange { key: "k".into(), value: Some("v".into()) });
        assert_eq!(rx.try_recv().unwrap(), StoreChange { key: "k".into(), value: None });
        assert!(rx.try_recv().is_err(), "removing a missing key must not notify");
    }

    #[test]
    fn failed_swap_does_not_notify() {
        let store = MemoryLeaseStore::new();
        store.set("k", "v").unwrap();
        let mut rx = store.watch();
        assert!(!store.compare_and_swap("k", None, Some("x")).unwrap());
        assert!(rx.try_recv().is_err());
    }
}

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Lookups of unknown keys are a normal, non-fatal outcome.
    #[error("no value found for key {0}")]
    NotFound(String),
}

/// Key/value storage for tasks and task events. The in-memory
/// implementation below is the default; a durable implementation can be
/// swapped in behind the same trait without touching callers.
pub trait Store<T>: Send + Sync {
    /// Upsert.
    fn put(&self, key: &str, value: T) -> Result<(), StoreError>;
    /// Returns a copy of the stored value.
    fn get(&self, key: &str) -> Result<T, StoreError>;
    /// Snapshot of all values. Order is unspecified but stable within one
    /// call.
    fn list(&self) -> Result<Vec<T>, StoreError>;
    fn count(&self) -> Result<usize, StoreError>;
}

/// A mapping under a mutex.
#[derive(Debug, Default)]
pub struct InMemoryStore<T> {
    items: Mutex<HashMap<String, T>>,
}

impl<T> InMemoryStore<T> {
    pub fn new() -> Self {
        InMemoryStore {
            items: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone + Send + Sync> Store<T> for InMemoryStore<T> {
    fn put(&self, key: &str, value: T) -> Result<(), StoreError> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<T, StoreError> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn list(&self) -> Result<Vec<T>, StoreError> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        Ok(items.values().cloned().collect())
    }

    fn count(&self) -> Result<usize, StoreError> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        Ok(items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    #[test]
    fn get_returns_what_put_stored() {
        let store = InMemoryStore::new();
        let task = Task {
            name: "t1".to_string(),
            ..Task::default()
        };
        store.put(&task.id.to_string(), task.clone()).unwrap();

        let fetched = store.get(&task.id.to_string()).unwrap();
        assert_eq!(fetched, task);
    }

    #[test]
    fn get_of_unknown_key_is_not_found() {
        let store: InMemoryStore<Task> = InMemoryStore::new();
        let err = store.get("missing").unwrap_err();
        assert_eq!(err, StoreError::NotFound("missing".to_string()));
    }

    #[test]
    fn put_is_an_upsert() {
        let store = InMemoryStore::new();
        let mut task = Task::default();
        let key = task.id.to_string();

        store.put(&key, task.clone()).unwrap();
        task.name = "renamed".to_string();
        store.put(&key, task.clone()).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.get(&key).unwrap().name, "renamed");
    }

    #[test]
    fn list_snapshots_all_values() {
        let store = InMemoryStore::new();
        for _ in 0..3 {
            let task = Task::default();
            store.put(&task.id.to_string(), task).unwrap();
        }

        assert_eq!(store.list().unwrap().len(), 3);
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn empty_store_counts_zero() {
        let store: InMemoryStore<Task> = InMemoryStore::new();
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.list().unwrap().is_empty());
    }
}

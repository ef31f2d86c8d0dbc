//! Schema-tagged persistence of the task map and the dismissed-id set.
//!
//! Both collections are stored as JSON envelopes
//! `{"schema": "<namespace>.<collection>.v1", "data": ...}`. A blob with an
//! unknown schema is discarded (cache miss); a bare legacy blob of the
//! right shape is accepted and rewritten on the next save.
//!
//! Nothing here returns an error to the caller. Storage and serialization
//! failures are logged and treated as no-ops or cache misses; the caller's
//! in-memory state stays authoritative.

use pullsync_core::{DismissedSet, TaskMap};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::{StorageSubscription, TabStorage};

/// Schema version written by this build.
const SCHEMA_VERSION: u32 = 1;

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "pullsync";

/// Storage keys and schema tags for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeys {
    pub tasks: String,
    pub dismissed: String,
}

impl CacheKeys {
    pub fn new(namespace: &str) -> Self {
        Self {
            tasks: format!("{namespace}.tasks"),
            dismissed: format!("{namespace}.dismissed"),
        }
    }

    fn schema_for(key: &str) -> String {
        format!("{key}.v{SCHEMA_VERSION}")
    }
}

impl Default for CacheKeys {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

/// Contents read at process start.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CacheSnapshot {
    pub tasks: TaskMap,
    pub dismissed: DismissedSet,
}

/// A sibling tab changed one of the collections.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheChange {
    Tasks(TaskMap),
    /// `None` when the key was removed, i.e. the cache was cleared.
    Dismissed(Option<DismissedSet>),
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    schema: &'a str,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope {
    schema: String,
    data: Value,
}

/// Owner of the durable copy of both collections.
#[derive(Clone)]
pub struct PersistentCache {
    storage: TabStorage,
    keys: CacheKeys,
}

impl PersistentCache {
    pub fn new(storage: TabStorage, keys: CacheKeys) -> Self {
        Self { storage, keys }
    }

    pub fn keys(&self) -> &CacheKeys {
        &self.keys
    }

    /// Read both collections. Missing, unreadable or foreign-schema blobs
    /// load as empty.
    pub fn load(&self) -> CacheSnapshot {
        let tasks = self
            .read::<TaskMap>(&self.keys.tasks)
            .map(fill_ids)
            .unwrap_or_default();
        let dismissed = self
            .read::<DismissedSet>(&self.keys.dismissed)
            .unwrap_or_default();

        tracing::debug!(
            tasks = tasks.len(),
            dismissed = dismissed.len(),
            "Loaded task cache",
        );

        CacheSnapshot { tasks, dismissed }
    }

    /// Persist the task map.
    pub fn save(&self, tasks: &TaskMap) {
        self.write(&self.keys.tasks, tasks);
    }

    /// Persist the dismissed-id set.
    pub fn save_dismissed(&self, ids: &DismissedSet) {
        self.write(&self.keys.dismissed, ids);
    }

    /// Receive the other tabs' changes to either collection.
    pub fn subscribe(&self) -> CacheSubscription {
        CacheSubscription {
            events: self.storage.subscribe(),
            keys: self.keys.clone(),
        }
    }

    fn write<T: Serialize>(&self, key: &str, data: &T) {
        let schema = CacheKeys::schema_for(key);
        let encoded = match serde_json::to_string(&EnvelopeRef {
            schema: &schema,
            data,
        }) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to serialize cache entry");
                return;
            }
        };
        if let Err(e) = self.storage.set(key, &encoded) {
            tracing::warn!(key, error = %e, "Failed to write cache entry");
        }
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.storage.get(key) {
            Ok(Some(raw)) => decode(key, &raw),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to read cache entry");
                None
            }
        }
    }
}

/// Decode a stored blob, accepting the current envelope or a legacy bare
/// value.
fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Option<T> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(key, error = %e, "Discarding unparseable cache entry");
            return None;
        }
    };

    let expected = CacheKeys::schema_for(key);
    let is_envelope = value.get("schema").is_some_and(Value::is_string) && value.get("data").is_some();
    let data = if is_envelope {
        match serde_json::from_value::<Envelope>(value) {
            Ok(envelope) if envelope.schema == expected => envelope.data,
            Ok(envelope) => {
                tracing::warn!(
                    key,
                    schema = %envelope.schema,
                    expected = %expected,
                    "Discarding cache entry with unknown schema",
                );
                return None;
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Discarding malformed cache envelope");
                return None;
            }
        }
    } else {
        tracing::info!(key, "Migrating legacy cache entry without schema tag");
        value
    };

    match serde_json::from_value(data) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            tracing::warn!(key, error = %e, "Discarding cache entry with unexpected shape");
            None
        }
    }
}

fn fill_ids(mut tasks: TaskMap) -> TaskMap {
    for (id, task) in tasks.iter_mut() {
        if task.id.is_empty() {
            task.id = id.clone();
        }
    }
    tasks
}

// ---------------------------------------------------------------------------
// CacheSubscription
// ---------------------------------------------------------------------------

/// Decoded stream of sibling-tab changes.
pub struct CacheSubscription {
    events: StorageSubscription,
    keys: CacheKeys,
}

impl CacheSubscription {
    /// Next change to one of the two collections. Events for other keys and
    /// undecodable values are skipped. A removed task map reads as empty; a
    /// removed dismissed set reads as `Dismissed(None)`. Returns `None` once
    /// the bus is gone.
    pub async fn recv(&mut self) -> Option<CacheChange> {
        loop {
            let event = self.events.recv().await?;
            let raw = event.new_value.as_deref();

            if event.key == self.keys.tasks {
                let tasks = match raw {
                    Some(raw) => decode::<TaskMap>(&event.key, raw).map(fill_ids),
                    None => Some(TaskMap::new()),
                };
                if let Some(tasks) = tasks {
                    return Some(CacheChange::Tasks(tasks));
                }
            } else if event.key == self.keys.dismissed {
                match raw {
                    Some(raw) => {
                        if let Some(dismissed) = decode::<DismissedSet>(&event.key, raw) {
                            return Some(CacheChange::Dismissed(Some(dismissed)));
                        }
                    }
                    None => return Some(CacheChange::Dismissed(None)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::{KeyValueStore, MemoryStore, StorageError};
    use pullsync_core::{Task, TaskStatus};

    fn cache_over(store: Arc<dyn KeyValueStore>) -> PersistentCache {
        PersistentCache::new(TabStorage::standalone(store), CacheKeys::default())
    }

    #[test]
    fn save_then_load() {
        let cache = cache_over(Arc::new(MemoryStore::new()));
        let mut tasks = TaskMap::new();
        tasks.insert("t1".into(), Task::new("t1", "llama3").with_status(TaskStatus::Running));
        let dismissed: DismissedSet = ["t0".to_string()].into();

        cache.save(&tasks);
        cache.save_dismissed(&dismissed);

        let snapshot = cache.load();
        assert_eq!(snapshot.tasks, tasks);
        assert_eq!(snapshot.dismissed, dismissed);
    }

    #[test]
    fn writes_schema_envelope() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(store.clone());
        cache.save_dismissed(&["x".to_string()].into());

        let raw = store.get("pullsync.dismissed").unwrap().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["schema"], "pullsync.dismissed.v1");
        assert_eq!(value["data"], serde_json::json!(["x"]));
    }

    #[test]
    fn unknown_schema_is_a_cache_miss() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("pullsync.dismissed", r#"{"schema":"pullsync.dismissed.v9","data":["x"]}"#)
            .unwrap();
        assert!(cache_over(store).load().dismissed.is_empty());
    }

    #[test]
    fn legacy_bare_blob_is_migrated() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("pullsync.tasks", r#"{"t9":{"subjectName":"phi3","status":"completed"}}"#)
            .unwrap();

        let snapshot = cache_over(store).load();
        assert_eq!(snapshot.tasks["t9"].id, "t9");
        assert_eq!(snapshot.tasks["t9"].status, TaskStatus::Completed);
    }

    #[test]
    fn corrupt_blob_loads_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set("pullsync.tasks", "{not json").unwrap();
        store.set("pullsync.dismissed", r#"{"unexpected":true}"#).unwrap();

        let snapshot = cache_over(store).load();
        assert!(snapshot.tasks.is_empty());
        assert!(snapshot.dismissed.is_empty());
    }

    /// A store whose writes always fail.
    struct FullStore;

    impl KeyValueStore for FullStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Io(std::io::Error::other("unavailable")))
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::other("quota exceeded")))
        }
        fn remove(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[test]
    fn storage_failures_never_escape() {
        let cache = cache_over(Arc::new(FullStore));
        cache.save(&TaskMap::new());
        cache.save_dismissed(&DismissedSet::new());
        assert_eq!(cache.load(), CacheSnapshot::default());
    }
}

//! Cross-tab change notification.
//!
//! Several engine instances may share one storage substrate, the way browser
//! tabs share local storage. Tabs never share memory: each write through a
//! [`TabStorage`] is published on the [`StorageBus`] as a [`StorageEvent`],
//! and every *other* tab attached to the same [`SharedStorage`] receives it
//! from its [`StorageSubscription`]. The writing tab never sees its own
//! events.

use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::storage::{KeyValueStore, StorageError};

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

/// A write to one key, as seen by the other tabs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
    /// Tab that performed the write.
    pub origin: Uuid,
}

/// Fan-out channel for [`StorageEvent`]s.
#[derive(Debug, Clone)]
pub struct StorageBus {
    sender: broadcast::Sender<StorageEvent>,
}

impl StorageBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped silently when nobody
    /// listens.
    pub fn publish(&self, event: StorageEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.sender.subscribe()
    }
}

impl Default for StorageBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// SharedStorage / TabStorage
// ---------------------------------------------------------------------------

/// A storage substrate plus the bus its tabs announce writes on.
#[derive(Clone)]
pub struct SharedStorage {
    store: Arc<dyn KeyValueStore>,
    bus: StorageBus,
}

impl SharedStorage {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            bus: StorageBus::default(),
        }
    }

    /// Attach a new tab with a fresh identity.
    pub fn attach_tab(&self) -> TabStorage {
        TabStorage {
            tab_id: Uuid::new_v4(),
            store: Arc::clone(&self.store),
            bus: self.bus.clone(),
        }
    }
}

/// One tab's handle on a [`SharedStorage`].
#[derive(Clone)]
pub struct TabStorage {
    tab_id: Uuid,
    store: Arc<dyn KeyValueStore>,
    bus: StorageBus,
}

impl TabStorage {
    /// A tab that shares its store with nobody.
    pub fn standalone(store: Arc<dyn KeyValueStore>) -> Self {
        SharedStorage::new(store).attach_tab()
    }

    pub fn tab_id(&self) -> Uuid {
        self.tab_id
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.store.get(key)
    }

    /// Write and announce the new value to the other tabs.
    pub fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.store.set(key, value)?;
        self.bus.publish(StorageEvent {
            key: key.to_string(),
            new_value: Some(value.to_string()),
            origin: self.tab_id,
        });
        Ok(())
    }

    /// Remove and announce the removal to the other tabs.
    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.store.remove(key)?;
        self.bus.publish(StorageEvent {
            key: key.to_string(),
            new_value: None,
            origin: self.tab_id,
        });
        Ok(())
    }

    /// Receive writes made by the other tabs, from now on.
    pub fn subscribe(&self) -> StorageSubscription {
        StorageSubscription {
            tab_id: self.tab_id,
            receiver: self.bus.subscribe(),
        }
    }
}

/// Stream of other tabs' writes.
pub struct StorageSubscription {
    tab_id: Uuid,
    receiver: broadcast::Receiver<StorageEvent>,
}

impl StorageSubscription {
    /// Next event from another tab. Returns `None` once the bus is gone.
    ///
    /// When this subscriber falls behind, the skipped events are lost; the
    /// next value read for the same key supersedes them, so this only logs.
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.origin == self.tab_id => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        tab_id = %self.tab_id,
                        skipped,
                        "Storage subscriber lagged, events dropped",
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

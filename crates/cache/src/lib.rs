//! Durable local cache for the task map and the dismissed-id set.
//!
//! This crate provides:
//!
//! - [`KeyValueStore`]: the synchronous storage substrate, with
//!   [`MemoryStore`] and [`FileStore`] implementations.
//! - [`SharedStorage`] / [`TabStorage`]: a substrate shared by several
//!   engine instances ("tabs"), where every write is announced to the other
//!   tabs over a [`StorageBus`].
//! - [`PersistentCache`]: schema-tagged load/save of the two collections
//!   and decoding of sibling-tab changes into [`CacheChange`]s.

pub mod bus;
pub mod cache;
pub mod storage;

pub use bus::{SharedStorage, StorageBus, StorageEvent, StorageSubscription, TabStorage};
pub use cache::{CacheChange, CacheKeys, CacheSnapshot, CacheSubscription, PersistentCache};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};

//! Integration tests for cache sharing between tabs and across restarts.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pullsync_cache::{
    CacheChange, CacheKeys, FileStore, MemoryStore, PersistentCache, SharedStorage, TabStorage,
};
use pullsync_core::{DismissedSet, Task, TaskMap, TaskStatus};

fn tasks(items: impl IntoIterator<Item = Task>) -> TaskMap {
    items.into_iter().map(|t| (t.id.clone(), t)).collect()
}

// ---------------------------------------------------------------------------
// Test: sibling tab notifications
// ---------------------------------------------------------------------------

/// A task-map save in one tab arrives decoded in the other.
#[tokio::test]
async fn task_save_reaches_sibling_tab() {
    let shared = SharedStorage::new(Arc::new(MemoryStore::new()));
    let tab_a = PersistentCache::new(shared.attach_tab(), CacheKeys::default());
    let tab_b = PersistentCache::new(shared.attach_tab(), CacheKeys::default());
    let mut changes = tab_b.subscribe();

    let saved = tasks([Task::new("t1", "llama3").with_status(TaskStatus::Running)]);
    tab_a.save(&saved);

    let change = tokio::time::timeout(Duration::from_secs(1), changes.recv())
        .await
        .expect("change should arrive")
        .expect("bus should be open");
    assert_eq!(change, CacheChange::Tasks(saved.clone()));

    // Tab B sees the same durable contents on load.
    assert_eq!(tab_b.load().tasks, saved);
}

/// Dismissed-set saves arrive as wholesale replacements.
#[tokio::test]
async fn dismissed_save_reaches_sibling_tab() {
    let shared = SharedStorage::new(Arc::new(MemoryStore::new()));
    let tab_a = PersistentCache::new(shared.attach_tab(), CacheKeys::default());
    let tab_b = PersistentCache::new(shared.attach_tab(), CacheKeys::default());
    let mut changes = tab_b.subscribe();

    let dismissed: DismissedSet = ["t1".to_string(), "t2".to_string()].into();
    tab_a.save_dismissed(&dismissed);

    assert_matches!(changes.recv().await, Some(CacheChange::Dismissed(Some(ids))) => {
        assert_eq!(ids, dismissed);
    });
}

/// Removing the dismissed key is reported apart from an empty set.
#[tokio::test]
async fn cleared_dismissed_key_is_reported_as_none() {
    let shared = SharedStorage::new(Arc::new(MemoryStore::new()));
    let raw = shared.attach_tab();
    let tab_b = PersistentCache::new(shared.attach_tab(), CacheKeys::default());
    let mut changes = tab_b.subscribe();

    raw.remove("pullsync.dismissed").unwrap();

    assert_matches!(changes.recv().await, Some(CacheChange::Dismissed(None)));
}

/// Writes to unrelated keys and other namespaces are ignored.
#[tokio::test]
async fn foreign_keys_are_ignored() {
    let shared = SharedStorage::new(Arc::new(MemoryStore::new()));
    let raw = shared.attach_tab();
    let other_ns = PersistentCache::new(shared.attach_tab(), CacheKeys::new("elsewhere"));
    let ours = PersistentCache::new(shared.attach_tab(), CacheKeys::default());
    let mut changes = ours.subscribe();

    raw.set("theme", "dark").unwrap();
    other_ns.save_dismissed(&["zzz".to_string()].into());
    raw.set("pullsync.dismissed", "not json").unwrap();
    let writer = PersistentCache::new(shared.attach_tab(), CacheKeys::default());
    writer.save_dismissed(&["real".to_string()].into());

    assert_matches!(changes.recv().await, Some(CacheChange::Dismissed(Some(ids))) => {
        assert!(ids.contains("real"));
        assert_eq!(ids.len(), 1);
    });
}

// ---------------------------------------------------------------------------
// Test: durability across restarts
// ---------------------------------------------------------------------------

/// A file-backed cache survives being reopened.
#[test]
fn file_backed_cache_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let cache = PersistentCache::new(
            TabStorage::standalone(Arc::new(FileStore::new(dir.path()))),
            CacheKeys::default(),
        );
        cache.save(&tasks([Task::new("t1", "mistral").with_status(TaskStatus::Completed)]));
        cache.save_dismissed(&["t0".to_string()].into());
    }

    let reopened = PersistentCache::new(
        TabStorage::standalone(Arc::new(FileStore::new(dir.path()))),
        CacheKeys::default(),
    );
    let snapshot = reopened.load();
    assert_eq!(snapshot.tasks["t1"].subject_name, "mistral");
    assert!(snapshot.dismissed.contains("t0"));
}

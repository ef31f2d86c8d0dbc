//! Task-map merges.
//!
//! Two sources feed records into a tab's task map besides its own channels:
//! the authoritative server listing ([`merge_authoritative`]) and sibling
//! tabs sharing the same cache ([`merge_peer`]). Both are idempotent:
//! applying the same input twice changes nothing the second time, because a
//! record whose content already matches is left untouched, `updated_at`
//! included.

use crate::types::{DismissedSet, Task, TaskId, TaskMap, Timestamp};

/// What an authoritative merge did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Ids whose record was inserted or replaced.
    pub changed: Vec<TaskId>,
    /// Ids reported by the server but hidden because they are dismissed.
    pub suppressed: Vec<TaskId>,
}

impl MergeOutcome {
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty()
    }
}

/// Merge a server listing into `local`. The server record wins on every
/// conflict; dismissed ids are skipped and removed from `local` if present.
/// Tasks missing from the listing are kept.
pub fn merge_authoritative(
    local: &mut TaskMap,
    incoming: &TaskMap,
    dismissed: &DismissedSet,
    now: Timestamp,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();

    for (id, remote) in incoming {
        if dismissed.contains(id) {
            outcome.suppressed.push(id.clone());
            local.remove(id);
            continue;
        }

        let mut remote = remote.clone();
        if remote.id.is_empty() {
            remote.id = id.clone();
        }

        match local.get_mut(id) {
            Some(existing) if existing.same_content(&remote) => {}
            Some(existing) => {
                remote.updated_at = Some(now);
                *existing = remote;
                outcome.changed.push(id.clone());
            }
            None => {
                remote.updated_at = Some(now);
                local.insert(id.clone(), remote);
                outcome.changed.push(id.clone());
            }
        }
    }

    outcome
}

/// Merge a sibling tab's task map into `local`, key by key.
///
/// The incoming record replaces the local one unless the local record was
/// touched strictly later. Dismissed ids are never inserted. Local tasks
/// absent from `incoming` are kept. Returns the ids that changed.
pub fn merge_peer(local: &mut TaskMap, incoming: &TaskMap, dismissed: &DismissedSet) -> Vec<TaskId> {
    let mut changed = Vec::new();

    for (id, theirs) in incoming {
        if dismissed.contains(id) {
            continue;
        }
        match local.get(id) {
            Some(ours) if ours.same_content(theirs) => {}
            Some(ours) if is_fresher(ours, theirs) => {}
            _ => {
                local.insert(id.clone(), theirs.clone());
                changed.push(id.clone());
            }
        }
    }

    changed
}

fn is_fresher(ours: &Task, theirs: &Task) -> bool {
    match (ours.last_touched(), theirs.last_touched()) {
        (Some(a), Some(b)) => a > b,
        (Some(_), None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;
    use chrono::{Duration, TimeZone, Utc};

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn map(tasks: impl IntoIterator<Item = Task>) -> TaskMap {
        tasks.into_iter().map(|t| (t.id.clone(), t)).collect()
    }

    #[test]
    fn authoritative_inserts_and_overwrites() {
        let mut local = map([Task::new("a", "m1").with_status(TaskStatus::Running)]);
        let incoming = map([
            Task::new("a", "m1").with_status(TaskStatus::Completed),
            Task::new("b", "m2"),
        ]);

        let outcome = merge_authoritative(&mut local, &incoming, &DismissedSet::new(), t0());

        assert_eq!(outcome.changed, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(local["a"].status, TaskStatus::Completed);
        assert_eq!(local["b"].updated_at, Some(t0()));
    }

    #[test]
    fn authoritative_is_idempotent() {
        let mut local = TaskMap::new();
        let incoming = map([Task::new("a", "m1"), Task::new("b", "m2")]);
        merge_authoritative(&mut local, &incoming, &DismissedSet::new(), t0());
        let after_first = local.clone();

        let later = t0() + Duration::seconds(5);
        let outcome = merge_authoritative(&mut local, &incoming, &DismissedSet::new(), later);

        assert!(outcome.is_noop());
        assert_eq!(local, after_first);
    }

    #[test]
    fn authoritative_skips_and_removes_dismissed() {
        let mut local = map([Task::new("a", "m1")]);
        let incoming = map([Task::new("a", "m1"), Task::new("b", "m2")]);
        let dismissed: DismissedSet = ["a".to_string()].into();

        let outcome = merge_authoritative(&mut local, &incoming, &dismissed, t0());

        assert_eq!(outcome.suppressed, vec!["a".to_string()]);
        assert!(!local.contains_key("a"));
        assert!(local.contains_key("b"));
    }

    #[test]
    fn authoritative_keeps_tasks_missing_from_listing() {
        let mut local = map([Task::new("old", "m0").with_status(TaskStatus::Completed)]);
        merge_authoritative(&mut local, &TaskMap::new(), &DismissedSet::new(), t0());
        assert!(local.contains_key("old"));
    }

    #[test]
    fn authoritative_fills_missing_id_from_key() {
        let mut local = TaskMap::new();
        let mut record = Task::new("", "m1");
        record.id.clear();
        let incoming: TaskMap = [("x".to_string(), record)].into();

        merge_authoritative(&mut local, &incoming, &DismissedSet::new(), t0());
        assert_eq!(local["x"].id, "x");
    }

    #[test]
    fn peer_fresher_local_wins() {
        let mut ours = Task::new("a", "m").with_status(TaskStatus::Completed);
        ours.updated_at = Some(t0() + Duration::seconds(10));
        let mut theirs = Task::new("a", "m").with_status(TaskStatus::Running);
        theirs.updated_at = Some(t0());

        let mut local = map([ours.clone()]);
        let changed = merge_peer(&mut local, &map([theirs]), &DismissedSet::new());

        assert!(changed.is_empty());
        assert_eq!(local["a"], ours);
    }

    #[test]
    fn peer_newer_incoming_wins() {
        let mut ours = Task::new("a", "m").with_status(TaskStatus::Running);
        ours.updated_at = Some(t0());
        let mut theirs = Task::new("a", "m").with_status(TaskStatus::Completed);
        theirs.updated_at = Some(t0() + Duration::seconds(1));

        let mut local = map([ours]);
        let changed = merge_peer(&mut local, &map([theirs.clone()]), &DismissedSet::new());

        assert_eq!(changed, vec!["a".to_string()]);
        assert_eq!(local["a"], theirs);
    }

    #[test]
    fn peer_merge_twice_is_noop() {
        let mut local = map([Task::new("a", "m")]);
        let mut theirs = Task::new("b", "m2");
        theirs.updated_at = Some(t0());
        let incoming = map([theirs]);

        merge_peer(&mut local, &incoming, &DismissedSet::new());
        let snapshot = local.clone();
        let changed = merge_peer(&mut local, &incoming, &DismissedSet::new());

        assert!(changed.is_empty());
        assert_eq!(local, snapshot);
    }

    #[test]
    fn peer_never_inserts_dismissed() {
        let mut local = TaskMap::new();
        let dismissed: DismissedSet = ["a".to_string()].into();
        merge_peer(&mut local, &map([Task::new("a", "m")]), &dismissed);
        assert!(local.is_empty());
    }
}

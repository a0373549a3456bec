//! In-memory index / metadata model (spec §4.7, component C7): a plain
//! `ActionID -> IndexEntry` map, the merge rule used when joining a local
//! and a remote index on startup, and the one-shot LRU-window filter
//! applied before persisting a new index. No running eviction sweep and
//! no size-based eviction: explicitly out of scope (§9).

use crate::model::{ActionId, IndexEntry, OutputId};
use crate::pb;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// How long an entry survives the startup merge before it is dropped from
/// the index that will be persisted on CLOSE (spec §4.6, §8).
pub const LRU_WINDOW_SECONDS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Default)]
pub struct Index {
    entries: HashMap<ActionId, IndexEntry>,
}

impl Index {
    pub fn new() -> Self {
        Index::default()
    }

    pub fn get(&self, action_id: &ActionId) -> Option<&IndexEntry> {
        self.entries.get(action_id)
    }

    pub fn insert(&mut self, action_id: ActionId, entry: IndexEntry) {
        self.entries.insert(action_id, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActionId, &IndexEntry)> {
        self.entries.iter()
    }

    /// Merges `remote` into `self` (the local index), keeping whichever
    /// entry has the strictly later `last_used_at` per ActionID. Ties —
    /// including an ActionID present only locally or only remotely —
    /// break toward local (spec §4.6).
    pub fn merge_remote(mut self, remote: Index) -> Index {
        for (action_id, remote_entry) in remote.entries {
            match self.entries.get(&action_id) {
                Some(local_entry) if local_entry.last_used_at >= remote_entry.last_used_at => {
                    // Local wins on tie or when strictly newer; keep it.
                }
                _ => {
                    self.entries.insert(action_id, remote_entry);
                }
            }
        }
        self
    }

    /// The one-shot LRU-window pass applied at startup (spec §4.6, §8):
    /// entries whose `last_used_at` falls outside the last
    /// [`LRU_WINDOW_SECONDS`] relative to `now` are dropped.
    pub fn filter_lru_window(&self, now: i64) -> Index {
        let cutoff = now - LRU_WINDOW_SECONDS;
        let entries = self
            .entries
            .iter()
            .filter(|(_, e)| e.last_used_at >= cutoff)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Index { entries }
    }

    pub fn to_proto(&self) -> pb::Index {
        let entries = self
            .entries
            .iter()
            .map(|(action_id, entry)| {
                (
                    action_id.0.clone(),
                    pb::IndexEntry {
                        output_id: entry.output_id.as_bytes().to_vec(),
                        size: entry.size,
                        time_nanos: entry.time_nanos,
                        last_used_at: entry.last_used_at,
                    },
                )
            })
            .collect();
        pb::Index { entries }
    }

    pub fn from_proto(proto: pb::Index) -> Index {
        let entries = proto
            .entries
            .into_iter()
            .map(|(action_id, entry)| {
                (
                    ActionId(action_id),
                    IndexEntry {
                        output_id: OutputId(String::from_utf8_lossy(&entry.output_id).into_owned()),
                        size: entry.size,
                        time_nanos: entry.time_nanos,
                        last_used_at: entry.last_used_at,
                    },
                )
            })
            .collect();
        Index { entries }
    }
}

/// Seconds since the Unix epoch, used as the single `LastUsedAt` tick for
/// every write within one process run (spec §4.6 "nowTimestamp").
pub fn now_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs() as i64
}

/// Nanoseconds since the Unix epoch, used for IndexEntry::time_nanos.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(output: &str, last_used_at: i64) -> IndexEntry {
        IndexEntry {
            output_id: OutputId(output.to_string()),
            size: 5,
            time_nanos: 0,
            last_used_at,
        }
    }

    #[test]
    fn merge_prefers_later_last_used_at() {
        let mut local = Index::new();
        local.insert(ActionId("A".into()), entry("local", 10));
        let mut remote = Index::new();
        remote.insert(ActionId("A".into()), entry("remote", 20));

        let merged = local.merge_remote(remote);
        assert_eq!(merged.get(&ActionId("A".into())).unwrap().output_id.0, "remote");
    }

    #[test]
    fn merge_ties_break_toward_local() {
        let mut local = Index::new();
        local.insert(ActionId("A".into()), entry("local", 10));
        let mut remote = Index::new();
        remote.insert(ActionId("A".into()), entry("remote", 10));

        let merged = local.merge_remote(remote);
        assert_eq!(merged.get(&ActionId("A".into())).unwrap().output_id.0, "local");
    }

    #[test]
    fn merge_keeps_remote_only_entries() {
        let local = Index::new();
        let mut remote = Index::new();
        remote.insert(ActionId("A".into()), entry("remote", 10));

        let merged = local.merge_remote(remote);
        assert!(merged.get(&ActionId("A".into())).is_some());
    }

    #[test]
    fn lru_window_drops_stale_entries() {
        let mut idx = Index::new();
        idx.insert(ActionId("fresh".into()), entry("o1", 1_000_000));
        idx.insert(ActionId("stale".into()), entry("o2", 0));

        let now = 1_000_000 + 10;
        let filtered = idx.filter_lru_window(now);
        assert!(filtered.get(&ActionId("fresh".into())).is_some());
        assert!(filtered.get(&ActionId("stale".into())).is_none());
    }

    #[test]
    fn proto_round_trip() {
        let mut idx = Index::new();
        idx.insert(ActionId("A".into()), entry("o1", 42));
        let proto = idx.to_proto();
        let restored = Index::from_proto(proto);
        assert_eq!(restored.get(&ActionId("A".into())), idx.get(&ActionId("A".into())));
    }
}

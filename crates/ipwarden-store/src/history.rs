//! Long-term record of which IPs each user has connected from.
//!
//! Unlike the active-user table, which is cleared every cycle, this store
//! accumulates across cycles and restarts. Operators use it to answer
//! "which addresses has this account ever used" when reviewing a disable.
//!
//! On-disk shape:
//! ```json
//! { "<user>": { "<ip>": { "first_seen": ..., "last_seen": ..., "count": ... } } }
//! ```
//! Entries idle longer than the retention window are pruned.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use ipwarden_core::{UnixSecs, Username};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpHistoryEntry {
    pub first_seen: UnixSecs,
    pub last_seen: UnixSecs,
    pub count: u64,
}

type HistoryMap = BTreeMap<Username, BTreeMap<String, IpHistoryEntry>>;

pub struct IpHistoryStore {
    path: PathBuf,
    state: Mutex<HistoryMap>,
}

impl IpHistoryStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state: HistoryMap = crate::file::load_or_default(&path);
        Self { path, state: Mutex::new(state) }
    }

    fn persist(&self, snapshot: &HistoryMap) {
        if let Err(e) = crate::file::write_atomic(&self.path, snapshot) {
            warn!(error = %e, "failed to persist IP history");
        }
    }

    /// Fold one user's unique IPs into the history.
    pub fn record(&self, username: &str, ips: &BTreeSet<String>, now: UnixSecs) {
        self.record_cycle(std::iter::once((username, ips)), now);
    }

    /// Fold a whole cycle's observations in one write.
    pub fn record_cycle<'a>(
        &self,
        users: impl IntoIterator<Item = (&'a str, &'a BTreeSet<String>)>,
        now: UnixSecs,
    ) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            let mut any = false;
            for (username, ips) in users {
                if ips.is_empty() {
                    continue;
                }
                any = true;
                let user = state.entry(username.to_string()).or_default();
                for ip in ips {
                    match user.get_mut(ip) {
                        Some(entry) => {
                            entry.last_seen = now;
                            entry.count += 1;
                        }
                        None => {
                            user.insert(
                                ip.clone(),
                                IpHistoryEntry { first_seen: now, last_seen: now, count: 1 },
                            );
                        }
                    }
                }
            }
            if !any {
                return;
            }
            state.clone()
        };
        self.persist(&snapshot);
    }

    pub fn user_history(&self, username: &str) -> Option<BTreeMap<String, IpHistoryEntry>> {
        self.state.lock().unwrap().get(username).cloned()
    }

    pub fn tracked_users(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    /// Drop entries idle longer than `retention_secs`; users left with no
    /// entries disappear entirely.
    pub fn prune(&self, retention_secs: f64, now: UnixSecs) {
        let cutoff = now - retention_secs;
        let (changed, snapshot) = {
            let mut state = self.state.lock().unwrap();
            let before: usize = state.values().map(BTreeMap::len).sum();
            state.retain(|_, entries| {
                entries.retain(|_, entry| entry.last_seen > cutoff);
                !entries.is_empty()
            });
            let after: usize = state.values().map(BTreeMap::len).sum();
            (before != after, state.clone())
        };
        if changed {
            self.persist(&snapshot);
        }
    }

    /// Idempotent removal of one user's history (deleted-user cleanup).
    pub fn remove(&self, username: &str) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            if state.remove(username).is_none() {
                return;
            }
            state.clone()
        };
        self.persist(&snapshot);
    }

    pub fn usernames(&self) -> Vec<Username> {
        self.state.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ips(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn record_accumulates_across_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let store = IpHistoryStore::open(dir.path().join("history.json"));

        store.record("alice", &ips(&["198.51.100.1"]), 1000.0);
        store.record("alice", &ips(&["198.51.100.1", "198.51.100.2"]), 1060.0);

        let history = store.user_history("alice").unwrap();
        assert_eq!(history["198.51.100.1"].count, 2);
        assert_eq!(history["198.51.100.1"].first_seen, 1000.0);
        assert_eq!(history["198.51.100.1"].last_seen, 1060.0);
        assert_eq!(history["198.51.100.2"].count, 1);
    }

    #[test]
    fn history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        IpHistoryStore::open(&path).record("alice", &ips(&["198.51.100.1"]), 1000.0);

        let store = IpHistoryStore::open(&path);
        assert_eq!(store.user_history("alice").unwrap()["198.51.100.1"].count, 1);
    }

    #[test]
    fn prune_drops_idle_entries_and_empty_users() {
        let dir = tempfile::tempdir().unwrap();
        let store = IpHistoryStore::open(dir.path().join("history.json"));
        store.record("alice", &ips(&["198.51.100.1"]), 1000.0);
        store.record("bob", &ips(&["203.0.113.9"]), 5000.0);

        store.prune(2000.0, 6000.0);
        assert!(store.user_history("alice").is_none(), "idle user pruned entirely");
        assert!(store.user_history("bob").is_some());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = IpHistoryStore::open(dir.path().join("history.json"));
        store.record("alice", &ips(&["198.51.100.1"]), 1000.0);
        store.remove("alice");
        store.remove("alice");
        assert_eq!(store.tracked_users(), 0);
    }
}

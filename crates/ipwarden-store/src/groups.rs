//! Backup of original group memberships.
//!
//! Group-based disabling replaces a user's groups with the single disabled
//! group; this store remembers the original ids so re-enable can restore
//! them. On-disk shape: `{ "<user>": [<group_id>, ...], ... }`. Unused when
//! the disable method is status-based.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;

use ipwarden_core::Username;

pub struct GroupBackupStore {
    path: PathBuf,
    groups: Mutex<BTreeMap<Username, Vec<i64>>>,
}

impl GroupBackupStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let groups = crate::file::load_or_default(&path);
        Self { path, groups: Mutex::new(groups) }
    }

    fn persist(&self, snapshot: &BTreeMap<Username, Vec<i64>>) {
        if let Err(e) = crate::file::write_atomic(&self.path, snapshot) {
            warn!(error = %e, "failed to persist group backups");
        }
    }

    /// Record `username`'s groups before they are overwritten.
    pub fn save(&self, username: &str, group_ids: Vec<i64>) {
        let snapshot = {
            let mut groups = self.groups.lock().unwrap();
            groups.insert(username.to_string(), group_ids);
            groups.clone()
        };
        self.persist(&snapshot);
    }

    pub fn get(&self, username: &str) -> Option<Vec<i64>> {
        self.groups.lock().unwrap().get(username).cloned()
    }

    pub fn has(&self, username: &str) -> bool {
        self.groups.lock().unwrap().contains_key(username)
    }

    /// Idempotent removal after a successful restore.
    pub fn remove(&self, username: &str) {
        let snapshot = {
            let mut groups = self.groups.lock().unwrap();
            groups.remove(username);
            groups.clone()
        };
        self.persist(&snapshot);
    }

    pub fn usernames(&self) -> Vec<Username> {
        self.groups.lock().unwrap().keys().cloned().collect()
    }
}

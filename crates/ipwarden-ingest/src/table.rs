//! Shared active-user table.
//!
//! Written by every node stream task, read and cleared by the evaluator once
//! per cycle. The snapshot-and-clear is a single critical section, so one
//! evaluator tick is atomic with respect to concurrent appends: writes that
//! race with it simply land in the next cycle.

use std::collections::HashMap;
use std::sync::Mutex;

use ipwarden_core::{NodeId, UnixSecs, UserActivity, Username};

#[derive(Default)]
pub struct ActiveUserTable {
    users: Mutex<HashMap<Username, UserActivity>>,
}

impl ActiveUserTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one parsed log record.
    pub fn record(
        &self,
        username: &str,
        ip: &str,
        node_id: NodeId,
        node_name: &str,
        inbound: &str,
        now: UnixSecs,
    ) {
        let mut users = self.users.lock().unwrap();
        users
            .entry(username.to_string())
            .or_insert_with(|| UserActivity::new(username))
            .observe(ip, node_id, node_name, inbound, now);
    }

    /// Take everything observed since the last call and start the next cycle
    /// empty.
    pub fn snapshot_and_clear(&self) -> HashMap<Username, UserActivity> {
        let mut users = self.users.lock().unwrap();
        std::mem::take(&mut *users)
    }

    /// Non-destructive copy, for status reporting.
    pub fn snapshot(&self) -> HashMap<Username, UserActivity> {
        self.users.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.users.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_clear_empties_the_table() {
        let table = ActiveUserTable::new();
        table.record("alice", "198.51.100.1", 1, "edge-1", "Vless", 0.0);
        table.record("alice", "198.51.100.2", 1, "edge-1", "Vless", 1.0);
        table.record("bob", "198.51.100.3", 2, "edge-2", "Vmess", 2.0);

        let snapshot = table.snapshot_and_clear();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["alice"].unique_ips().len(), 2);
        assert!(table.is_empty(), "table must start the next cycle empty");
    }

    #[test]
    fn snapshot_preserves_contents() {
        let table = ActiveUserTable::new();
        table.record("alice", "198.51.100.1", 1, "edge-1", "Vless", 0.0);
        let copy = table.snapshot();
        assert_eq!(copy.len(), 1);
        assert_eq!(table.len(), 1);
    }
}

//! Read-only views over an active-user snapshot, for the status surface.

use std::collections::{BTreeMap, BTreeSet};

use ipwarden_core::{UserActivity, Username};

use crate::trust::subnet_of;

/// Aggregate usage of one node across the snapshot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NodeUsage {
    pub unique_users: usize,
    pub unique_ips: usize,
    pub protocols: usize,
    pub total_connections: u64,
}

/// Per-node usage summary, keyed `name(id)`.
pub fn node_usage_summary(snapshot: &BTreeMap<Username, UserActivity>) -> BTreeMap<String, NodeUsage> {
    let mut users: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
    let mut ips: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
    let mut protocols: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
    let mut connections: BTreeMap<String, u64> = BTreeMap::new();

    for (username, user) in snapshot {
        for conn in &user.device_info.connections {
            let key = format!("{}({})", conn.node_name, conn.node_id);
            users.entry(key.clone()).or_default().insert(username);
            ips.entry(key.clone()).or_default().insert(&conn.ip);
            protocols.entry(key.clone()).or_default().insert(&conn.inbound);
            *connections.entry(key).or_default() += conn.connection_count as u64;
        }
    }

    let mut summary = BTreeMap::new();
    for (key, node_users) in users {
        summary.insert(
            key.clone(),
            NodeUsage {
                unique_users: node_users.len(),
                unique_ips: ips.get(&key).map(BTreeSet::len).unwrap_or(0),
                protocols: protocols.get(&key).map(BTreeSet::len).unwrap_or(0),
                total_connections: connections.get(&key).copied().unwrap_or(0),
            },
        );
    }
    summary
}

/// Users the device heuristics flag as multi-device:
/// `(username, unique_ips, unique_nodes, inbounds)`.
pub fn multi_device_users(
    snapshot: &BTreeMap<Username, UserActivity>,
) -> Vec<(Username, usize, usize, Vec<String>)> {
    let mut flagged: Vec<_> = snapshot
        .iter()
        .filter(|(_, user)| user.device_info.is_multi_device)
        .map(|(username, user)| {
            (
                username.clone(),
                user.device_info.unique_ips.len(),
                user.device_info.unique_nodes.len(),
                user.device_info.inbound_protocols.iter().cloned().collect(),
            )
        })
        .collect();
    flagged.sort();
    flagged
}

/// Compact display of an IP list: individual addresses while a /24 holds at
/// most two, `a.b.c.x (n)` once it holds more.
pub fn group_ips_by_subnet(ips: &[String]) -> Vec<String> {
    let mut by_subnet: BTreeMap<String, Vec<&String>> = BTreeMap::new();
    for ip in ips {
        by_subnet.entry(subnet_of(ip)).or_default().push(ip);
    }

    let mut formatted = Vec::new();
    for (subnet, members) in by_subnet {
        if members.len() <= 2 {
            formatted.extend(members.into_iter().cloned());
        } else {
            formatted.push(format!("{subnet} ({})", members.len()));
        }
    }
    formatted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> BTreeMap<Username, UserActivity> {
        let mut map = BTreeMap::new();
        let mut alice = UserActivity::new("alice");
        alice.observe("198.51.100.1", 1, "edge-1", "Vless", 0.0);
        alice.observe("198.51.100.2", 1, "edge-1", "Vless", 1.0);
        alice.observe("198.51.100.1", 2, "edge-2", "Vless", 2.0);
        map.insert("alice".to_string(), alice);

        let mut bob = UserActivity::new("bob");
        bob.observe("203.0.113.5", 1, "edge-1", "Vmess", 3.0);
        map.insert("bob".to_string(), bob);
        map
    }

    #[test]
    fn node_summary_counts_users_ips_and_protocols() {
        let summary = node_usage_summary(&snapshot());
        let edge1 = &summary["edge-1(1)"];
        assert_eq!(edge1.unique_users, 2);
        assert_eq!(edge1.unique_ips, 3);
        assert_eq!(edge1.protocols, 2);
        assert_eq!(summary["edge-2(2)"].unique_users, 1);
    }

    #[test]
    fn multi_device_flag_selects_cross_node_users() {
        let flagged = multi_device_users(&snapshot());
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].0, "alice");
        assert_eq!(flagged[0].2, 2, "alice spans two nodes");
    }

    #[test]
    fn subnet_grouping_collapses_only_above_two() {
        let ips: Vec<String> = [
            "198.51.100.1",
            "198.51.100.2",
            "203.0.113.1",
            "203.0.113.2",
            "203.0.113.3",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let formatted = group_ips_by_subnet(&ips);
        assert!(formatted.contains(&"198.51.100.1".to_string()));
        assert!(formatted.contains(&"198.51.100.2".to_string()));
        assert!(formatted.contains(&"203.0.113.x (3)".to_string()));
        assert_eq!(formatted.len(), 3);
    }
}

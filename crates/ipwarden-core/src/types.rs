use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Panel account name. Usernames are the unique key across every store.
pub type Username = String;

/// Panel-assigned node identifier.
pub type NodeId = i64;

/// Wall-clock seconds since the Unix epoch. Kept as `f64` so timestamps
/// round-trip through the JSON files unchanged.
pub type UnixSecs = f64;

// ── Node ─────────────────────────────────────────────────────────────────────

/// One edge server of the panel. The panel is the source of truth; this is
/// the cached view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub address: String,
    pub status: String,
    pub message: Option<String>,
}

impl Node {
    /// Only nodes the panel reports as `connected` get a log stream.
    pub fn is_connected(&self) -> bool {
        self.status == "connected"
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

// ── UserStatus ───────────────────────────────────────────────────────────────

/// Status value accepted by `PUT /api/user/{u}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Active,
    Disabled,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Disabled => "disabled",
        }
    }
}

// ── Connection / device tracking ─────────────────────────────────────────────

/// One observed `(ip, node, inbound)` combination for a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub ip: String,
    pub node_id: NodeId,
    pub node_name: String,
    pub inbound: String,
    pub last_seen: UnixSecs,
    pub connection_count: u32,
}

/// Aggregated device evidence for a user within one evaluator cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub connections: Vec<ConnectionInfo>,
    pub unique_ips: BTreeSet<String>,
    pub unique_nodes: BTreeSet<NodeId>,
    pub inbound_protocols: BTreeSet<String>,
    pub is_multi_device: bool,
}

impl DeviceInfo {
    /// Record one parsed log line. Merges on the key `(ip, node_id, inbound)`
    /// by bumping `connection_count` and touching `last_seen`.
    pub fn record(&mut self, ip: &str, node_id: NodeId, node_name: &str, inbound: &str, now: UnixSecs) {
        match self
            .connections
            .iter_mut()
            .find(|c| c.ip == ip && c.node_id == node_id && c.inbound == inbound)
        {
            Some(conn) => {
                conn.last_seen = now;
                conn.connection_count += 1;
            }
            None => self.connections.push(ConnectionInfo {
                ip: ip.to_string(),
                node_id,
                node_name: node_name.to_string(),
                inbound: inbound.to_string(),
                last_seen: now,
                connection_count: 1,
            }),
        }

        self.unique_ips.insert(ip.to_string());
        self.unique_nodes.insert(node_id);
        self.inbound_protocols.insert(inbound.to_string());

        self.is_multi_device = self.unique_ips.len() > 2
            || self.inbound_protocols.len() > 1
            || self.unique_nodes.len() > 1;
    }
}

/// Per-user runtime record in the active-user table.
///
/// `ips` is append-only (duplicates allowed) so the parser never needs to
/// scan; the `unique_ips` set in [`DeviceInfo`] is the deduplicated view.
#[derive(Debug, Clone)]
pub struct UserActivity {
    pub username: Username,
    pub ips: Vec<String>,
    pub device_info: DeviceInfo,
}

impl UserActivity {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            ips: Vec::new(),
            device_info: DeviceInfo::default(),
        }
    }

    pub fn observe(&mut self, ip: &str, node_id: NodeId, node_name: &str, inbound: &str, now: UnixSecs) {
        self.ips.push(ip.to_string());
        self.device_info.record(ip, node_id, node_name, inbound, now);
    }

    pub fn unique_ips(&self) -> &BTreeSet<String> {
        &self.device_info.unique_ips
    }
}

// ── Punishment ───────────────────────────────────────────────────────────────

/// Kind of one step on the escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Warning,
    Disable,
    /// Not separately implemented by the panel; applied as a permanent
    /// disable and logged with its own kind.
    Revoke,
}

/// One configured escalation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunishmentStep {
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(rename = "duration")]
    pub duration_minutes: u64,
}

impl PunishmentStep {
    pub fn is_warning(&self) -> bool {
        self.kind == StepKind::Warning
    }

    /// `disable` with duration 0 means "until manually enabled".
    pub fn is_unlimited(&self) -> bool {
        matches!(self.kind, StepKind::Disable | StepKind::Revoke) && self.duration_minutes == 0
    }

    pub fn duration_secs(&self) -> u64 {
        self.duration_minutes * 60
    }
}

impl fmt::Display for PunishmentStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StepKind::Warning => write!(f, "warning"),
            StepKind::Revoke => write!(f, "revoke (permanent disable)"),
            StepKind::Disable if self.duration_minutes == 0 => write!(f, "unlimited disable"),
            StepKind::Disable => write!(f, "{} min disable", self.duration_minutes),
        }
    }
}

/// One executed disable, kept inside the sliding punishment window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub username: Username,
    pub timestamp: UnixSecs,
    pub step_applied: usize,
    pub disable_duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_at: Option<UnixSecs>,
}

//! Warning records and the monitored-user set.
//!
//! A warning opens a 3-minute monitoring window during which per-IP activity
//! is tracked cycle by cycle. At the end of the window only *persistent
//! devices* count against the user's limit: an IP active for at least 120
//! seconds or seen in at least two cycles, and seen within the last 120
//! seconds. `warning_time` and `monitoring_end_time` are immutable after
//! creation; updates only touch activity and trust evidence.
//!
//! The whole set is snapshot to disk after every mutation so monitoring
//! survives a restart mid-window.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use ipwarden_core::{
    ConnectionInfo, DeviceInfo, UnixSecs, Username, DEVICE_RECENCY_SECS, MIN_DEVICE_DURATION_SECS,
    MONITORING_PERIOD_SECS,
};
use ipwarden_store::file;

use crate::trust::{subnets_of, TrustEvidence};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub username: Username,
    pub ip_count: usize,
    pub ips: BTreeSet<String>,
    pub warning_time: UnixSecs,
    pub monitoring_end_time: UnixSecs,
    pub ip_first_seen: BTreeMap<String, UnixSecs>,
    pub ip_last_seen: BTreeMap<String, UnixSecs>,
    pub ip_seen_count: BTreeMap<String, u32>,
    pub trust_score: f64,
    pub inbound_protocols: BTreeSet<String>,
    pub isp_names: BTreeSet<String>,
    pub ip_subnets: BTreeSet<String>,
    pub ip_to_inbounds: BTreeMap<String, BTreeSet<String>>,
    pub previous_disables_12h: u32,
    pub previous_disables_24h: u32,
    pub connection_details: Vec<ConnectionInfo>,
}

impl Warning {
    pub fn new(
        username: &str,
        ips: BTreeSet<String>,
        device_info: &DeviceInfo,
        isp_names: BTreeSet<String>,
        previous_disables_12h: u32,
        previous_disables_24h: u32,
        now: UnixSecs,
    ) -> Self {
        let ip_subnets = subnets_of(&ips);
        let mut warning = Self {
            username: username.to_string(),
            ip_count: ips.len(),
            ips,
            warning_time: now,
            monitoring_end_time: now + MONITORING_PERIOD_SECS,
            ip_first_seen: BTreeMap::new(),
            ip_last_seen: BTreeMap::new(),
            ip_seen_count: BTreeMap::new(),
            trust_score: 0.0,
            inbound_protocols: device_info.inbound_protocols.clone(),
            isp_names,
            ip_subnets,
            ip_to_inbounds: ip_to_inbounds(device_info),
            previous_disables_12h,
            previous_disables_24h,
            connection_details: device_info.connections.clone(),
        };
        warning.update_activity(now);
        warning
    }

    pub fn is_active(&self, now: UnixSecs) -> bool {
        now < self.monitoring_end_time
    }

    pub fn remaining_secs(&self, now: UnixSecs) -> u64 {
        (self.monitoring_end_time - now).max(0.0) as u64
    }

    /// Fold the current cycle's observations into the warning: IP set,
    /// per-IP activity, inbound mapping, and connection details. The window
    /// itself never moves.
    pub fn absorb_cycle(
        &mut self,
        ips: BTreeSet<String>,
        device_info: &DeviceInfo,
        isp_names: BTreeSet<String>,
        now: UnixSecs,
    ) {
        self.ip_count = ips.len();
        self.ip_subnets = subnets_of(&ips);
        self.ips = ips;
        self.inbound_protocols
            .extend(device_info.inbound_protocols.iter().cloned());
        for (ip, inbounds) in ip_to_inbounds(device_info) {
            self.ip_to_inbounds.entry(ip).or_default().extend(inbounds);
        }
        if !isp_names.is_empty() {
            self.isp_names.extend(isp_names);
        }
        self.connection_details = device_info.connections.clone();
        self.update_activity(now);
    }

    fn update_activity(&mut self, now: UnixSecs) {
        for ip in self.ips.clone() {
            self.ip_first_seen.entry(ip.clone()).or_insert(now);
            self.ip_last_seen.insert(ip.clone(), now);
            *self.ip_seen_count.entry(ip).or_insert(0) += 1;
        }
    }

    /// IPs that qualify as confirmed devices at `now`.
    pub fn persistent_devices(&self, now: UnixSecs) -> BTreeSet<String> {
        let mut devices = BTreeSet::new();
        for (ip, first_seen) in &self.ip_first_seen {
            let last_seen = self.ip_last_seen.get(ip).copied().unwrap_or(0.0);
            if now - last_seen > DEVICE_RECENCY_SECS {
                continue;
            }
            let duration = last_seen - first_seen;
            let seen_count = self.ip_seen_count.get(ip).copied().unwrap_or(0);
            if duration >= MIN_DEVICE_DURATION_SECS || seen_count >= 2 {
                devices.insert(ip.clone());
            }
        }
        devices
    }

    /// Evidence view for the trust scorer.
    pub fn evidence(&self) -> TrustEvidence {
        TrustEvidence {
            ips: self.ips.clone(),
            ip_to_inbounds: self.ip_to_inbounds.clone(),
            inbound_protocols: self.inbound_protocols.clone(),
            isp_names: self.isp_names.clone(),
            ip_subnets: self.ip_subnets.clone(),
            prior_disables_12h: self.previous_disables_12h,
            prior_disables_24h: self.previous_disables_24h,
        }
    }
}

fn ip_to_inbounds(device_info: &DeviceInfo) -> BTreeMap<String, BTreeSet<String>> {
    let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for conn in &device_info.connections {
        map.entry(conn.ip.clone()).or_default().insert(conn.inbound.clone());
    }
    map
}

/// All warnings currently open, snapshot to disk after every change.
pub struct WarningSet {
    path: PathBuf,
    warnings: Mutex<BTreeMap<Username, Warning>>,
}

impl WarningSet {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let warnings: BTreeMap<Username, Warning> = file::load_or_default(&path);
        if !warnings.is_empty() {
            info!(count = warnings.len(), "restored warning snapshot");
        }
        Self { path, warnings: Mutex::new(warnings) }
    }

    fn persist(&self, snapshot: &BTreeMap<Username, Warning>) {
        if let Err(e) = file::write_atomic(&self.path, snapshot) {
            warn!(error = %e, "failed to persist warnings");
        }
    }

    /// The warning for `username` if its window is still open.
    pub fn get_active(&self, username: &str, now: UnixSecs) -> Option<Warning> {
        self.warnings
            .lock()
            .unwrap()
            .get(username)
            .filter(|w| w.is_active(now))
            .cloned()
    }

    pub fn is_monitored(&self, username: &str, now: UnixSecs) -> bool {
        self.get_active(username, now).is_some()
    }

    pub fn put(&self, warning: Warning) {
        let snapshot = {
            let mut warnings = self.warnings.lock().unwrap();
            warnings.insert(warning.username.clone(), warning);
            warnings.clone()
        };
        self.persist(&snapshot);
    }

    pub fn remove(&self, username: &str) {
        let snapshot = {
            let mut warnings = self.warnings.lock().unwrap();
            warnings.remove(username);
            warnings.clone()
        };
        self.persist(&snapshot);
    }

    /// Warnings whose window has closed, in username order.
    pub fn expired(&self, now: UnixSecs) -> Vec<Warning> {
        self.warnings
            .lock()
            .unwrap()
            .values()
            .filter(|w| !w.is_active(now))
            .cloned()
            .collect()
    }

    /// Users currently inside an open window, in username order.
    pub fn monitored_users(&self, now: UnixSecs) -> Vec<Username> {
        self.warnings
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.is_active(now))
            .map(|w| w.username.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.warnings.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

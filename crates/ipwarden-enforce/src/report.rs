//! Per-cycle operator report.
//!
//! A human-readable summary of every user over their limit this cycle:
//! device count, IP list annotated with ISP where known, limit in force,
//! and monitoring status. The evaluator logs it once per tick; collaborators
//! (bot, REST surface) can render the same lines.
//!
//! Device counting here is coarser than the warning pipeline on purpose: a
//! *device* is a distinct `(ip, inbound)` pair, which is what an operator
//! eyeballing the report intuitively counts.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use ipwarden_core::{UnixSecs, UserActivity, Username, WardenConfig};

use crate::analyzer::group_ips_by_subnet;
use crate::isp::IspInfo;
use crate::warning::WarningSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserReportLine {
    pub username: Username,
    pub device_count: usize,
    pub ip_count: usize,
    pub formatted_ips: Vec<String>,
    pub limit: u32,
    pub has_special_limit: bool,
    pub is_whitelisted: bool,
    /// Remaining monitoring seconds when the user is mid-window.
    pub monitoring_remaining: Option<u64>,
}

/// Distinct `(ip, inbound)` pairs a user has been seen on.
pub fn device_count(user: &UserActivity) -> usize {
    let pairs: BTreeSet<(&str, &str)> = user
        .device_info
        .connections
        .iter()
        .map(|c| (c.ip.as_str(), c.inbound.as_str()))
        .collect();
    if pairs.is_empty() {
        // No connection detail recorded; each IP counts as one device.
        user.unique_ips().len()
    } else {
        pairs.len()
    }
}

/// `ip (ISP, CC)` when the lookup produced something, bare `ip` otherwise.
pub fn format_ip(ip: &str, isp_info: Option<&IspInfo>) -> String {
    match isp_info {
        Some(info) if !info.is_unknown() => {
            // Strip a leading AS number so the line stays readable.
            let isp = match info.isp.split_once(' ') {
                Some((asn, rest)) if asn.starts_with("AS") => rest,
                _ => info.isp.as_str(),
            };
            format!("{ip} ({isp}, {})", info.country)
        }
        _ => ip.to_string(),
    }
}

/// Build report lines for every user over their limit, worst first.
pub fn build_report(
    snapshot: &BTreeMap<Username, UserActivity>,
    config: &WardenConfig,
    warnings: &WarningSet,
    isp_info: &HashMap<String, IspInfo>,
    now: UnixSecs,
) -> Vec<UserReportLine> {
    let mut lines = Vec::new();
    for (username, user) in snapshot {
        let devices = device_count(user);
        let limit = config.limit_for(username);
        if devices <= limit as usize {
            continue;
        }

        let ips: Vec<String> = user.unique_ips().iter().cloned().collect();
        let formatted_ips = group_ips_by_subnet(&ips)
            .into_iter()
            .map(|entry| match isp_info.get(&entry) {
                Some(info) => format_ip(&entry, Some(info)),
                // Subnet groups like `a.b.c.x (3)` have no single lookup.
                None => entry,
            })
            .collect();

        lines.push(UserReportLine {
            username: username.clone(),
            device_count: devices,
            ip_count: user.unique_ips().len(),
            formatted_ips,
            limit,
            has_special_limit: config.limits.special.contains_key(username),
            is_whitelisted: config.except_users.contains(username),
            monitoring_remaining: warnings
                .get_active(username, now)
                .map(|w| w.remaining_secs(now)),
        });
    }

    lines.sort_by(|a, b| {
        b.device_count
            .cmp(&a.device_count)
            .then_with(|| a.username.cmp(&b.username))
    });
    lines
}

/// Render the report as one log-friendly block.
pub fn render_report(lines: &[UserReportLine]) -> String {
    let mut out = String::new();
    for line in lines {
        let marker = if line.is_whitelisted {
            "whitelisted"
        } else if line.has_special_limit {
            "special limit"
        } else {
            "general limit"
        };
        let monitoring = match line.monitoring_remaining {
            Some(secs) => format!(", monitoring {secs}s left"),
            None => String::new(),
        };
        out.push_str(&format!(
            "{}: {} device(s), {} IP(s), limit {} ({marker}){monitoring}\n  {}\n",
            line.username,
            line.device_count,
            line.ip_count,
            line.limit,
            line.formatted_ips.join(", "),
        ));
    }
    out
}

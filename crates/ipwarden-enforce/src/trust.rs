//! Trust scoring.
//!
//! A pure function from one user's connection evidence to a score in
//! `[-100, 100]`. Higher means "probably one device"; at or below the
//! configured instant-disable threshold the evaluator skips the monitoring
//! window entirely. Deterministic by construction: identical evidence always
//! scores identically, so tests can pin exact values.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use tracing::debug;

/// Everything the scorer looks at for one user.
#[derive(Debug, Clone, Default)]
pub struct TrustEvidence {
    pub ips: BTreeSet<String>,
    /// Which inbounds each IP has been seen on.
    pub ip_to_inbounds: BTreeMap<String, BTreeSet<String>>,
    pub inbound_protocols: BTreeSet<String>,
    pub isp_names: BTreeSet<String>,
    pub ip_subnets: BTreeSet<String>,
    /// Executed disables in the last 12 hours.
    pub prior_disables_12h: u32,
    /// Executed disables in the last 24 hours (superset of the 12 h count).
    pub prior_disables_24h: u32,
}

/// What the ISP spread of a user's IPs looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IspPattern {
    /// One ISP: normal usage.
    SingleIsp,
    /// Two IPs, two ISPs, each in its own subnet: one handset switching
    /// SIM cards.
    SimSwap,
    PossibleSimSwap,
    /// Spread that only multiple simultaneous devices produce.
    MultiDevice,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    Trusted,
    High,
    Medium,
    Low,
    Suspicious,
    Critical,
}

impl TrustLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 40.0 {
            TrustLevel::Trusted
        } else if score >= 20.0 {
            TrustLevel::High
        } else if score >= 0.0 {
            TrustLevel::Medium
        } else if score >= -25.0 {
            TrustLevel::Low
        } else if score >= -50.0 {
            TrustLevel::Suspicious
        } else {
            TrustLevel::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Trusted => "trusted",
            TrustLevel::High => "high",
            TrustLevel::Medium => "medium",
            TrustLevel::Low => "low",
            TrustLevel::Suspicious => "suspicious",
            TrustLevel::Critical => "critical",
        }
    }
}

/// The /24 a v4 address belongs to, rendered `a.b.c.x`. Non-v4 inputs are
/// grouped as themselves.
pub fn subnet_of(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let octets = v4.octets();
            format!("{}.{}.{}.x", octets[0], octets[1], octets[2])
        }
        _ => ip.to_string(),
    }
}

pub fn subnets_of<'a>(ips: impl IntoIterator<Item = &'a String>) -> BTreeSet<String> {
    ips.into_iter().map(|ip| subnet_of(ip)).collect()
}

/// Classify the ISP spread.
pub fn classify_isp_pattern(evidence: &TrustEvidence) -> IspPattern {
    let isp_count = evidence.isp_names.len();
    let ip_count = evidence.ips.len();
    let subnet_count = evidence.ip_subnets.len();

    if isp_count <= 1 {
        return IspPattern::SingleIsp;
    }
    if isp_count == 2 && ip_count == 2 && subnet_count == 2 {
        return IspPattern::SimSwap;
    }
    // More IPs than subnets, or several IPs across several providers at
    // once: no single handset does that.
    if ip_count > subnet_count || (isp_count >= 2 && ip_count > 2) {
        return IspPattern::MultiDevice;
    }
    if isp_count == 2 {
        return IspPattern::PossibleSimSwap;
    }
    IspPattern::Unknown
}

/// Score the evidence. Base 50, adjustments applied in a fixed order,
/// result clamped to `[-100, 100]`.
pub fn compute_score(evidence: &TrustEvidence) -> f64 {
    let mut score: f64 = 50.0;
    let ip_count = evidence.ips.len();
    let inbound_count = evidence.inbound_protocols.len();
    let subnet_count = evidence.ip_subnets.len();
    let isp_count = evidence.isp_names.len();

    // One IP hopping between inbounds is one device switching protocols.
    let same_ip_multi_inbound = evidence.ip_to_inbounds.values().any(|inbounds| inbounds.len() > 1);

    // Several IPs sharing one inbound is the classic multi-device shape.
    let mut inbound_to_ips: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (ip, inbounds) in &evidence.ip_to_inbounds {
        for inbound in inbounds {
            inbound_to_ips.entry(inbound).or_default().insert(ip);
        }
    }
    let multi_ip_same_inbound = inbound_to_ips.values().any(|ips| ips.len() > 1);

    if same_ip_multi_inbound {
        score += 20.0;
        debug!(adjust = 20, "same IP on multiple inbounds");
    }
    if multi_ip_same_inbound {
        score -= 30.0;
        debug!(adjust = -30, "multiple IPs on one inbound");
    }
    // Disjoint pairing: different IPs each on different inbounds.
    if inbound_count > 1 && ip_count > 1 && !same_ip_multi_inbound && !multi_ip_same_inbound {
        let penalty = 15.0 * inbound_count.min(ip_count) as f64;
        score -= penalty;
        debug!(adjust = -penalty, "distinct IPs on distinct inbounds");
    }

    if subnet_count > 1 && isp_count == 1 {
        let penalty = 15.0 * (subnet_count - 1) as f64;
        score -= penalty;
        debug!(adjust = -penalty, "multiple subnets within one ISP");
    }

    match classify_isp_pattern(evidence) {
        IspPattern::SimSwap | IspPattern::PossibleSimSwap => {
            score -= 8.0;
            debug!(adjust = -8, "possible SIM swap");
        }
        IspPattern::MultiDevice => {
            score -= 25.0;
            debug!(adjust = -25, "multi-device ISP spread");
        }
        IspPattern::SingleIsp | IspPattern::Unknown => {}
    }

    if evidence.prior_disables_12h > 0 {
        score -= 20.0 * evidence.prior_disables_12h as f64;
    }
    let older = evidence.prior_disables_24h.saturating_sub(evidence.prior_disables_12h);
    if older > 0 {
        score -= 10.0 * older as f64;
    }

    if ip_count > 2 {
        score -= 10.0 * (ip_count - 2) as f64;
    }

    score.clamp(-100.0, 100.0)
}

//! Access-log line parser.
//!
//! Turns one SSE `data:` payload line into at most one
//! `(username, ip, inbound)` record. Malformed lines are dropped silently;
//! the stream never stops because of a bad line.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::geo::GeoResolver;

static RE_IPV6: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([0-9a-fA-F:]+)\]:\d+\s+accepted").unwrap());
static RE_IPV4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").unwrap());
static RE_EMAIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"email:\s*([A-Za-z0-9._%+-]+)").unwrap());
static RE_INBOUND: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\s+>>\s+[^\]]+\]").unwrap());
// CDN real-IP markers: xForwardedFor / X-Forwarded-For / xff headers echoed
// into the log, and the alternative "from a.b.c.d (via ...)" form.
static RE_XFF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:xForwardedFor|X-Forwarded-For|xff):\s*(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})")
        .unwrap()
});
static RE_VIA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"from\s+(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\s+\(via").unwrap());
static RE_LEADING_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.").unwrap());

/// Residues the email regex captures from non-user log noise.
const INVALID_USERNAMES: [&str; 8] =
    ["API]", "Found", "(normal)", "timeout", "EOF", "address", "INFO", "request"];

/// IPs never attributable to a client (public resolvers, node addresses).
const DEFAULT_INVALID_IPS: [&str; 2] = ["1.1.1.1", "8.8.8.8"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    pub username: String,
    pub ip: String,
    pub inbound: String,
}

pub struct LogParser {
    cdn_inbounds: Vec<String>,
    use_xff: bool,
    /// ISO-2 code to keep; `None` disables the geo filter.
    country_filter: Option<String>,
    geo: GeoResolver,
    invalid_ips: Mutex<HashSet<String>>,
    valid_ips: Mutex<HashSet<String>>,
}

impl LogParser {
    pub fn new(
        cdn_inbounds: Vec<String>,
        use_xff: bool,
        country_filter: Option<String>,
        extra_invalid_ips: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut invalid: HashSet<String> =
            DEFAULT_INVALID_IPS.iter().map(|ip| ip.to_string()).collect();
        invalid.extend(extra_invalid_ips);
        Self {
            cdn_inbounds,
            use_xff,
            country_filter,
            geo: GeoResolver::new(),
            invalid_ips: Mutex::new(invalid),
            valid_ips: Mutex::new(HashSet::new()),
        }
    }

    /// Mark an IP as never-a-client (node addresses get added here).
    pub fn add_invalid_ip(&self, ip: &str) {
        self.invalid_ips.lock().unwrap().insert(ip.to_string());
    }

    /// Parse one log line. `None` means the line carries no client record.
    pub async fn parse_line(&self, line: &str) -> Option<ParsedRecord> {
        if !line.contains("accepted") || line.contains("BLOCK]") {
            return None;
        }

        let inbound = RE_INBOUND
            .captures(line)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let mut ip = if let Some(c) = RE_IPV6.captures(line) {
            c[1].to_string()
        } else if let Some(c) = RE_IPV4.captures(line) {
            c[1].to_string()
        } else {
            return None;
        };

        // Behind a CDN the peer IP is an edge IP; the real client is in the
        // forwarded header when the operator enabled XFF extraction.
        if self.use_xff && self.cdn_inbounds.iter().any(|i| i == &inbound) {
            if let Some(c) = RE_XFF.captures(line) {
                ip = c[1].to_string();
            } else if let Some(c) = RE_VIA.captures(line) {
                ip = c[1].to_string();
            }
        }

        if !self.admit_ip(&ip).await {
            return None;
        }

        let raw = RE_EMAIL.captures(line)?;
        let username = RE_LEADING_ID.replace(&raw[1], "").to_string();
        if username.is_empty() || INVALID_USERNAMES.contains(&username.as_str()) {
            return None;
        }

        Some(ParsedRecord { username, ip, inbound })
    }

    /// Validate an extracted IP: syntactically sound, public, not on the
    /// deny set, and (when configured) inside the operator's country.
    async fn admit_ip(&self, ip: &str) -> bool {
        if self.valid_ips.lock().unwrap().contains(ip) {
            return true;
        }
        if self.invalid_ips.lock().unwrap().contains(ip) {
            return false;
        }

        let Ok(parsed) = ip.parse::<IpAddr>() else {
            return false;
        };
        if !is_public(&parsed) {
            return false;
        }

        if let Some(wanted) = &self.country_filter {
            match self.geo.country_code(ip).await {
                Some(code) if code == *wanted => {
                    self.valid_ips.lock().unwrap().insert(ip.to_string());
                }
                Some(other) => {
                    debug!(ip = %ip, country = %other, "dropping out-of-country IP");
                    self.invalid_ips.lock().unwrap().insert(ip.to_string());
                    return false;
                }
                // Every endpoint failed: country unknown, let the line
                // through but do not cache the verdict.
                None => {}
            }
        } else {
            self.valid_ips.lock().unwrap().insert(ip.to_string());
        }
        true
    }
}

/// Routable-client check: rejects RFC1918, loopback, link-local and
/// unique-local ranges.
fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            let unique_local = (segments[0] & 0xfe00) == 0xfc00;
            let link_local = (segments[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_parser() -> LogParser {
        LogParser::new(Vec::new(), true, None, Vec::new())
    }

    fn cdn_parser() -> LogParser {
        LogParser::new(vec!["CF-WS".to_string()], true, None, Vec::new())
    }

    #[tokio::test]
    async fn accepted_v4_line_parses() {
        let line = "2024/05/01 12:00:00 198.51.100.7:52110 accepted tcp:example.com:443 \
                    [Vless-TCP >> DIRECT] email: 12.alice";
        let record = plain_parser().parse_line(line).await.unwrap();
        assert_eq!(record.username, "alice");
        assert_eq!(record.ip, "198.51.100.7");
        assert_eq!(record.inbound, "Vless-TCP");
    }

    #[tokio::test]
    async fn v6_peer_is_preferred_over_embedded_v4() {
        let line = "[2001:db8::1]:443 accepted tcp:1.2.3.4:443 [Vmess >> DIRECT] email: bob";
        let record = plain_parser().parse_line(line).await.unwrap();
        assert_eq!(record.ip, "2001:db8::1");
    }

    #[tokio::test]
    async fn blocked_and_non_accepted_lines_drop() {
        let parser = plain_parser();
        assert!(parser.parse_line("198.51.100.7:1 rejected [X >> Y] email: a").await.is_none());
        assert!(parser
            .parse_line("198.51.100.7:1 accepted [BLOCK] email: a")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn missing_inbound_defaults_to_unknown() {
        let line = "198.51.100.7:52110 accepted email: carol";
        let record = plain_parser().parse_line(line).await.unwrap();
        assert_eq!(record.inbound, "Unknown");
    }

    #[tokio::test]
    async fn private_and_denied_ips_drop() {
        let parser = plain_parser();
        assert!(parser
            .parse_line("192.168.1.10:9 accepted [A >> B] email: a")
            .await
            .is_none());
        assert!(parser
            .parse_line("1.1.1.1:9 accepted [A >> B] email: a")
            .await
            .is_none());

        parser.add_invalid_ip("198.51.100.99");
        assert!(parser
            .parse_line("198.51.100.99:9 accepted [A >> B] email: a")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn xff_replaces_edge_ip_on_cdn_inbound() {
        let line = "104.16.1.1:443 accepted tcp [CF-WS >> DIRECT] email: 1.emma \
                    xForwardedFor: 203.0.113.9";
        let record = cdn_parser().parse_line(line).await.unwrap();
        assert_eq!(record.ip, "203.0.113.9");
        assert_eq!(record.username, "emma");
    }

    #[tokio::test]
    async fn via_form_also_yields_real_ip() {
        let line = "104.16.1.1:443 accepted [CF-WS >> DIRECT] email: emma \
                    from 203.0.113.10 (via cloudflare)";
        let record = cdn_parser().parse_line(line).await.unwrap();
        assert_eq!(record.ip, "203.0.113.10");
    }

    #[tokio::test]
    async fn xff_ignored_for_non_cdn_inbound() {
        let line = "104.16.1.1:443 accepted [Direct-WS >> DIRECT] email: emma \
                    xForwardedFor: 203.0.113.9";
        let record = cdn_parser().parse_line(line).await.unwrap();
        assert_eq!(record.ip, "104.16.1.1", "XFF only applies to listed CDN inbounds");
    }

    #[tokio::test]
    async fn misparse_residues_are_rejected() {
        let parser = plain_parser();
        for noise in ["timeout", "Found", "EOF"] {
            let line = format!("198.51.100.7:1 accepted [A >> B] email: {noise}");
            assert!(parser.parse_line(&line).await.is_none(), "{noise} must be rejected");
        }
    }

    #[tokio::test]
    async fn leading_numeric_id_is_stripped() {
        let line = "198.51.100.7:1 accepted [A >> B] email: 451.frank";
        let record = plain_parser().parse_line(line).await.unwrap();
        assert_eq!(record.username, "frank");
    }

    #[test]
    fn public_ip_classification() {
        assert!(is_public(&"203.0.113.9".parse().unwrap()));
        assert!(!is_public(&"10.0.0.1".parse().unwrap()));
        assert!(!is_public(&"172.16.0.1".parse().unwrap()));
        assert!(!is_public(&"127.0.0.1".parse().unwrap()));
        assert!(!is_public(&"169.254.0.1".parse().unwrap()));
        assert!(is_public(&"2001:db8::1".parse().unwrap()));
        assert!(!is_public(&"::1".parse().unwrap()));
        assert!(!is_public(&"fe80::1".parse().unwrap()));
        assert!(!is_public(&"fd00::1".parse().unwrap()));
    }
}

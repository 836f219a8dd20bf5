//! ISP lookup for trust evidence.
//!
//! ipinfo.io when the operator configured a token, ip-api.com otherwise (or
//! when forced). Results are cached in memory for the process lifetime;
//! batch lookups run concurrently under one hard timeout so an evaluator
//! tick can never stall on a slow lookup service.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tracing::{debug, warn};

use ipwarden_core::ISP_BATCH_TIMEOUT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IspInfo {
    pub isp: String,
    pub country: String,
    pub city: String,
    pub region: String,
}

impl IspInfo {
    pub fn unknown() -> Self {
        Self {
            isp: "Unknown ISP".to_string(),
            country: "Unknown".to_string(),
            city: "Unknown".to_string(),
            region: "Unknown".to_string(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.isp == "Unknown ISP"
    }
}

pub struct IspResolver {
    http: reqwest::Client,
    token: Option<String>,
    fallback_only: bool,
    /// No network at all: serve primed/cached entries, unknown otherwise.
    offline: bool,
    cache: Mutex<HashMap<String, IspInfo>>,
    /// Set once ipinfo.io returns 429; all further lookups use the fallback.
    rate_limited: AtomicBool,
}

impl IspResolver {
    /// Without a token ipinfo.io throttles almost immediately, so tokenless
    /// configurations go straight to the fallback service.
    pub fn new(token: Option<String>, use_fallback_only: bool) -> Self {
        let fallback_only = use_fallback_only || token.is_none();
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            http,
            token,
            fallback_only,
            offline: false,
            cache: Mutex::new(HashMap::new()),
            rate_limited: AtomicBool::new(false),
        }
    }

    /// A resolver that never touches the network. Only primed entries
    /// resolve; everything else is unknown.
    pub fn offline() -> Self {
        let mut resolver = Self::new(None, true);
        resolver.offline = true;
        resolver
    }

    /// Seed the cache with a known answer.
    pub fn prime(&self, ip: &str, info: IspInfo) {
        self.cache.lock().unwrap().insert(ip.to_string(), info);
    }

    pub async fn lookup(&self, ip: &str) -> IspInfo {
        if let Some(info) = self.cache.lock().unwrap().get(ip).cloned() {
            return info;
        }
        if self.offline {
            return IspInfo::unknown();
        }

        let info = if self.fallback_only || self.rate_limited.load(Ordering::Relaxed) {
            self.lookup_fallback(ip).await
        } else {
            match self.lookup_ipinfo(ip).await {
                Some(info) => info,
                None => self.lookup_fallback(ip).await,
            }
        };

        if !info.is_unknown() {
            self.cache.lock().unwrap().insert(ip.to_string(), info.clone());
        }
        info
    }

    async fn lookup_ipinfo(&self, ip: &str) -> Option<IspInfo> {
        let url = format!("https://ipinfo.io/{ip}/json");
        let mut req = self.http.get(&url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(ip = %ip, error = %e, "ipinfo lookup failed");
                return None;
            }
        };
        if resp.status().as_u16() == 429 {
            warn!("ipinfo.io rate limited, switching to fallback service");
            self.rate_limited.store(true, Ordering::Relaxed);
            return None;
        }
        if !resp.status().is_success() {
            return None;
        }
        let data: Value = resp.json().await.ok()?;
        let isp = data
            .get("as_domain")
            .or_else(|| data.get("as_name"))
            .or_else(|| data.get("org"))
            .and_then(Value::as_str)?
            .to_string();
        Some(IspInfo {
            isp,
            country: field(&data, "country"),
            city: field(&data, "city"),
            region: field(&data, "region"),
        })
    }

    async fn lookup_fallback(&self, ip: &str) -> IspInfo {
        let url = format!(
            "http://ip-api.com/json/{ip}?fields=status,country,countryCode,regionName,city,isp,org,asname"
        );
        let resp = match self.http.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(ip = %ip, error = %e, "fallback ISP lookup failed");
                return IspInfo::unknown();
            }
        };
        let Ok(data) = resp.json::<Value>().await else {
            return IspInfo::unknown();
        };
        if data.get("status").and_then(Value::as_str) != Some("success") {
            return IspInfo::unknown();
        }
        let isp = data
            .get("asname")
            .or_else(|| data.get("isp"))
            .or_else(|| data.get("org"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown ISP")
            .to_string();
        IspInfo {
            isp,
            country: field(&data, "countryCode"),
            city: field(&data, "city"),
            region: field(&data, "regionName"),
        }
    }

    /// Look up a whole batch concurrently, with a hard total deadline.
    /// Unresolved IPs come back as unknown.
    pub async fn lookup_many(&self, ips: &BTreeSet<String>) -> HashMap<String, IspInfo> {
        let mut results: HashMap<String, IspInfo> = HashMap::new();
        let mut pending = Vec::new();
        {
            let cache = self.cache.lock().unwrap();
            for ip in ips {
                match cache.get(ip) {
                    Some(info) => {
                        results.insert(ip.clone(), info.clone());
                    }
                    None => pending.push(ip.clone()),
                }
            }
        }
        if pending.is_empty() {
            return results;
        }

        let lookups = pending.iter().map(|ip| self.lookup(ip));
        match tokio::time::timeout(ISP_BATCH_TIMEOUT, futures::future::join_all(lookups)).await {
            Ok(infos) => {
                for (ip, info) in pending.into_iter().zip(infos) {
                    results.insert(ip, info);
                }
            }
            Err(_) => {
                warn!(count = pending.len(), "ISP batch lookup timed out");
                for ip in pending {
                    results.entry(ip).or_insert_with(IspInfo::unknown);
                }
            }
        }
        results
    }

    /// ISP names for the given IPs, for trust evidence. Unknown results are
    /// skipped so a dead lookup service cannot fake a multi-ISP pattern.
    pub fn known_isp_names(results: &HashMap<String, IspInfo>, ips: &BTreeSet<String>) -> BTreeSet<String> {
        ips.iter()
            .filter_map(|ip| results.get(ip))
            .filter(|info| !info.is_unknown())
            .map(|info| info.isp.clone())
            .collect()
    }
}

fn field(data: &Value, key: &str) -> String {
    data.get(key).and_then(Value::as_str).unwrap_or("Unknown").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_isp_names_are_filtered_from_evidence() {
        let mut results = HashMap::new();
        results.insert("1.1.1.2".to_string(), IspInfo { isp: "CarrierA".into(), ..IspInfo::unknown() });
        results.insert("2.2.2.2".to_string(), IspInfo::unknown());
        let ips: BTreeSet<String> = ["1.1.1.2".to_string(), "2.2.2.2".to_string()].into();
        let names = IspResolver::known_isp_names(&results, &ips);
        assert_eq!(names.len(), 1);
        assert!(names.contains("CarrierA"));
    }

    #[test]
    fn tokenless_resolver_goes_fallback_only() {
        let resolver = IspResolver::new(None, false);
        assert!(resolver.fallback_only);
        let resolver = IspResolver::new(Some("tok".into()), false);
        assert!(!resolver.fallback_only);
    }
}

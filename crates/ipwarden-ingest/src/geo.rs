//! Country-code resolution over a ladder of free lookup services.
//!
//! Endpoints are tried in an order that adapts to how they have been
//! behaving: fewest accumulated failures first, most recent success as the
//! tie-break. Rate-limit responses are penalized harder than plain errors
//! so a throttled service drops to the back of the line quickly.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use ipwarden_core::{unix_now, GEO_ENDPOINT_TIMEOUT};

struct GeoEndpoint {
    name: &'static str,
    /// `{ip}` is substituted.
    url: &'static str,
    /// JSON key carrying the country code; `None` means the body is the
    /// bare code.
    json_key: Option<&'static str>,
}

const ENDPOINTS: [GeoEndpoint; 4] = [
    GeoEndpoint {
        name: "ip-api.com",
        url: "http://ip-api.com/json/{ip}?fields=countryCode",
        json_key: Some("countryCode"),
    },
    GeoEndpoint {
        name: "ipinfo.io",
        url: "https://ipinfo.io/{ip}/json",
        json_key: Some("country"),
    },
    GeoEndpoint {
        name: "iplocation.net",
        url: "https://api.iplocation.net/?ip={ip}",
        json_key: Some("country_code2"),
    },
    GeoEndpoint {
        name: "ipapi.co",
        url: "https://ipapi.co/{ip}/country",
        json_key: None,
    },
];

#[derive(Default, Clone, Copy)]
struct EndpointStats {
    failures: i32,
    last_success: f64,
}

pub struct GeoResolver {
    http: reqwest::Client,
    stats: Mutex<HashMap<&'static str, EndpointStats>>,
    cache: Mutex<HashMap<String, String>>,
}

impl Default for GeoResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl GeoResolver {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(GEO_ENDPOINT_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { http, stats: Mutex::new(HashMap::new()), cache: Mutex::new(HashMap::new()) }
    }

    fn ordered_endpoints(&self) -> Vec<&'static GeoEndpoint> {
        let stats = self.stats.lock().unwrap();
        let mut order: Vec<&GeoEndpoint> = ENDPOINTS.iter().collect();
        order.sort_by(|a, b| {
            let sa = stats.get(a.name).copied().unwrap_or_default();
            let sb = stats.get(b.name).copied().unwrap_or_default();
            sa.failures
                .cmp(&sb.failures)
                .then(sb.last_success.partial_cmp(&sa.last_success).unwrap_or(std::cmp::Ordering::Equal))
        });
        order
    }

    fn penalize(&self, name: &'static str, amount: i32) {
        let mut stats = self.stats.lock().unwrap();
        stats.entry(name).or_default().failures += amount;
    }

    fn reward(&self, name: &'static str) {
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(name).or_default();
        entry.failures = (entry.failures - 1).max(0);
        entry.last_success = unix_now();
    }

    /// ISO-2 country code of `ip`, or `None` when every endpoint failed.
    pub async fn country_code(&self, ip: &str) -> Option<String> {
        if let Some(code) = self.cache.lock().unwrap().get(ip).cloned() {
            return Some(code);
        }

        for endpoint in self.ordered_endpoints() {
            let url = endpoint.url.replace("{ip}", ip);
            let resp = match self.http.get(&url).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    self.penalize(endpoint.name, if e.is_timeout() { 2 } else { 1 });
                    continue;
                }
            };

            match resp.status().as_u16() {
                200 => {}
                429 => {
                    self.penalize(endpoint.name, 3);
                    continue;
                }
                _ => {
                    self.penalize(endpoint.name, 1);
                    continue;
                }
            }

            let country = match endpoint.json_key {
                Some(key) => resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get(key).and_then(|c| c.as_str().map(str::to_string))),
                None => resp.text().await.ok().map(|t| t.trim().to_string()),
            };

            match country {
                Some(code) if code.len() == 2 => {
                    self.reward(endpoint.name);
                    self.cache.lock().unwrap().insert(ip.to_string(), code.clone());
                    debug!(ip = %ip, country = %code, endpoint = endpoint.name, "resolved country");
                    return Some(code);
                }
                _ => self.penalize(endpoint.name, 1),
            }
        }

        None
    }

    #[cfg(test)]
    fn endpoint_order_names(&self) -> Vec<&'static str> {
        self.ordered_endpoints().iter().map(|e| e.name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_endpoints_sink_in_the_order() {
        let resolver = GeoResolver::new();
        assert_eq!(resolver.endpoint_order_names()[0], "ip-api.com");

        // Rate-limit the default first choice three times over.
        resolver.penalize("ip-api.com", 3);
        let order = resolver.endpoint_order_names();
        assert_ne!(order[0], "ip-api.com");
        assert_eq!(*order.last().unwrap(), "ip-api.com");
    }

    #[test]
    fn success_recovers_standing() {
        let resolver = GeoResolver::new();
        resolver.penalize("ip-api.com", 1);
        resolver.reward("ip-api.com");
        // Back to zero failures with the freshest success: first again.
        assert_eq!(resolver.endpoint_order_names()[0], "ip-api.com");
    }
}

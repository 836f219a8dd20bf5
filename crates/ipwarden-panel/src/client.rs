//! HTTP client for the panel API.
//!
//! All mutations the limiter ever performs go through this client: token
//! acquisition, node/user enumeration, and user status / group changes.
//! Panels routinely run self-signed TLS and sometimes plain HTTP, so every
//! request tries `https` first and falls back to `http`, and certificate
//! validation is disabled.
//!
//! Retry policy: up to [`MAX_PANEL_ATTEMPTS`] outer attempts per operation
//! with a randomized backoff of `min(30, rand(2..=5) * attempt)` seconds.
//! A 401 invalidates the token cache; the next attempt authenticates fresh.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use ipwarden_core::{
    unix_now, Node, UserStatus, Username, WardenError, MAX_EXISTS_ATTEMPTS, MAX_PANEL_ATTEMPTS,
    NODES_CACHE_SECS, PANEL_TIMEOUT_LONG, PANEL_TIMEOUT_SHORT, TOKEN_CACHE_SECS, USER_PAGE_LIMIT,
};

use crate::decode;

#[derive(Debug, Clone)]
pub struct PanelCredentials {
    pub username: String,
    pub password: String,
    /// Host (and optional port), no scheme.
    pub domain: String,
}

struct CachedToken {
    token: String,
    expires_at: f64,
}

struct CachedNodes {
    nodes: Vec<Node>,
    expires_at: f64,
}

/// Shared panel client. Construct once and pass around in an `Arc`; the
/// token and node caches inside are the process-wide caches.
pub struct PanelClient {
    http: reqwest::Client,
    creds: PanelCredentials,
    token: Mutex<Option<CachedToken>>,
    nodes: Mutex<Option<CachedNodes>>,
}

fn backoff(attempt: u32) -> Duration {
    let factor: u64 = rand::thread_rng().gen_range(2..=5);
    Duration::from_secs(u64::min(30, factor * attempt as u64))
}

impl PanelClient {
    pub fn new(creds: PanelCredentials) -> Self {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { http, creds, token: Mutex::new(None), nodes: Mutex::new(None) }
    }

    pub fn domain(&self) -> &str {
        &self.creds.domain
    }

    // ── Token cache ──────────────────────────────────────────────────────────

    fn cached_token(&self) -> Option<String> {
        let guard = self.token.lock().unwrap();
        guard
            .as_ref()
            .filter(|c| c.expires_at > unix_now())
            .map(|c| c.token.clone())
    }

    /// Drop the cached token. Called on any 401.
    pub fn invalidate_token(&self) {
        *self.token.lock().unwrap() = None;
        info!("panel token cache invalidated");
    }

    /// Get an admin token, from cache unless `force` or expired.
    pub async fn acquire_token(&self, force: bool) -> Result<String, WardenError> {
        if !force {
            if let Some(token) = self.cached_token() {
                return Ok(token);
            }
        }

        let form = [
            ("username", self.creds.username.as_str()),
            ("password", self.creds.password.as_str()),
        ];

        for attempt in 1..=MAX_PANEL_ATTEMPTS {
            for scheme in ["https", "http"] {
                let url = format!("{scheme}://{}/api/admin/token", self.creds.domain);
                let result = self
                    .http
                    .post(&url)
                    .form(&form)
                    .timeout(PANEL_TIMEOUT_SHORT)
                    .send()
                    .await;

                let resp = match result {
                    Ok(resp) => resp,
                    Err(e) => {
                        // TLS failures on https fall through to the http try.
                        debug!(url = %url, error = %e, "token request transport error");
                        continue;
                    }
                };

                if !resp.status().is_success() {
                    warn!(status = %resp.status(), "token request rejected");
                    continue;
                }

                let body: Value = match resp.json().await {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, "token response was not JSON");
                        continue;
                    }
                };

                let Some(token) = body.get("access_token").and_then(Value::as_str) else {
                    warn!("token response missing access_token");
                    continue;
                };

                *self.token.lock().unwrap() = Some(CachedToken {
                    token: token.to_string(),
                    expires_at: unix_now() + TOKEN_CACHE_SECS,
                });
                info!("fetched new panel token");
                return Ok(token.to_string());
            }
            if attempt < MAX_PANEL_ATTEMPTS {
                sleep(backoff(attempt)).await;
            }
        }

        Err(WardenError::Auth { attempts: MAX_PANEL_ATTEMPTS })
    }

    // ── Request plumbing ─────────────────────────────────────────────────────

    /// One authenticated try of `path` across both schemes.
    ///
    /// `Ok(Some(resp))` carries whatever HTTP response arrived (any status);
    /// `Ok(None)` means both schemes failed at the transport level. A 401 is
    /// handled here (token cache invalidated) but still returned so callers
    /// can retry with a fresh token.
    async fn authed_attempt(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
        force_token: bool,
    ) -> Result<Option<reqwest::Response>, WardenError> {
        let token = self.acquire_token(force_token).await?;

        for scheme in ["https", "http"] {
            let url = format!("{scheme}://{}{path}", self.creds.domain);
            let mut req = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&token)
                .timeout(timeout);
            if let Some(body) = body {
                req = req.json(body);
            }
            match req.send().await {
                Ok(resp) => {
                    if resp.status() == StatusCode::UNAUTHORIZED {
                        self.invalidate_token();
                    }
                    return Ok(Some(resp));
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "panel request transport error");
                }
            }
        }
        Ok(None)
    }

    // ── Nodes ────────────────────────────────────────────────────────────────

    fn cached_nodes(&self) -> Option<Vec<Node>> {
        let guard = self.nodes.lock().unwrap();
        guard
            .as_ref()
            .filter(|c| c.expires_at > unix_now())
            .map(|c| c.nodes.clone())
    }

    pub fn invalidate_nodes(&self) {
        *self.nodes.lock().unwrap() = None;
    }

    /// List all nodes, cached for an hour unless `force`.
    pub async fn list_nodes(&self, force: bool) -> Result<Vec<Node>, WardenError> {
        if !force {
            if let Some(nodes) = self.cached_nodes() {
                return Ok(nodes);
            }
        }

        for attempt in 1..=MAX_PANEL_ATTEMPTS {
            let resp = self
                .authed_attempt(Method::GET, "/api/nodes", None, PANEL_TIMEOUT_LONG, attempt > 1)
                .await?;
            if let Some(resp) = resp {
                let status = resp.status();
                if status.is_success() {
                    match resp.json::<Value>().await {
                        Ok(value) => {
                            if let Some(nodes) = decode::nodes_from_response(&value) {
                                *self.nodes.lock().unwrap() = Some(CachedNodes {
                                    nodes: nodes.clone(),
                                    expires_at: unix_now() + NODES_CACHE_SECS,
                                });
                                info!(count = nodes.len(), "refreshed node list");
                                return Ok(nodes);
                            }
                            warn!("unrecognized /api/nodes response shape");
                        }
                        Err(e) => warn!(error = %e, "nodes response was not JSON"),
                    }
                } else {
                    warn!(status = %status, "nodes request rejected");
                }
            }
            if attempt < MAX_PANEL_ATTEMPTS {
                sleep(backoff(attempt)).await;
            }
        }

        Err(WardenError::PanelUnavailable("listing nodes".into()))
    }

    // ── Users ────────────────────────────────────────────────────────────────

    /// Enumerate every username on the panel, paginated.
    pub async fn list_users(&self) -> Result<Vec<Username>, WardenError> {
        for attempt in 1..=MAX_PANEL_ATTEMPTS {
            match self.list_users_once(attempt > 1).await? {
                Some(users) => {
                    info!(count = users.len(), "enumerated panel users");
                    return Ok(users);
                }
                None => {
                    if attempt < MAX_PANEL_ATTEMPTS {
                        sleep(backoff(attempt)).await;
                    }
                }
            }
        }
        Err(WardenError::PanelUnavailable("enumerating users".into()))
    }

    /// One full pagination pass; `None` when any page failed.
    async fn list_users_once(&self, force_token: bool) -> Result<Option<Vec<Username>>, WardenError> {
        let mut all = Vec::new();
        let mut offset = 0usize;
        loop {
            let path = format!("/api/users?offset={offset}&limit={USER_PAGE_LIMIT}");
            let resp = self
                .authed_attempt(Method::GET, &path, None, PANEL_TIMEOUT_LONG, force_token)
                .await?;
            let Some(resp) = resp else { return Ok(None) };
            if !resp.status().is_success() {
                warn!(status = %resp.status(), offset, "users page rejected");
                return Ok(None);
            }
            let value: Value = match resp.json().await {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, offset, "users page was not JSON");
                    return Ok(None);
                }
            };
            let Some((page, total)) = decode::users_page_from_response(&value) else {
                warn!(offset, "unrecognized /api/users response shape");
                return Ok(None);
            };

            let page_len = page.len();
            all.extend(page);
            if page_len < USER_PAGE_LIMIT || offset + page_len >= total {
                return Ok(Some(all));
            }
            offset += USER_PAGE_LIMIT;
        }
    }

    /// Full user object for `username`; `UserNotFound` on 404.
    pub async fn get_user_details(&self, username: &str) -> Result<Value, WardenError> {
        let path = format!("/api/user/{username}");
        for attempt in 1..=MAX_PANEL_ATTEMPTS {
            let resp = self
                .authed_attempt(Method::GET, &path, None, PANEL_TIMEOUT_LONG, attempt > 1)
                .await?;
            if let Some(resp) = resp {
                let status = resp.status();
                if status == StatusCode::NOT_FOUND {
                    return Err(WardenError::UserNotFound(username.to_string()));
                }
                if status.is_success() {
                    match resp.json::<Value>().await {
                        Ok(value) => return Ok(value),
                        Err(e) => warn!(error = %e, user = %username, "user details not JSON"),
                    }
                } else {
                    warn!(status = %status, user = %username, "user details rejected");
                }
            }
            if attempt < MAX_PANEL_ATTEMPTS {
                sleep(backoff(attempt)).await;
            }
        }
        Err(WardenError::PanelUnavailable(format!("fetching user {username}")))
    }

    /// `group_ids` of one user.
    pub async fn get_user_groups(&self, username: &str) -> Result<Vec<i64>, WardenError> {
        let details = self.get_user_details(username).await?;
        let groups = details
            .get("group_ids")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();
        Ok(groups)
    }

    /// Existence probe. Fails open: after all attempts the user is assumed
    /// to exist so a flaky panel never silently skips a real user.
    pub async fn check_user_exists(&self, username: &str) -> Result<bool, WardenError> {
        let path = format!("/api/user/{username}");
        for attempt in 1..=MAX_EXISTS_ATTEMPTS {
            let resp = self
                .authed_attempt(Method::GET, &path, None, PANEL_TIMEOUT_LONG, attempt > 1)
                .await?;
            if let Some(resp) = resp {
                match resp.status() {
                    StatusCode::OK => return Ok(true),
                    StatusCode::NOT_FOUND => return Ok(false),
                    status => warn!(status = %status, user = %username, "existence probe rejected"),
                }
            }
            if attempt < MAX_EXISTS_ATTEMPTS {
                sleep(backoff(attempt)).await;
            }
        }
        warn!(user = %username, "could not verify user existence, assuming exists");
        Ok(true)
    }

    // ── Mutations ────────────────────────────────────────────────────────────

    pub async fn update_user_status(&self, username: &str, status: UserStatus) -> Result<(), WardenError> {
        let body = serde_json::json!({ "status": status.as_str() });
        self.put_user(username, &body, "status update").await
    }

    pub async fn update_user_groups(&self, username: &str, group_ids: &[i64]) -> Result<(), WardenError> {
        let body = serde_json::json!({ "group_ids": group_ids });
        self.put_user(username, &body, "group update").await
    }

    async fn put_user(&self, username: &str, body: &Value, what: &str) -> Result<(), WardenError> {
        let path = format!("/api/user/{username}");
        for attempt in 1..=MAX_PANEL_ATTEMPTS {
            let resp = self
                .authed_attempt(Method::PUT, &path, Some(body), PANEL_TIMEOUT_SHORT, attempt > 1)
                .await?;
            if let Some(resp) = resp {
                let status = resp.status();
                if status == StatusCode::NOT_FOUND {
                    return Err(WardenError::UserNotFound(username.to_string()));
                }
                if status.is_success() {
                    debug!(user = %username, what, "panel mutation applied");
                    return Ok(());
                }
                warn!(status = %status, user = %username, what, "panel mutation rejected");
            }
            if attempt < MAX_PANEL_ATTEMPTS {
                sleep(backoff(attempt)).await;
            }
        }
        Err(WardenError::PanelUnavailable(format!("{what} for {username}")))
    }

    // ── Log streams ──────────────────────────────────────────────────────────

    /// Open the SSE log stream of one node.
    ///
    /// No read timeout is applied: the stream is long-lived by design and
    /// the caller's periodic refresh bounds connection age. The response is
    /// returned unconsumed so the caller owns the byte stream.
    pub async fn open_log_stream(
        &self,
        node_id: ipwarden_core::NodeId,
        scheme: &str,
    ) -> Result<reqwest::Response, WardenError> {
        let token = self.acquire_token(false).await?;
        let url = format!("{scheme}://{}/api/node/{node_id}/logs", self.creds.domain);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .send()
            .await
            .map_err(|e| WardenError::PanelUnavailable(format!("log stream for node {node_id}: {e}")))?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            self.invalidate_token();
        }
        if !resp.status().is_success() {
            return Err(WardenError::PanelUnavailable(format!(
                "log stream for node {node_id}: HTTP {}",
                resp.status()
            )));
        }
        Ok(resp)
    }

    // ── Groups ───────────────────────────────────────────────────────────────

    pub async fn get_groups(&self) -> Result<Vec<Value>, WardenError> {
        for attempt in 1..=MAX_PANEL_ATTEMPTS {
            let resp = self
                .authed_attempt(Method::GET, "/api/groups", None, PANEL_TIMEOUT_LONG, attempt > 1)
                .await?;
            if let Some(resp) = resp {
                if resp.status().is_success() {
                    match resp.json::<Value>().await {
                        Ok(value) => {
                            if let Some(groups) = decode::groups_from_response(&value) {
                                return Ok(groups);
                            }
                            warn!("unrecognized /api/groups response shape");
                        }
                        Err(e) => warn!(error = %e, "groups response was not JSON"),
                    }
                } else {
                    warn!(status = %resp.status(), "groups request rejected");
                }
            }
            if attempt < MAX_PANEL_ATTEMPTS {
                sleep(backoff(attempt)).await;
            }
        }
        Err(WardenError::PanelUnavailable("listing groups".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_documented_bounds() {
        for attempt in 1..=10u32 {
            for _ in 0..50 {
                let delay = backoff(attempt).as_secs();
                assert!(delay >= u64::min(30, 2 * attempt as u64));
                assert!(delay <= 30, "backoff must cap at 30s, got {delay}");
            }
        }
    }
}

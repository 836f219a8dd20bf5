//! Durable set of currently-disabled users.
//!
//! On-disk shape:
//! ```json
//! {
//!   "disabled_users": { "<user>": <disabled_at_secs>, ... },
//!   "enable_at":      { "<user>": <enable_at_secs | -1>, ... }
//! }
//! ```
//! `enable_at = -1` means permanently disabled; an absent entry means the
//! default `time_to_active_users` delay applies. The pre-0.4 shape
//! `{"disable_user": ["<user>", ...]}` is accepted and upgraded in place on
//! first load.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use ipwarden_core::{unix_now, UnixSecs, Username, PERMANENT_SENTINEL};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DiskState {
    #[serde(default)]
    disabled_users: BTreeMap<Username, UnixSecs>,
    #[serde(default)]
    enable_at: BTreeMap<Username, UnixSecs>,
}

pub struct DisabledUserStore {
    path: PathBuf,
    state: Mutex<DiskState>,
}

impl DisabledUserStore {
    /// Open the store at `path`, migrating the legacy list shape if found.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = Self::load(&path);
        Self { path, state: Mutex::new(state) }
    }

    fn load(path: &PathBuf) -> DiskState {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return DiskState::default(),
        };
        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable disabled-user file, starting empty");
                return DiskState::default();
            }
        };

        // Legacy shape: a bare list (or an already-keyed map) under
        // "disable_user". Lists carry no timestamps; stamp them now so the
        // default re-enable delay starts counting from migration.
        if let Some(legacy) = value.get("disable_user") {
            let now = unix_now();
            let mut state = DiskState::default();
            match legacy {
                serde_json::Value::Array(users) => {
                    for user in users {
                        if let Some(name) = user.as_str() {
                            state.disabled_users.insert(name.to_string(), now);
                        }
                    }
                }
                serde_json::Value::Object(map) => {
                    for (name, stamp) in map {
                        state
                            .disabled_users
                            .insert(name.clone(), stamp.as_f64().unwrap_or(now));
                    }
                }
                _ => {}
            }
            info!(
                path = %path.display(),
                users = state.disabled_users.len(),
                "migrated legacy disabled-user file"
            );
            if let Err(e) = crate::file::write_atomic(path, &state) {
                warn!(error = %e, "failed to rewrite migrated disabled-user file");
            }
            return state;
        }

        serde_json::from_value(value).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "malformed disabled-user file, starting empty");
            DiskState::default()
        })
    }

    fn persist(&self, state: &DiskState) {
        if let Err(e) = crate::file::write_atomic(&self.path, state) {
            warn!(error = %e, "failed to persist disabled users");
        }
    }

    /// Mark `username` disabled at `now`.
    ///
    /// `duration_seconds = 0` and `permanent = false` means "use the default
    /// delay at re-enable time" (no `enable_at` entry is written).
    pub fn add(&self, username: &str, duration_seconds: u64, permanent: bool, now: UnixSecs) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            state.disabled_users.insert(username.to_string(), now);
            if permanent {
                state.enable_at.insert(username.to_string(), PERMANENT_SENTINEL);
            } else if duration_seconds > 0 {
                state
                    .enable_at
                    .insert(username.to_string(), now + duration_seconds as f64);
            } else {
                state.enable_at.remove(username);
            }
            state.clone()
        };
        self.persist(&snapshot);
    }

    /// Idempotent removal.
    pub fn remove(&self, username: &str) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            state.disabled_users.remove(username);
            state.enable_at.remove(username);
            state.clone()
        };
        self.persist(&snapshot);
    }

    pub fn contains(&self, username: &str) -> bool {
        self.state.lock().unwrap().disabled_users.contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().disabled_users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn usernames(&self) -> Vec<Username> {
        self.state.lock().unwrap().disabled_users.keys().cloned().collect()
    }

    /// `(disabled_at, enable_at)` for one user.
    pub fn entry(&self, username: &str) -> Option<(UnixSecs, Option<UnixSecs>)> {
        let state = self.state.lock().unwrap();
        let disabled_at = *state.disabled_users.get(username)?;
        Some((disabled_at, state.enable_at.get(username).copied()))
    }

    /// Users whose disable window has expired at `now`.
    pub fn due_for_enable(&self, default_seconds: u64, now: UnixSecs) -> Vec<Username> {
        let state = self.state.lock().unwrap();
        let mut due = Vec::new();
        for (username, disabled_at) in &state.disabled_users {
            match state.enable_at.get(username) {
                Some(enable_at) if *enable_at == PERMANENT_SENTINEL => continue,
                Some(enable_at) => {
                    if now >= *enable_at {
                        due.push(username.clone());
                    }
                }
                None => {
                    if now - disabled_at >= default_seconds as f64 {
                        due.push(username.clone());
                    }
                }
            }
        }
        due
    }

    /// Remaining disable time in whole seconds.
    ///
    /// Returns `-1` when the user is not disabled, `-2` for a permanent
    /// disable, otherwise a non-negative count.
    pub fn remaining_seconds(&self, username: &str, default_seconds: u64, now: UnixSecs) -> i64 {
        let state = self.state.lock().unwrap();
        let Some(disabled_at) = state.disabled_users.get(username) else {
            return -1;
        };
        let remaining = match state.enable_at.get(username) {
            Some(enable_at) if *enable_at == PERMANENT_SENTINEL => return -2,
            Some(enable_at) => enable_at - now,
            None => default_seconds as f64 - (now - disabled_at),
        };
        remaining.max(0.0) as i64
    }

    /// Drop every entry, returning the usernames that were disabled.
    pub fn clear_all(&self) -> Vec<Username> {
        let (users, snapshot) = {
            let mut state = self.state.lock().unwrap();
            let users: Vec<Username> = state.disabled_users.keys().cloned().collect();
            state.disabled_users.clear();
            state.enable_at.clear();
            (users, state.clone())
        };
        self.persist(&snapshot);
        users
    }
}

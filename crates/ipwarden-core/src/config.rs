//! Operator configuration.
//!
//! One JSON file, rewritten in full by the admin surface. Every field has a
//! default so a minimal config containing only panel credentials is valid.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::WardenError;
use crate::types::{PunishmentStep, StepKind, Username};

/// How a violating user is taken off the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisableMethod {
    #[default]
    Status,
    Group,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub username: String,
    pub password: String,
    /// Host (and optional port) without scheme; the client probes
    /// `https` first and falls back to `http`.
    pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Default simultaneous-IP allowance.
    pub general: u32,
    /// Per-user overrides.
    pub special: BTreeMap<Username, u32>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { general: 2, special: BTreeMap::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Evaluator period in seconds; clamped to at least 30.
    pub check_interval: u64,
    /// Default re-enable delay in seconds; clamped to at least 60.
    pub time_to_active_users: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self { check_interval: 60, time_to_active_users: 1800 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// ISO-2 country code; `None` disables the geo filter.
    pub country_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PunishmentConfig {
    pub enabled: bool,
    /// Sliding window over which violations count toward escalation.
    pub window_hours: u64,
    pub steps: Vec<PunishmentStep>,
    /// Trust score at or below which the monitoring window is skipped.
    pub instant_disable_threshold: f64,
}

impl PunishmentConfig {
    pub fn default_steps() -> Vec<PunishmentStep> {
        vec![
            PunishmentStep { kind: StepKind::Warning, duration_minutes: 0 },
            PunishmentStep { kind: StepKind::Disable, duration_minutes: 10 },
            PunishmentStep { kind: StepKind::Disable, duration_minutes: 30 },
            PunishmentStep { kind: StepKind::Disable, duration_minutes: 60 },
            PunishmentStep { kind: StepKind::Disable, duration_minutes: 0 },
        ]
    }
}

impl Default for PunishmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_hours: 168,
            steps: Self::default_steps(),
            instant_disable_threshold: -60.0,
        }
    }
}

/// Optional scoping of enforcement to a subset of the panel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// When set, only users belonging to one of these groups are limited.
    pub monitored_group_ids: Option<Vec<i64>>,
    /// When set, only users owned by one of these admins are limited.
    pub monitored_admins: Option<Vec<String>>,
}

impl FilterConfig {
    pub fn is_active(&self) -> bool {
        self.monitored_group_ids.is_some() || self.monitored_admins.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// ipinfo.io token; without one the resolver uses the free fallback.
    pub ipinfo_token: Option<String>,
    /// Force ip-api.com even when a token is present.
    pub use_fallback_isp_api: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub panel: PanelConfig,
    pub limits: LimitsConfig,
    /// Whitelisted users, never evaluated.
    pub except_users: BTreeSet<Username>,
    pub timing: TimingConfig,
    pub settings: SettingsConfig,
    /// Inbound names that sit behind a CDN; their peer IPs are edge IPs.
    pub cdn_inbounds: Vec<String>,
    /// Extract the real client IP from X-Forwarded-For on CDN inbounds.
    #[serde(default = "default_true")]
    pub cdn_use_xff: bool,
    pub disable_method: DisableMethod,
    /// Required when `disable_method` is `group`.
    pub disabled_group_id: Option<i64>,
    pub punishment: PunishmentConfig,
    pub filters: FilterConfig,
    pub api: ApiConfig,
    /// Extra IPs to ignore in parsed logs (node addresses are added
    /// automatically).
    pub invalid_ips: BTreeSet<String>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            panel: PanelConfig::default(),
            limits: LimitsConfig::default(),
            except_users: BTreeSet::new(),
            timing: TimingConfig::default(),
            settings: SettingsConfig::default(),
            cdn_inbounds: Vec::new(),
            cdn_use_xff: true,
            disable_method: DisableMethod::default(),
            disabled_group_id: None,
            punishment: PunishmentConfig::default(),
            filters: FilterConfig::default(),
            api: ApiConfig::default(),
            invalid_ips: BTreeSet::new(),
        }
    }
}

impl WardenConfig {
    pub fn load(path: &Path) -> Result<Self, WardenError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| WardenError::Storage(format!("reading {}: {e}", path.display())))?;
        let config: WardenConfig = serde_json::from_str(&text)
            .map_err(|e| WardenError::Parse(format!("config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), WardenError> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| WardenError::Storage(e.to_string()))?;
        std::fs::write(path, text)
            .map_err(|e| WardenError::Storage(format!("writing {}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<(), WardenError> {
        if self.panel.username.is_empty() || self.panel.password.is_empty() {
            return Err(WardenError::Parse("panel credentials are not set".into()));
        }
        if self.panel.domain.is_empty() {
            return Err(WardenError::Parse("panel.domain is not set".into()));
        }
        if self.limits.general < 1 {
            return Err(WardenError::Parse("limits.general must be >= 1".into()));
        }
        if let Some(limit) = self.limits.special.values().find(|l| **l < 1) {
            return Err(WardenError::Parse(format!("special limit must be >= 1, got {limit}")));
        }
        if self.disable_method == DisableMethod::Group && self.disabled_group_id.is_none() {
            return Err(WardenError::Parse(
                "disable_method is \"group\" but disabled_group_id is not set".into(),
            ));
        }
        if self.punishment.window_hours == 0 || self.punishment.window_hours > 720 {
            return Err(WardenError::Parse("punishment.window_hours must be 1..=720".into()));
        }
        if self.punishment.steps.is_empty() {
            return Err(WardenError::Parse("punishment.steps must not be empty".into()));
        }
        Ok(())
    }

    /// Effective IP limit for `user` (special override, else general).
    pub fn limit_for(&self, user: &str) -> u32 {
        self.limits.special.get(user).copied().unwrap_or(self.limits.general)
    }

    /// Evaluator period with the 30-second floor applied.
    pub fn check_interval_secs(&self) -> u64 {
        self.timing.check_interval.max(30)
    }

    /// Default re-enable delay with the 60-second floor applied.
    pub fn time_to_active_secs(&self) -> u64 {
        self.timing.time_to_active_users.max(60)
    }

    /// Geo filter target, treating the literal `"None"` like an absent value.
    pub fn country_filter(&self) -> Option<&str> {
        match self.settings.country_code.as_deref() {
            None | Some("None") | Some("") => None,
            Some(code) => Some(code),
        }
    }
}

/// Shared, reloadable view of the config.
///
/// Control loops re-read the operator's file on their own cadence; admin
/// operations mutate and rewrite it. A handle without a backing file (used
/// by tests) just holds a fixed value.
pub struct ConfigHandle {
    path: Option<std::path::PathBuf>,
    inner: std::sync::RwLock<WardenConfig>,
}

impl ConfigHandle {
    pub fn from_file(path: impl Into<std::path::PathBuf>) -> Result<Self, WardenError> {
        let path = path.into();
        let config = WardenConfig::load(&path)?;
        Ok(Self { path: Some(path), inner: std::sync::RwLock::new(config) })
    }

    pub fn fixed(config: WardenConfig) -> Self {
        Self { path: None, inner: std::sync::RwLock::new(config) }
    }

    pub fn current(&self) -> WardenConfig {
        self.inner.read().unwrap().clone()
    }

    /// Re-read the backing file. A file that fails to load keeps the
    /// previous value so a half-written config never takes the limiter down.
    pub fn reload(&self) -> WardenConfig {
        if let Some(path) = &self.path {
            match WardenConfig::load(path) {
                Ok(config) => *self.inner.write().unwrap() = config,
                Err(e) => {
                    tracing::warn!(error = %e, "config reload failed, keeping previous config")
                }
            }
        }
        self.current()
    }

    /// Apply `mutate` and persist the result (when file-backed).
    pub fn update<F: FnOnce(&mut WardenConfig)>(&self, mutate: F) -> Result<WardenConfig, WardenError> {
        let mut guard = self.inner.write().unwrap();
        mutate(&mut guard);
        if let Some(path) = &self.path {
            guard.save(path)?;
        }
        Ok(guard.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> WardenConfig {
        let mut config = WardenConfig::default();
        config.panel.username = "admin".into();
        config.panel.password = "secret".into();
        config.panel.domain = "panel.example.com".into();
        config
    }

    #[test]
    fn minimal_config_passes_validation() {
        minimal().validate().expect("minimal config should validate");
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = WardenConfig::default();
        assert_eq!(config.limits.general, 2);
        assert_eq!(config.timing.check_interval, 60);
        assert_eq!(config.timing.time_to_active_users, 1800);
        assert!(config.punishment.enabled);
        assert_eq!(config.punishment.window_hours, 168);
        assert_eq!(config.punishment.steps.len(), 5);
        assert_eq!(config.punishment.instant_disable_threshold, -60.0);
        assert!(config.cdn_use_xff);
    }

    #[test]
    fn group_mode_requires_group_id() {
        let mut config = minimal();
        config.disable_method = DisableMethod::Group;
        assert!(config.validate().is_err());
        config.disabled_group_id = Some(9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn intervals_are_clamped_not_rejected() {
        let mut config = minimal();
        config.timing.check_interval = 5;
        config.timing.time_to_active_users = 10;
        assert_eq!(config.check_interval_secs(), 30);
        assert_eq!(config.time_to_active_secs(), 60);
    }

    #[test]
    fn special_limit_overrides_general() {
        let mut config = minimal();
        config.limits.special.insert("vip".into(), 7);
        assert_eq!(config.limit_for("vip"), 7);
        assert_eq!(config.limit_for("other"), 2);
    }

    #[test]
    fn country_filter_treats_none_literal_as_absent() {
        let mut config = minimal();
        assert_eq!(config.country_filter(), None);
        config.settings.country_code = Some("None".into());
        assert_eq!(config.country_filter(), None);
        config.settings.country_code = Some("DE".into());
        assert_eq!(config.country_filter(), Some("DE"));
    }

    #[test]
    fn steps_parse_from_operator_json() {
        let json = r#"{
            "panel": {"username": "a", "password": "b", "domain": "p.example.com"},
            "punishment": {
                "steps": [
                    {"type": "warning", "duration": 0},
                    {"type": "disable", "duration": 15},
                    {"type": "revoke", "duration": 0}
                ]
            }
        }"#;
        let config: WardenConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.punishment.steps.len(), 3);
        assert_eq!(config.punishment.steps[1].duration_minutes, 15);
        assert_eq!(config.punishment.steps[2].kind, StepKind::Revoke);
    }

    #[test]
    fn config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = minimal();
        config.except_users.insert("alice".into());
        config.save(&path).unwrap();
        let loaded = WardenConfig::load(&path).unwrap();
        assert!(loaded.except_users.contains("alice"));
        assert_eq!(loaded.panel.domain, "panel.example.com");
    }
}

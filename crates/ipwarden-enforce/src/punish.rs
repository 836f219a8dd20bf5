//! Escalating punishment ladder.
//!
//! Violations are recorded with timestamps, trimmed to a sliding window, and
//! the next step for a user is simply `steps[min(count, len-1)]`. Warning
//! steps never touch the disabled store but do consume a slot, so the next
//! violation escalates past them.
//!
//! Durable file shape: `{ "violations": { "<user>": [ <record>, ... ] } }`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use ipwarden_core::config::PunishmentConfig;
use ipwarden_core::{PunishmentStep, StepKind, UnixSecs, Username, ViolationRecord};
use ipwarden_store::file;

#[derive(Debug, Clone)]
pub struct PunishmentPolicy {
    pub enabled: bool,
    pub window_hours: u64,
    pub steps: Vec<PunishmentStep>,
}

impl From<&PunishmentConfig> for PunishmentPolicy {
    fn from(config: &PunishmentConfig) -> Self {
        let steps = if config.steps.is_empty() {
            PunishmentConfig::default_steps()
        } else {
            config.steps.clone()
        };
        Self { enabled: config.enabled, window_hours: config.window_hours, steps }
    }
}

impl PunishmentPolicy {
    fn window_secs(&self) -> f64 {
        self.window_hours as f64 * 3600.0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DiskState {
    #[serde(default)]
    violations: BTreeMap<Username, Vec<ViolationRecord>>,
}

pub struct PunishmentEngine {
    path: PathBuf,
    state: Mutex<DiskState>,
    policy: Mutex<PunishmentPolicy>,
}

impl PunishmentEngine {
    pub fn open(path: impl Into<PathBuf>, config: &PunishmentConfig) -> Self {
        let path = path.into();
        let state: DiskState = file::load_or_default(&path);
        if !state.violations.is_empty() {
            info!(users = state.violations.len(), "loaded violation history");
        }
        Self { path, state: Mutex::new(state), policy: Mutex::new(PunishmentPolicy::from(config)) }
    }

    /// Swap in a freshly-reloaded policy. Called once per evaluator tick.
    pub fn set_policy(&self, config: &PunishmentConfig) {
        *self.policy.lock().unwrap() = PunishmentPolicy::from(config);
    }

    pub fn policy(&self) -> PunishmentPolicy {
        self.policy.lock().unwrap().clone()
    }

    fn persist(&self, state: &DiskState) {
        if let Err(e) = file::write_atomic(&self.path, state) {
            warn!(error = %e, "failed to persist violation history");
        }
    }

    /// Drop records that fell out of the window. Users with no remaining
    /// records disappear entirely.
    pub fn trim(&self, now: UnixSecs) {
        let window = self.policy.lock().unwrap().window_secs();
        let cutoff = now - window;
        let mut state = self.state.lock().unwrap();
        state.violations.retain(|_, records| {
            records.retain(|r| r.timestamp > cutoff);
            !records.is_empty()
        });
    }

    /// Violations for `username` inside the window.
    pub fn count_in_window(&self, username: &str, now: UnixSecs) -> usize {
        let window = self.policy.lock().unwrap().window_secs();
        let cutoff = now - window;
        let state = self.state.lock().unwrap();
        state
            .violations
            .get(username)
            .map(|records| records.iter().filter(|r| r.timestamp > cutoff).count())
            .unwrap_or(0)
    }

    /// `(step_index, step)` to apply on the user's next confirmed violation.
    ///
    /// With the ladder disabled the system degrades to a single unlimited
    /// disable for everyone.
    pub fn next_step(&self, username: &str, now: UnixSecs) -> (usize, PunishmentStep) {
        let policy = self.policy.lock().unwrap().clone();
        if !policy.enabled {
            return (0, PunishmentStep { kind: StepKind::Disable, duration_minutes: 0 });
        }
        let index = self.count_in_window(username, now).min(policy.steps.len() - 1);
        (index, policy.steps[index])
    }

    /// Append one applied step, trimming expired records in the same write.
    pub fn record(&self, username: &str, step_index: usize, duration_minutes: u64, now: UnixSecs) {
        let cutoff = now - self.policy.lock().unwrap().window_secs();
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            state
                .violations
                .entry(username.to_string())
                .or_default()
                .push(ViolationRecord {
                    username: username.to_string(),
                    timestamp: now,
                    step_applied: step_index,
                    disable_duration: duration_minutes,
                    enabled_at: None,
                });
            state.violations.retain(|_, records| {
                records.retain(|r| r.timestamp > cutoff);
                !records.is_empty()
            });
            state.clone()
        };
        self.persist(&snapshot);
        info!(user = %username, step = step_index, duration_minutes, "recorded violation");
    }

    /// Executed disables (non-warning steps) for `username` in the last
    /// `hours`. Feeds the trust scorer; monitoring that cleared a user never
    /// shows up here.
    pub fn prior_disables(&self, username: &str, hours: u64, now: UnixSecs) -> u32 {
        let policy = self.policy.lock().unwrap().clone();
        let cutoff = now - hours as f64 * 3600.0;
        let state = self.state.lock().unwrap();
        state
            .violations
            .get(username)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.timestamp > cutoff)
                    .filter(|r| {
                        policy
                            .steps
                            .get(r.step_applied)
                            .map(|s| !s.is_warning())
                            .unwrap_or(true)
                    })
                    .count() as u32
            })
            .unwrap_or(0)
    }

    pub fn clear_user(&self, username: &str) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            state.violations.remove(username);
            state.clone()
        };
        self.persist(&snapshot);
    }

    pub fn clear_all(&self) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            state.violations.clear();
            state.clone()
        };
        self.persist(&snapshot);
    }

    /// Per-user summary for the admin surface.
    pub fn user_summary(&self, username: &str, now: UnixSecs) -> (usize, usize, PunishmentStep) {
        let count = self.count_in_window(username, now);
        let (index, step) = self.next_step(username, now);
        (count, index, step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipwarden_core::config::PunishmentConfig;

    fn engine(dir: &tempfile::TempDir) -> PunishmentEngine {
        PunishmentEngine::open(dir.path().join("violations.json"), &PunishmentConfig::default())
    }

    #[test]
    fn ladder_advances_one_step_per_recorded_violation() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let now = 1_000_000.0;

        let (index, step) = engine.next_step("alice", now);
        assert_eq!(index, 0);
        assert!(step.is_warning());

        engine.record("alice", 0, 0, now);
        let (index, step) = engine.next_step("alice", now + 1.0);
        assert_eq!(index, 1);
        assert_eq!(step.duration_minutes, 10);

        engine.record("alice", 1, 10, now + 1.0);
        let (index, step) = engine.next_step("alice", now + 2.0);
        assert_eq!(index, 2);
        assert_eq!(step.duration_minutes, 30);
    }

    #[test]
    fn step_index_caps_at_ladder_end() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let now = 1_000_000.0;
        for i in 0..10 {
            engine.record("alice", i.min(4), 0, now + i as f64);
        }
        let (index, step) = engine.next_step("alice", now + 20.0);
        assert_eq!(index, 4, "index never exceeds len(steps)-1");
        assert!(step.is_unlimited());
    }

    #[test]
    fn window_expiry_resets_the_ladder() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let now = 1_000_000.0;
        engine.record("alice", 1, 10, now);
        assert_eq!(engine.count_in_window("alice", now + 1.0), 1);

        // Default window is 168 h.
        let later = now + 168.0 * 3600.0 + 1.0;
        assert_eq!(engine.count_in_window("alice", later), 0);
        let (index, _) = engine.next_step("alice", later);
        assert_eq!(index, 0);
    }

    #[test]
    fn disabled_ladder_degrades_to_unlimited_disable() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PunishmentConfig::default();
        config.enabled = false;
        let engine =
            PunishmentEngine::open(dir.path().join("violations.json"), &config);
        let (index, step) = engine.next_step("anyone", 0.0);
        assert_eq!(index, 0);
        assert!(step.is_unlimited());
    }

    #[test]
    fn prior_disables_exclude_warning_steps() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let now = 1_000_000.0;
        engine.record("alice", 0, 0, now - 100.0); // warning step
        engine.record("alice", 1, 10, now - 50.0); // disable step
        assert_eq!(engine.prior_disables("alice", 12, now), 1);
        assert_eq!(engine.count_in_window("alice", now), 2, "warnings still consume slots");
    }

    #[test]
    fn prior_disables_honor_the_hour_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let now = 1_000_000.0;
        engine.record("alice", 1, 10, now - 11.0 * 3600.0);
        engine.record("alice", 2, 30, now - 23.0 * 3600.0);
        assert_eq!(engine.prior_disables("alice", 12, now), 1);
        assert_eq!(engine.prior_disables("alice", 24, now), 2);
    }

    #[test]
    fn history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let now = 1_000_000.0;
        {
            let engine = engine(&dir);
            engine.record("alice", 1, 10, now);
        }
        let engine = engine(&dir);
        assert_eq!(engine.count_in_window("alice", now + 1.0), 1);
    }

    #[test]
    fn clear_user_and_clear_all() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        engine.record("alice", 0, 0, 100.0);
        engine.record("bob", 0, 0, 100.0);
        engine.clear_user("alice");
        assert_eq!(engine.count_in_window("alice", 101.0), 0);
        assert_eq!(engine.count_in_window("bob", 101.0), 1);
        engine.clear_all();
        assert_eq!(engine.count_in_window("bob", 101.0), 0);
    }
}

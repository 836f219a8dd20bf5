//! End-to-end enforcement scenarios.
//!
//! Drives the evaluator, the punishment ladder, the durable stores and the
//! re-enable loop against a scripted in-memory panel. Time is passed
//! explicitly so every decision point is exact.
//!
//! Run with:
//!   cargo test -p ipwarden-enforce --test scenarios

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use ipwarden_core::config::ConfigHandle;
use ipwarden_core::{DisableMethod, UserStatus, Username, WardenConfig, WardenError};
use ipwarden_enforce::{
    cleanup_deleted_users, IspInfo, IspResolver, PanelGate, PunishmentEngine, Reenabler,
    ViolationEvaluator, WarningSet,
};
use ipwarden_ingest::ActiveUserTable;
use ipwarden_store::{DisabledUserStore, GroupBackupStore, IpHistoryStore};

// ── Scripted panel ────────────────────────────────────────────────────────────

#[derive(Clone)]
struct MockUser {
    status: String,
    groups: Vec<i64>,
    admin: Option<String>,
}

impl MockUser {
    fn active() -> Self {
        Self { status: "active".into(), groups: Vec::new(), admin: None }
    }

    fn with_groups(groups: Vec<i64>) -> Self {
        Self { groups, ..Self::active() }
    }
}

#[derive(Default)]
struct MockPanel {
    users: Mutex<BTreeMap<String, MockUser>>,
    fail_mutations: AtomicBool,
    status_calls: Mutex<Vec<(String, String)>>,
    group_calls: Mutex<Vec<(String, Vec<i64>)>>,
}

impl MockPanel {
    fn with_users(names: &[&str]) -> Arc<Self> {
        let panel = Self::default();
        {
            let mut users = panel.users.lock().unwrap();
            for name in names {
                users.insert(name.to_string(), MockUser::active());
            }
        }
        Arc::new(panel)
    }

    fn insert(&self, name: &str, user: MockUser) {
        self.users.lock().unwrap().insert(name.to_string(), user);
    }

    fn user(&self, name: &str) -> MockUser {
        self.users.lock().unwrap().get(name).cloned().expect("user present in mock")
    }

    fn status_calls(&self) -> Vec<(String, String)> {
        self.status_calls.lock().unwrap().clone()
    }

    fn group_calls(&self) -> Vec<(String, Vec<i64>)> {
        self.group_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PanelGate for MockPanel {
    async fn check_user_exists(&self, username: &str) -> Result<bool, WardenError> {
        Ok(self.users.lock().unwrap().contains_key(username))
    }

    async fn set_user_status(&self, username: &str, status: UserStatus) -> Result<(), WardenError> {
        if self.fail_mutations.load(Ordering::Relaxed) {
            return Err(WardenError::PanelUnavailable("scripted outage".into()));
        }
        let mut users = self.users.lock().unwrap();
        let user = users
            .get_mut(username)
            .ok_or_else(|| WardenError::UserNotFound(username.to_string()))?;
        user.status = status.as_str().to_string();
        self.status_calls
            .lock()
            .unwrap()
            .push((username.to_string(), status.as_str().to_string()));
        Ok(())
    }

    async fn set_user_groups(&self, username: &str, group_ids: &[i64]) -> Result<(), WardenError> {
        if self.fail_mutations.load(Ordering::Relaxed) {
            return Err(WardenError::PanelUnavailable("scripted outage".into()));
        }
        let mut users = self.users.lock().unwrap();
        let user = users
            .get_mut(username)
            .ok_or_else(|| WardenError::UserNotFound(username.to_string()))?;
        user.groups = group_ids.to_vec();
        self.group_calls
            .lock()
            .unwrap()
            .push((username.to_string(), group_ids.to_vec()));
        Ok(())
    }

    async fn user_groups(&self, username: &str) -> Result<Vec<i64>, WardenError> {
        self.users
            .lock()
            .unwrap()
            .get(username)
            .map(|u| u.groups.clone())
            .ok_or_else(|| WardenError::UserNotFound(username.to_string()))
    }

    async fn user_admin(&self, username: &str) -> Result<Option<String>, WardenError> {
        self.users
            .lock()
            .unwrap()
            .get(username)
            .map(|u| u.admin.clone())
            .ok_or_else(|| WardenError::UserNotFound(username.to_string()))
    }

    async fn list_usernames(&self) -> Result<Vec<Username>, WardenError> {
        Ok(self.users.lock().unwrap().keys().cloned().collect())
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

struct Harness {
    _dir: tempfile::TempDir,
    panel: Arc<MockPanel>,
    table: Arc<ActiveUserTable>,
    warnings: Arc<WarningSet>,
    punishment: Arc<PunishmentEngine>,
    disabled: Arc<DisabledUserStore>,
    groups: Arc<GroupBackupStore>,
    history: Arc<IpHistoryStore>,
    isp: Arc<IspResolver>,
    evaluator: ViolationEvaluator,
    reenabler: Reenabler,
    config: Arc<ConfigHandle>,
}

fn base_config() -> WardenConfig {
    let mut config = WardenConfig::default();
    config.panel.username = "admin".into();
    config.panel.password = "secret".into();
    config.panel.domain = "panel.test".into();
    config
}

fn harness(panel: Arc<MockPanel>, config: WardenConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(ActiveUserTable::new());
    let warnings = Arc::new(WarningSet::open(dir.path().join("warnings.json")));
    let punishment =
        Arc::new(PunishmentEngine::open(dir.path().join("violations.json"), &config.punishment));
    let disabled = Arc::new(DisabledUserStore::open(dir.path().join("disabled.json")));
    let groups = Arc::new(GroupBackupStore::open(dir.path().join("groups.json")));
    let history = Arc::new(IpHistoryStore::open(dir.path().join("ip_history.json")));
    let isp = Arc::new(IspResolver::offline());
    let config = Arc::new(ConfigHandle::fixed(config));

    let evaluator = ViolationEvaluator::new(
        panel.clone(),
        table.clone(),
        warnings.clone(),
        punishment.clone(),
        disabled.clone(),
        groups.clone(),
        history.clone(),
        isp.clone(),
        config.clone(),
    );
    let reenabler =
        Reenabler::new(panel.clone(), disabled.clone(), groups.clone(), config.clone());

    Harness {
        _dir: dir,
        panel,
        table,
        warnings,
        punishment,
        disabled,
        groups,
        history,
        isp,
        evaluator,
        reenabler,
        config,
    }
}

/// One cycle's worth of observations for a user, one record per (ip, inbound).
fn observe(h: &Harness, user: &str, entries: &[(&str, &str)], now: f64) {
    for (ip, inbound) in entries {
        h.table.record(user, ip, 1, "edge-1", inbound, now);
    }
}

const T0: f64 = 1_700_000_000.0;

// ── Scenario 1: neutral trust walks the ladder ───────────────────────────────

#[tokio::test]
async fn neutral_trust_violation_walks_the_ladder() {
    let panel = MockPanel::with_users(&["alice"]);
    let h = harness(panel, base_config());
    let ips = [("198.51.100.1", "Vless"), ("198.51.100.2", "Vless"), ("198.51.100.3", "Vless")];

    // First round: warning, monitoring, then a warning-only step.
    observe(&h, "alice", &ips, T0);
    h.evaluator.tick(T0).await;
    assert!(h.warnings.is_monitored("alice", T0 + 1.0), "warning opened");
    assert!(!h.disabled.contains("alice"), "neutral trust must not instant-disable");

    for cycle in [60.0, 120.0] {
        observe(&h, "alice", &ips, T0 + cycle);
        h.evaluator.tick(T0 + cycle).await;
    }

    observe(&h, "alice", &ips, T0 + 180.0);
    h.evaluator.tick(T0 + 180.0).await;

    assert!(!h.disabled.contains("alice"), "step 0 is warning-only");
    assert!(h.panel.status_calls().is_empty(), "no panel mutation for a warning step");
    assert_eq!(h.punishment.count_in_window("alice", T0 + 181.0), 1, "slot consumed");
    assert!(!h.warnings.is_monitored("alice", T0 + 181.0), "warning closed after decision");

    // Second round half an hour later: step 1, a 10-minute disable.
    let t1 = T0 + 1800.0;
    observe(&h, "alice", &ips, t1);
    h.evaluator.tick(t1).await;
    for cycle in [60.0, 120.0] {
        observe(&h, "alice", &ips, t1 + cycle);
        h.evaluator.tick(t1 + cycle).await;
    }
    observe(&h, "alice", &ips, t1 + 180.0);
    h.evaluator.tick(t1 + 180.0).await;

    assert!(h.disabled.contains("alice"));
    let (disabled_at, enable_at) = h.disabled.entry("alice").unwrap();
    assert_eq!(disabled_at, t1 + 180.0);
    assert_eq!(enable_at, Some(t1 + 180.0 + 600.0), "10-minute step sets enable_at");
    assert_eq!(h.panel.status_calls(), vec![("alice".to_string(), "disabled".to_string())]);
    assert_eq!(h.punishment.count_in_window("alice", t1 + 181.0), 2);
    assert_eq!(h.panel.user("alice").status, "disabled");
}

// ── Scenario 2: trust threshold and instant disable ──────────────────────────

fn multi_device_observations() -> [(&'static str, &'static str); 3] {
    [("1.1.1.2", "Vless"), ("2.2.2.2", "Vless"), ("3.3.3.3", "Vmess")]
}

fn prime_two_carriers(h: &Harness) {
    h.isp.prime("1.1.1.2", IspInfo { isp: "CarrierA".into(), ..IspInfo::unknown() });
    h.isp.prime("2.2.2.2", IspInfo { isp: "CarrierB".into(), ..IspInfo::unknown() });
    h.isp.prime("3.3.3.3", IspInfo { isp: "CarrierB".into(), ..IspInfo::unknown() });
}

#[tokio::test]
async fn score_minus_55_gets_normal_monitoring() {
    let panel = MockPanel::with_users(&["bob"]);
    let h = harness(panel, base_config());
    prime_two_carriers(&h);
    // Two prior executed disables inside 12 h: score lands at -55, above the
    // -60 threshold.
    h.punishment.record("bob", 1, 10, T0 - 3600.0);
    h.punishment.record("bob", 2, 30, T0 - 1800.0);

    observe(&h, "bob", &multi_device_observations(), T0);
    h.evaluator.tick(T0).await;

    assert!(!h.disabled.contains("bob"), "-55 > -60: no instant disable");
    let warning = h.warnings.get_active("bob", T0 + 1.0).expect("normal warning instead");
    assert_eq!(warning.trust_score, -55.0);
}

#[tokio::test]
async fn third_prior_disable_triggers_instant_disable() {
    let panel = MockPanel::with_users(&["bob"]);
    let h = harness(panel, base_config());
    prime_two_carriers(&h);
    h.punishment.record("bob", 1, 10, T0 - 3600.0);
    h.punishment.record("bob", 2, 30, T0 - 1800.0);
    h.punishment.record("bob", 3, 60, T0 - 900.0);

    observe(&h, "bob", &multi_device_observations(), T0);
    h.evaluator.tick(T0).await;

    assert!(h.disabled.contains("bob"), "-75 <= -60: monitoring skipped");
    assert!(!h.warnings.is_monitored("bob", T0 + 1.0));
    // Three violations in the window put the next step at index 3: 60 min.
    let (_, enable_at) = h.disabled.entry("bob").unwrap();
    assert_eq!(enable_at, Some(T0 + 3600.0));
    assert_eq!(h.punishment.count_in_window("bob", T0 + 1.0), 4, "instant disable recorded");
    assert_eq!(h.panel.user("bob").status, "disabled");
}

#[tokio::test]
async fn score_exactly_at_threshold_is_instant() {
    let mut config = base_config();
    config.punishment.instant_disable_threshold = -55.0;
    let panel = MockPanel::with_users(&["bob"]);
    let h = harness(panel, config);
    prime_two_carriers(&h);
    h.punishment.record("bob", 1, 10, T0 - 3600.0);
    h.punishment.record("bob", 2, 30, T0 - 1800.0);

    observe(&h, "bob", &multi_device_observations(), T0);
    h.evaluator.tick(T0).await;

    assert!(h.disabled.contains("bob"), "score equal to the threshold disables");
}

// ── Scenario 3: monitoring clears non-persistent IPs ─────────────────────────

#[tokio::test]
async fn monitoring_clears_non_persistent_ips() {
    let panel = MockPanel::with_users(&["carol"]);
    let h = harness(panel, base_config());

    // Four IPs show up once.
    let burst = [
        ("198.51.100.1", "Vless"),
        ("198.51.100.2", "Vless"),
        ("198.51.100.3", "Vless"),
        ("198.51.100.4", "Vless"),
    ];
    observe(&h, "carol", &burst, T0);
    h.evaluator.tick(T0).await;
    assert!(h.warnings.is_monitored("carol", T0 + 1.0));

    // Only the first IP keeps appearing.
    for cycle in [60.0, 120.0] {
        observe(&h, "carol", &[("198.51.100.1", "Vless")], T0 + cycle);
        h.evaluator.tick(T0 + cycle).await;
    }

    observe(&h, "carol", &[("198.51.100.1", "Vless")], T0 + 180.0);
    h.evaluator.tick(T0 + 180.0).await;

    assert!(!h.disabled.contains("carol"));
    assert!(h.panel.status_calls().is_empty());
    assert_eq!(
        h.punishment.count_in_window("carol", T0 + 181.0),
        0,
        "a cleared monitoring period leaves no trace"
    );
    assert!(!h.warnings.is_monitored("carol", T0 + 181.0));
}

// ── Scenario 4: group-mode disable and re-enable ─────────────────────────────

fn group_mode_config() -> WardenConfig {
    let mut config = base_config();
    config.disable_method = DisableMethod::Group;
    config.disabled_group_id = Some(99);
    config
}

#[tokio::test]
async fn group_mode_disable_saves_backup_and_moves_user() {
    let panel = MockPanel::with_users(&[]);
    panel.insert("bob", MockUser::with_groups(vec![5, 7]));
    let h = harness(panel, group_mode_config());
    prime_two_carriers(&h);
    for i in 0..3 {
        h.punishment.record("bob", 1, 10, T0 - 900.0 * (i as f64 + 1.0));
    }

    observe(&h, "bob", &multi_device_observations(), T0);
    h.evaluator.tick(T0).await;

    assert!(h.disabled.contains("bob"));
    assert_eq!(h.groups.get("bob"), Some(vec![5, 7]), "original groups backed up");
    assert_eq!(h.panel.user("bob").groups, vec![99], "moved to the disabled group");
    assert_eq!(h.panel.user("bob").status, "disabled");
}

#[tokio::test]
async fn reenable_restores_original_groups_then_status() {
    let panel = MockPanel::with_users(&[]);
    panel.insert("dave", MockUser::with_groups(vec![99]));
    let h = harness(panel, group_mode_config());

    // dave was disabled at T0 for 10 minutes with his groups backed up.
    h.disabled.add("dave", 600, false, T0);
    h.groups.save("dave", vec![5, 7]);

    let config = h.config.current();
    h.reenabler.tick(&config, T0 + 599.0).await;
    assert!(h.disabled.contains("dave"), "not due yet");

    h.reenabler.tick(&config, T0 + 601.0).await;
    assert_eq!(h.panel.user("dave").groups, vec![5, 7], "original groups restored");
    assert_eq!(h.panel.user("dave").status, "active");
    assert_eq!(h.panel.group_calls(), vec![("dave".to_string(), vec![5, 7])]);
    assert!(!h.disabled.contains("dave"));
    assert_eq!(h.groups.get("dave"), None, "backup consumed");
}

#[tokio::test]
async fn reenable_without_backup_falls_back_to_status() {
    let panel = MockPanel::with_users(&["erin"]);
    let h = harness(panel, group_mode_config());
    h.disabled.add("erin", 60, false, T0);

    let config = h.config.current();
    h.reenabler.tick(&config, T0 + 61.0).await;
    assert!(h.panel.group_calls().is_empty(), "no backup, no group restore");
    assert_eq!(h.panel.user("erin").status, "active");
    assert!(!h.disabled.contains("erin"));
}

// ── Scenario 5: deleted-user cleanup ─────────────────────────────────────────

#[tokio::test]
async fn cleanup_removes_ghosts_and_keeps_live_users() {
    let panel = MockPanel::with_users(&["alive", "other"]);
    let mut config = base_config();
    config.limits.special.insert("ghost".into(), 5);
    config.except_users.insert("ghost".into());
    config.except_users.insert("alive".into());
    let h = harness(panel, config);
    h.disabled.add("ghost", 0, false, T0);
    h.groups.save("ghost", vec![1]);
    h.history.record("ghost", &["198.51.100.9".to_string()].into(), T0);

    let summary =
        cleanup_deleted_users(h.panel.as_ref(), &h.config, &h.disabled, &h.groups, &h.history)
            .await
            .expect("cleanup succeeds");

    assert_eq!(summary.special_limits_removed, vec!["ghost".to_string()]);
    assert_eq!(summary.except_users_removed, vec!["ghost".to_string()]);
    assert_eq!(summary.disabled_users_removed, vec!["ghost".to_string()]);
    assert_eq!(summary.group_backups_removed, vec!["ghost".to_string()]);
    assert_eq!(summary.histories_removed, vec!["ghost".to_string()]);

    let after = h.config.current();
    assert!(after.limits.special.is_empty());
    assert!(after.except_users.contains("alive"), "live users preserved");
    assert!(!h.disabled.contains("ghost"));
    assert_eq!(h.groups.get("ghost"), None);
    assert!(h.history.user_history("ghost").is_none());
}

#[tokio::test]
async fn cleanup_aborts_when_panel_returns_nothing() {
    let panel = MockPanel::with_users(&[]);
    let mut config = base_config();
    config.except_users.insert("alive".into());
    let h = harness(panel, config);
    h.disabled.add("alive", 0, false, T0);

    let result =
        cleanup_deleted_users(h.panel.as_ref(), &h.config, &h.disabled, &h.groups, &h.history)
            .await;
    assert!(result.is_err(), "empty panel list must abort");
    assert!(h.disabled.contains("alive"), "no mutation on abort");
    assert!(h.config.current().except_users.contains("alive"));
}

#[tokio::test]
async fn cleanup_refuses_mass_removal_of_special_limits() {
    let panel = MockPanel::with_users(&["survivor"]);
    let mut config = base_config();
    for i in 0..6 {
        config.limits.special.insert(format!("stale{i}"), 3);
    }
    let h = harness(panel, config);

    let result =
        cleanup_deleted_users(h.panel.as_ref(), &h.config, &h.disabled, &h.groups, &h.history)
            .await;
    assert!(result.is_err(), "removing all 6 of 6 special limits must abort");
    assert_eq!(h.config.current().limits.special.len(), 6, "config untouched");
}

// ── Failure semantics and invariants ─────────────────────────────────────────

#[tokio::test]
async fn failed_disable_keeps_warning_and_records_nothing() {
    let panel = MockPanel::with_users(&["alice"]);
    let h = harness(panel, base_config());
    let ips = [("198.51.100.1", "Vless"), ("198.51.100.2", "Vless"), ("198.51.100.3", "Vless")];
    // One prior violation so the next step is a real disable.
    h.punishment.record("alice", 0, 0, T0 - 60.0);

    observe(&h, "alice", &ips, T0);
    h.evaluator.tick(T0).await;
    for cycle in [60.0, 120.0] {
        observe(&h, "alice", &ips, T0 + cycle);
        h.evaluator.tick(T0 + cycle).await;
    }

    h.panel.fail_mutations.store(true, Ordering::Relaxed);
    observe(&h, "alice", &ips, T0 + 180.0);
    h.evaluator.tick(T0 + 180.0).await;

    assert!(!h.disabled.contains("alice"), "failed disable must not touch the store");
    assert_eq!(h.punishment.count_in_window("alice", T0 + 181.0), 1, "nothing recorded");
    assert_eq!(h.warnings.expired(T0 + 181.0).len(), 1, "warning kept for retry");

    // Panel recovers; the next tick retries the identical decision.
    h.panel.fail_mutations.store(false, Ordering::Relaxed);
    observe(&h, "alice", &ips, T0 + 240.0);
    h.evaluator.tick(T0 + 240.0).await;

    assert!(h.disabled.contains("alice"));
    assert_eq!(h.punishment.count_in_window("alice", T0 + 241.0), 2);
    assert!(h.warnings.is_empty());
}

#[tokio::test]
async fn disabled_users_are_never_warning_candidates() {
    let panel = MockPanel::with_users(&["frank"]);
    let h = harness(panel, base_config());
    h.disabled.add("frank", 600, false, T0);

    observe(
        &h,
        "frank",
        &[("198.51.100.1", "Vless"), ("198.51.100.2", "Vless"), ("198.51.100.3", "Vless")],
        T0,
    );
    h.evaluator.tick(T0).await;
    assert!(!h.warnings.is_monitored("frank", T0 + 1.0));
}

#[tokio::test]
async fn whitelisted_users_are_never_evaluated() {
    let panel = MockPanel::with_users(&["vip"]);
    let mut config = base_config();
    config.except_users.insert("vip".into());
    let h = harness(panel, config);

    observe(
        &h,
        "vip",
        &[("198.51.100.1", "Vless"), ("198.51.100.2", "Vless"), ("198.51.100.3", "Vless")],
        T0,
    );
    h.evaluator.tick(T0).await;
    assert!(!h.warnings.is_monitored("vip", T0 + 1.0));
    assert!(!h.disabled.contains("vip"));
}

#[tokio::test]
async fn ip_count_equal_to_limit_is_not_a_violation() {
    let panel = MockPanel::with_users(&["grace"]);
    let h = harness(panel, base_config());
    observe(&h, "grace", &[("198.51.100.1", "Vless"), ("198.51.100.2", "Vless")], T0);
    h.evaluator.tick(T0).await;
    assert!(!h.warnings.is_monitored("grace", T0 + 1.0), "exactly at limit: no warning");
}

#[tokio::test]
async fn group_filter_skips_users_outside_monitored_groups() {
    let panel = MockPanel::with_users(&[]);
    panel.insert("inside", MockUser::with_groups(vec![1]));
    panel.insert("outside", MockUser::with_groups(vec![2]));
    let mut config = base_config();
    config.filters.monitored_group_ids = Some(vec![1]);
    let h = harness(panel, config);

    let ips = [("198.51.100.1", "Vless"), ("198.51.100.2", "Vless"), ("198.51.100.3", "Vless")];
    observe(&h, "inside", &ips, T0);
    observe(&h, "outside", &ips, T0);
    h.evaluator.tick(T0).await;

    assert!(h.warnings.is_monitored("inside", T0 + 1.0));
    assert!(!h.warnings.is_monitored("outside", T0 + 1.0));
}

#[tokio::test]
async fn vanished_user_is_dropped_without_store_insert() {
    let panel = MockPanel::with_users(&["henry"]);
    let h = harness(panel.clone(), base_config());
    let ips = [("198.51.100.1", "Vless"), ("198.51.100.2", "Vless"), ("198.51.100.3", "Vless")];
    h.punishment.record("henry", 0, 0, T0 - 60.0);

    observe(&h, "henry", &ips, T0);
    h.evaluator.tick(T0).await;
    for cycle in [60.0, 120.0] {
        observe(&h, "henry", &ips, T0 + cycle);
        h.evaluator.tick(T0 + cycle).await;
    }

    // Deleted from the panel mid-monitoring.
    panel.users.lock().unwrap().remove("henry");
    observe(&h, "henry", &ips, T0 + 180.0);
    h.evaluator.tick(T0 + 180.0).await;

    assert!(!h.disabled.contains("henry"));
    assert!(h.warnings.is_empty(), "warning dropped for a vanished user");
    assert_eq!(h.punishment.count_in_window("henry", T0 + 181.0), 1, "nothing new recorded");
}

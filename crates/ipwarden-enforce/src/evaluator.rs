//! The per-cycle violation evaluator.
//!
//! Once per `check_interval` the evaluator drains the active-user table and
//! walks users in lexicographic order:
//!
//!   1. Warnings whose 3-minute window closed are decided: more persistent
//!      devices than the limit escalates through the punishment ladder,
//!      anything less clears the warning without recording a violation.
//!   2. Users newly over their limit either update an open warning in place
//!      or get a fresh one; a trust score at or below the instant-disable
//!      threshold skips the window entirely.
//!
//! A failed panel disable leaves every piece of state untouched (warning
//! kept, nothing recorded, store not updated) so the next tick retries the
//! identical decision.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use ipwarden_core::config::ConfigHandle;
use ipwarden_core::{
    unix_now, DisableMethod, PunishmentStep, UnixSecs, UserActivity, UserStatus, Username,
    WardenConfig, WardenError,
};
use ipwarden_ingest::ActiveUserTable;
use ipwarden_store::{DisabledUserStore, GroupBackupStore, IpHistoryStore};

use crate::isp::IspResolver;
use crate::panel_gate::PanelGate;
use crate::punish::PunishmentEngine;
use crate::trust::{compute_score, TrustLevel};
use crate::warning::{Warning, WarningSet};

pub struct ViolationEvaluator {
    panel: Arc<dyn PanelGate>,
    table: Arc<ActiveUserTable>,
    warnings: Arc<WarningSet>,
    punishment: Arc<PunishmentEngine>,
    disabled: Arc<DisabledUserStore>,
    groups: Arc<GroupBackupStore>,
    history: Arc<IpHistoryStore>,
    isp: Arc<IspResolver>,
    config: Arc<ConfigHandle>,
}

impl ViolationEvaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        panel: Arc<dyn PanelGate>,
        table: Arc<ActiveUserTable>,
        warnings: Arc<WarningSet>,
        punishment: Arc<PunishmentEngine>,
        disabled: Arc<DisabledUserStore>,
        groups: Arc<GroupBackupStore>,
        history: Arc<IpHistoryStore>,
        isp: Arc<IspResolver>,
        config: Arc<ConfigHandle>,
    ) -> Self {
        Self { panel, table, warnings, punishment, disabled, groups, history, isp, config }
    }

    /// Timer-driven loop. The interval is re-read every cycle so operator
    /// changes apply without a restart.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.config.reload();
            self.tick(unix_now()).await;
            let interval = self.config.current().check_interval_secs();
            sleep(Duration::from_secs(interval)).await;
        }
    }

    /// One evaluation cycle at `now`.
    pub async fn tick(&self, now: UnixSecs) {
        let config = self.config.current();
        self.punishment.set_policy(&config.punishment);
        self.punishment.trim(now);

        // Snapshot-and-clear is one critical section; appends racing with it
        // land in the next cycle.
        let snapshot: BTreeMap<Username, UserActivity> =
            self.table.snapshot_and_clear().into_iter().collect();

        self.history.record_cycle(
            snapshot.iter().map(|(username, user)| (username.as_str(), user.unique_ips())),
            now,
        );
        self.history.prune(ipwarden_core::IP_HISTORY_RETENTION_SECS, now);

        // ISP evidence is only needed for users the evaluator will actually
        // look at: over-limit or mid-monitoring.
        let monitored: BTreeSet<Username> =
            self.warnings.monitored_users(now).into_iter().collect();
        let mut lookup_ips: BTreeSet<String> = BTreeSet::new();
        for (username, user) in &snapshot {
            let over_limit = user.unique_ips().len() > config.limit_for(username) as usize;
            if over_limit || monitored.contains(username) {
                lookup_ips.extend(user.unique_ips().iter().cloned());
            }
        }
        let isp_info = self.isp.lookup_many(&lookup_ips).await;

        let flagged = crate::analyzer::multi_device_users(&snapshot);
        if !flagged.is_empty() {
            debug!(
                users = snapshot.len(),
                multi_device = flagged.len(),
                nodes = crate::analyzer::node_usage_summary(&snapshot).len(),
                "cycle snapshot"
            );
        }
        let report =
            crate::report::build_report(&snapshot, &config, &self.warnings, &isp_info, now);
        if !report.is_empty() {
            info!(over_limit = report.len(), "active users over limit:\n{}",
                crate::report::render_report(&report));
        }

        let mut processed: BTreeSet<Username> = BTreeSet::new();
        self.sweep_expired_warnings(&config, now, &mut processed).await;
        self.check_current_violations(&config, &snapshot, &isp_info, &processed, now)
            .await;
    }

    /// Decide every warning whose monitoring window has closed.
    async fn sweep_expired_warnings(
        &self,
        config: &WardenConfig,
        now: UnixSecs,
        processed: &mut BTreeSet<Username>,
    ) {
        for warning in self.warnings.expired(now) {
            let username = warning.username.clone();
            processed.insert(username.clone());

            let limit = config.limit_for(&username) as usize;
            let devices = warning.persistent_devices(now);

            if devices.len() <= limit {
                info!(
                    user = %username,
                    devices = devices.len(),
                    limit,
                    "monitoring ended, devices within limit, no violation recorded"
                );
                self.warnings.remove(&username);
                continue;
            }

            match self.execute_disable(&username, config, now, false).await {
                Ok((step_index, step)) => {
                    warn!(
                        user = %username,
                        devices = devices.len(),
                        limit,
                        trust = warning.trust_score,
                        step_index,
                        step = %step,
                        "monitoring confirmed violation"
                    );
                    self.warnings.remove(&username);
                }
                Err(WardenError::UserNotFound(_)) => {
                    warn!(user = %username, "user no longer on panel, dropping warning");
                    self.warnings.remove(&username);
                }
                Err(e) => {
                    // Keep the warning: the next tick retries the same
                    // decision against a hopefully-recovered panel.
                    error!(user = %username, error = %e, "disable failed, keeping warning");
                }
            }
        }
    }

    /// Walk the cycle's snapshot for fresh or continuing violations.
    async fn check_current_violations(
        &self,
        config: &WardenConfig,
        snapshot: &BTreeMap<Username, UserActivity>,
        isp_info: &std::collections::HashMap<String, crate::isp::IspInfo>,
        processed: &BTreeSet<Username>,
        now: UnixSecs,
    ) {
        for (username, user) in snapshot {
            if config.except_users.contains(username) || processed.contains(username) {
                continue;
            }
            if self.disabled.contains(username) {
                continue;
            }

            let unique = user.unique_ips().clone();
            let limit = config.limit_for(username) as usize;
            let isp_names = IspResolver::known_isp_names(isp_info, &unique);

            // A monitored user's activity keeps accumulating every cycle they
            // appear, whether or not this cycle is over the limit; the
            // persistence decision at window end depends on it.
            if let Some(mut warning) = self.warnings.get_active(username, now) {
                warning.absorb_cycle(unique, &user.device_info, isp_names, now);
                warning.trust_score = compute_score(&warning.evidence());
                debug!(user = %username, trust = warning.trust_score, "monitoring updated");
                self.warnings.put(warning);
                continue;
            }

            if unique.len() <= limit {
                continue;
            }

            if !self.passes_filters(username, config).await {
                debug!(user = %username, "outside monitored groups/admins, skipping");
                continue;
            }

            let prior_12h = self.punishment.prior_disables(username, 12, now);
            let prior_24h = self.punishment.prior_disables(username, 24, now);
            let mut warning = Warning::new(
                username,
                unique,
                &user.device_info,
                isp_names,
                prior_12h,
                prior_24h,
                now,
            );
            warning.trust_score = compute_score(&warning.evidence());

            if warning.trust_score <= config.punishment.instant_disable_threshold {
                match self.execute_disable(username, config, now, true).await {
                    Ok((step_index, step)) => {
                        warn!(
                            user = %username,
                            ips = warning.ip_count,
                            trust = warning.trust_score,
                            step_index,
                            step = %step,
                            "instant disable, monitoring skipped"
                        );
                        continue;
                    }
                    Err(WardenError::UserNotFound(_)) => {
                        warn!(user = %username, "user no longer on panel, skipping");
                        continue;
                    }
                    Err(e) => {
                        error!(
                            user = %username,
                            error = %e,
                            "instant disable failed, falling back to monitoring"
                        );
                    }
                }
            }

            let ip_list: Vec<String> = warning.ips.iter().cloned().collect();
            warn!(
                user = %username,
                ips = warning.ip_count,
                addrs = %crate::analyzer::group_ips_by_subnet(&ip_list).join(", "),
                limit,
                trust = warning.trust_score,
                level = TrustLevel::from_score(warning.trust_score).as_str(),
                "limit exceeded, monitoring for 3 minutes"
            );
            self.warnings.put(warning);
        }
    }

    /// Group/admin scoping. Fails open: a panel error never hides a user
    /// from enforcement.
    async fn passes_filters(&self, username: &str, config: &WardenConfig) -> bool {
        if !config.filters.is_active() {
            return true;
        }
        if let Some(monitored_groups) = &config.filters.monitored_group_ids {
            match self.panel.user_groups(username).await {
                Ok(groups) => {
                    if !groups.iter().any(|g| monitored_groups.contains(g)) {
                        return false;
                    }
                }
                Err(e) => debug!(user = %username, error = %e, "group filter lookup failed"),
            }
        }
        if let Some(monitored_admins) = &config.filters.monitored_admins {
            match self.panel.user_admin(username).await {
                Ok(Some(admin)) => {
                    if !monitored_admins.contains(&admin) {
                        return false;
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(user = %username, error = %e, "admin filter lookup failed"),
            }
        }
        true
    }

    /// Apply the user's next punishment step.
    ///
    /// `force_disable` (instant disables) skips past warning-only steps so
    /// "instant" always means an actual disable. Panel mutation happens
    /// before any local state changes; on failure nothing is recorded.
    async fn execute_disable(
        &self,
        username: &str,
        config: &WardenConfig,
        now: UnixSecs,
        force_disable: bool,
    ) -> Result<(usize, PunishmentStep), WardenError> {
        if !self.panel.check_user_exists(username).await? {
            return Err(WardenError::UserNotFound(username.to_string()));
        }

        let policy = self.punishment.policy();
        let (mut step_index, mut step) = self.punishment.next_step(username, now);
        if force_disable {
            while step.is_warning() && step_index + 1 < policy.steps.len() {
                step_index += 1;
                step = policy.steps[step_index];
            }
        }

        if step.is_warning() {
            // Warning-only step: the slot is consumed, nothing else changes.
            self.punishment.record(username, step_index, 0, now);
            info!(user = %username, "escalation step is warning-only, user stays active");
            return Ok((step_index, step));
        }

        match config.disable_method {
            DisableMethod::Status => {
                self.panel.set_user_status(username, UserStatus::Disabled).await?;
            }
            DisableMethod::Group => {
                let group_id = config.disabled_group_id.ok_or_else(|| {
                    WardenError::Other("group disable configured without disabled_group_id".into())
                })?;
                let original = self.panel.user_groups(username).await?;
                self.groups.save(username, original);
                self.panel.set_user_groups(username, &[group_id]).await?;
                // The group move already cuts access; a failed status change
                // on top of it is logged, not fatal.
                if let Err(e) = self.panel.set_user_status(username, UserStatus::Disabled).await {
                    warn!(user = %username, error = %e, "status change after group move failed");
                }
            }
        }

        self.disabled
            .add(username, step.duration_secs(), step.is_unlimited(), now);
        self.punishment.record(username, step_index, step.duration_minutes, now);
        Ok((step_index, step))
    }
}

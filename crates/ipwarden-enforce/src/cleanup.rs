//! Removal of users that no longer exist on the panel.
//!
//! Deleted users otherwise linger forever in special limits, the whitelist,
//! the disabled store and the group backup. Two guards protect against a
//! lying panel: an empty user list aborts outright, and a special-limits
//! map bigger than five entries refuses to lose more than half its users in
//! one pass.

use std::collections::BTreeSet;

use tracing::{info, warn};

use ipwarden_core::config::ConfigHandle;
use ipwarden_core::{Username, WardenError};
use ipwarden_store::{DisabledUserStore, GroupBackupStore, IpHistoryStore};

use crate::panel_gate::PanelGate;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupSummary {
    pub special_limits_removed: Vec<Username>,
    pub except_users_removed: Vec<Username>,
    pub disabled_users_removed: Vec<Username>,
    pub group_backups_removed: Vec<Username>,
    pub histories_removed: Vec<Username>,
}

impl CleanupSummary {
    pub fn total(&self) -> usize {
        self.special_limits_removed.len()
            + self.except_users_removed.len()
            + self.disabled_users_removed.len()
            + self.group_backups_removed.len()
            + self.histories_removed.len()
    }
}

pub async fn cleanup_deleted_users(
    panel: &dyn PanelGate,
    config: &ConfigHandle,
    disabled: &DisabledUserStore,
    groups: &GroupBackupStore,
    history: &IpHistoryStore,
) -> Result<CleanupSummary, WardenError> {
    let panel_users: BTreeSet<Username> = panel.list_usernames().await?.into_iter().collect();
    if panel_users.is_empty() {
        return Err(WardenError::Other(
            "panel returned zero users; aborting cleanup to prevent data loss".into(),
        ));
    }
    info!(count = panel_users.len(), "panel user list fetched for cleanup");

    let current = config.current();
    let mut summary = CleanupSummary::default();

    summary.special_limits_removed = current
        .limits
        .special
        .keys()
        .filter(|u| !panel_users.contains(*u))
        .cloned()
        .collect();
    summary.except_users_removed = current
        .except_users
        .iter()
        .filter(|u| !panel_users.contains(*u))
        .cloned()
        .collect();

    let special_total = current.limits.special.len();
    let stale_special = summary.special_limits_removed.len();
    if special_total > 5 && stale_special * 2 > special_total {
        warn!(
            stale = stale_special,
            total = special_total,
            "cleanup would remove most special limits; panel list looks wrong"
        );
        return Err(WardenError::Other(format!(
            "refusing to remove {stale_special} of {special_total} special limits in one pass"
        )));
    }

    if !summary.special_limits_removed.is_empty() || !summary.except_users_removed.is_empty() {
        let stale_special = summary.special_limits_removed.clone();
        let stale_except = summary.except_users_removed.clone();
        config.update(|c| {
            for user in &stale_special {
                c.limits.special.remove(user);
            }
            for user in &stale_except {
                c.except_users.remove(user);
            }
        })?;
    }

    for username in disabled.usernames() {
        if !panel_users.contains(&username) {
            disabled.remove(&username);
            summary.disabled_users_removed.push(username);
        }
    }
    for username in groups.usernames() {
        if !panel_users.contains(&username) {
            groups.remove(&username);
            summary.group_backups_removed.push(username);
        }
    }
    for username in history.usernames() {
        if !panel_users.contains(&username) {
            history.remove(&username);
            summary.histories_removed.push(username);
        }
    }

    info!(removed = summary.total(), "cleanup complete");
    Ok(summary)
}

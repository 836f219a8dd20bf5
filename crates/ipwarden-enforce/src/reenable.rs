//! Re-enable loop.
//!
//! Every 30 seconds the disabled store is scanned for users whose window
//! expired. In group mode the original groups are restored before the
//! status flips back to active; with no backup on file the loop falls back
//! to a plain status enable. Per-user failures are logged and never block
//! the rest of the batch.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{error, info, warn};

use ipwarden_core::config::ConfigHandle;
use ipwarden_core::{unix_now, DisableMethod, UnixSecs, UserStatus, WardenConfig, WardenError};
use ipwarden_store::{DisabledUserStore, GroupBackupStore};

use crate::panel_gate::PanelGate;

pub struct Reenabler {
    panel: Arc<dyn PanelGate>,
    disabled: Arc<DisabledUserStore>,
    groups: Arc<GroupBackupStore>,
    config: Arc<ConfigHandle>,
}

impl Reenabler {
    pub fn new(
        panel: Arc<dyn PanelGate>,
        disabled: Arc<DisabledUserStore>,
        groups: Arc<GroupBackupStore>,
        config: Arc<ConfigHandle>,
    ) -> Self {
        Self { panel, disabled, groups, config }
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            sleep(ipwarden_core::REENABLE_SCAN_INTERVAL).await;
            let config = self.config.reload();
            self.tick(&config, unix_now()).await;
        }
    }

    /// One due-scan at `now`.
    pub async fn tick(&self, config: &WardenConfig, now: UnixSecs) {
        let due = self.disabled.due_for_enable(config.time_to_active_secs(), now);
        if due.is_empty() {
            return;
        }
        info!(count = due.len(), "re-enabling users whose disable window expired");

        for username in due {
            match enable_user(self.panel.as_ref(), &self.groups, config, &username).await {
                Ok(()) => {
                    self.disabled.remove(&username);
                    self.groups.remove(&username);
                    info!(user = %username, "user re-enabled");
                }
                Err(WardenError::UserNotFound(_)) => {
                    // Deleted on the panel while disabled; nothing left to
                    // re-enable.
                    warn!(user = %username, "user no longer on panel, dropping from disabled store");
                    self.disabled.remove(&username);
                    self.groups.remove(&username);
                }
                Err(e) => {
                    error!(user = %username, error = %e, "re-enable failed, will retry next scan");
                }
            }
        }
    }
}

/// Reactivate one user: group restore first in group mode (falling back to a
/// plain status enable when no backup exists), then the status flip.
pub async fn enable_user(
    panel: &dyn PanelGate,
    groups: &GroupBackupStore,
    config: &WardenConfig,
    username: &str,
) -> Result<(), WardenError> {
    if config.disable_method == DisableMethod::Group {
        match groups.get(username) {
            Some(original) => {
                panel.set_user_groups(username, &original).await?;
            }
            None => {
                warn!(user = %username, "no saved groups, enabling by status only");
            }
        }
    }
    panel.set_user_status(username, UserStatus::Active).await
}

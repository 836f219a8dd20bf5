//! The seam between enforcement and the panel.
//!
//! The evaluator and the re-enable loop only ever need this handful of
//! operations; keeping them behind a trait lets the whole decision pipeline
//! run against a scripted panel in tests.

use async_trait::async_trait;

use ipwarden_core::{UserStatus, Username, WardenError};
use ipwarden_panel::PanelClient;

#[async_trait]
pub trait PanelGate: Send + Sync {
    /// Fail-open existence probe.
    async fn check_user_exists(&self, username: &str) -> Result<bool, WardenError>;

    async fn set_user_status(&self, username: &str, status: UserStatus) -> Result<(), WardenError>;

    async fn set_user_groups(&self, username: &str, group_ids: &[i64]) -> Result<(), WardenError>;

    /// Current `group_ids` of a user.
    async fn user_groups(&self, username: &str) -> Result<Vec<i64>, WardenError>;

    /// The admin owning a user, when the panel exposes one.
    async fn user_admin(&self, username: &str) -> Result<Option<String>, WardenError>;

    /// Every username known to the panel.
    async fn list_usernames(&self) -> Result<Vec<Username>, WardenError>;
}

#[async_trait]
impl PanelGate for PanelClient {
    async fn check_user_exists(&self, username: &str) -> Result<bool, WardenError> {
        PanelClient::check_user_exists(self, username).await
    }

    async fn set_user_status(&self, username: &str, status: UserStatus) -> Result<(), WardenError> {
        self.update_user_status(username, status).await
    }

    async fn set_user_groups(&self, username: &str, group_ids: &[i64]) -> Result<(), WardenError> {
        self.update_user_groups(username, group_ids).await
    }

    async fn user_groups(&self, username: &str) -> Result<Vec<i64>, WardenError> {
        self.get_user_groups(username).await
    }

    async fn user_admin(&self, username: &str) -> Result<Option<String>, WardenError> {
        let details = self.get_user_details(username).await?;
        // Either a plain string or an object with a username field,
        // depending on panel version.
        let admin = match details.get("admin") {
            Some(serde_json::Value::String(name)) => Some(name.clone()),
            Some(value) => value
                .get("username")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            None => None,
        };
        Ok(admin)
    }

    async fn list_usernames(&self) -> Result<Vec<Username>, WardenError> {
        self.list_users().await
    }
}

//! Programmatic admin surface behind the CLI subcommands.
//!
//! Everything here operates on the same config handle and durable stores the
//! daemon uses, so a command run next to a live daemon observes and mutates
//! the identical on-disk state.

use std::sync::Arc;

use anyhow::{bail, Context};

use ipwarden_core::config::ConfigHandle;
use ipwarden_core::{unix_now, WardenConfig};
use ipwarden_enforce::reenable::enable_user;
use ipwarden_enforce::{cleanup_deleted_users, PanelGate, PunishmentEngine, WarningSet};
use ipwarden_store::{DisabledUserStore, GroupBackupStore, IpHistoryStore};

// ── Special limits ───────────────────────────────────────────────────────────

pub fn limit_list(config: &ConfigHandle) {
    let current = config.current();
    println!("general limit: {}", current.limits.general);
    if current.limits.special.is_empty() {
        println!("no special limits set");
        return;
    }
    for (user, limit) in &current.limits.special {
        println!("{user}: {limit}");
    }
}

pub fn limit_set(config: &ConfigHandle, user: &str, limit: u32) -> anyhow::Result<()> {
    if limit < 1 {
        bail!("limit must be at least 1");
    }
    config
        .update(|c| {
            c.limits.special.insert(user.to_string(), limit);
        })
        .context("saving config")?;
    println!("special limit for {user} set to {limit}");
    Ok(())
}

pub fn limit_del(config: &ConfigHandle, user: &str) -> anyhow::Result<()> {
    let mut removed = false;
    config
        .update(|c| {
            removed = c.limits.special.remove(user).is_some();
        })
        .context("saving config")?;
    if removed {
        println!("special limit for {user} removed");
    } else {
        println!("{user} has no special limit");
    }
    Ok(())
}

// ── Whitelist ────────────────────────────────────────────────────────────────

pub fn except_list(config: &ConfigHandle) {
    let current = config.current();
    if current.except_users.is_empty() {
        println!("whitelist is empty");
        return;
    }
    for user in &current.except_users {
        println!("{user}");
    }
}

pub fn except_add(config: &ConfigHandle, user: &str) -> anyhow::Result<()> {
    config
        .update(|c| {
            c.except_users.insert(user.to_string());
        })
        .context("saving config")?;
    println!("{user} added to whitelist");
    Ok(())
}

pub fn except_del(config: &ConfigHandle, user: &str) -> anyhow::Result<()> {
    let mut removed = false;
    config
        .update(|c| {
            removed = c.except_users.remove(user);
        })
        .context("saving config")?;
    if removed {
        println!("{user} removed from whitelist");
    } else {
        println!("{user} was not on the whitelist");
    }
    Ok(())
}

// ── Disabled users ───────────────────────────────────────────────────────────

fn format_ts(ts: f64) -> String {
    use chrono::TimeZone;
    chrono::Local
        .timestamp_opt(ts as i64, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{ts:.0}"))
}

pub fn disabled_list(config: &WardenConfig, disabled: &DisabledUserStore) {
    let users = disabled.usernames();
    if users.is_empty() {
        println!("no users are disabled");
        return;
    }
    let now = unix_now();
    let default_secs = config.time_to_active_secs();
    for user in users {
        let Some((disabled_at, _)) = disabled.entry(&user) else { continue };
        match disabled.remaining_seconds(&user, default_secs, now) {
            -2 => println!("{user}: disabled {}, permanent (manual enable only)", format_ts(disabled_at)),
            -1 => {}
            remaining => println!(
                "{user}: disabled {}, {remaining}s remaining (enables around {})",
                format_ts(disabled_at),
                format_ts(now + remaining as f64),
            ),
        }
    }
}

pub async fn disabled_enable(
    panel: Arc<dyn PanelGate>,
    config: &WardenConfig,
    disabled: &DisabledUserStore,
    groups: &GroupBackupStore,
    user: &str,
) -> anyhow::Result<()> {
    if !disabled.contains(user) {
        bail!("{user} is not disabled");
    }
    enable_user(panel.as_ref(), groups, config, user)
        .await
        .with_context(|| format!("re-enabling {user}"))?;
    disabled.remove(user);
    groups.remove(user);
    println!("{user} re-enabled");
    Ok(())
}

pub async fn disabled_enable_all(
    panel: Arc<dyn PanelGate>,
    config: &WardenConfig,
    disabled: &DisabledUserStore,
    groups: &GroupBackupStore,
) -> anyhow::Result<()> {
    let users = disabled.usernames();
    if users.is_empty() {
        println!("no users are disabled");
        return Ok(());
    }
    let mut failures = 0usize;
    for user in users {
        match enable_user(panel.as_ref(), groups, config, &user).await {
            Ok(()) => {
                disabled.remove(&user);
                groups.remove(&user);
                println!("{user} re-enabled");
            }
            Err(e) => {
                failures += 1;
                eprintln!("{user}: {e}");
            }
        }
    }
    if failures > 0 {
        bail!("{failures} user(s) could not be re-enabled");
    }
    Ok(())
}

/// Forget disabled entries without touching the panel.
pub fn disabled_clear(disabled: &DisabledUserStore) {
    let cleared = disabled.clear_all();
    println!("cleared {} disabled-user entries", cleared.len());
}

// ── Status / cleanup ─────────────────────────────────────────────────────────

pub fn status(
    config: &WardenConfig,
    disabled: &DisabledUserStore,
    warnings: &WarningSet,
    punishment: &PunishmentEngine,
) {
    let now = unix_now();
    println!("panel domain:      {}", config.panel.domain);
    println!("general limit:     {}", config.limits.general);
    println!("special limits:    {}", config.limits.special.len());
    println!("whitelisted users: {}", config.except_users.len());
    println!("check interval:    {}s", config.check_interval_secs());
    println!("disable method:    {:?}", config.disable_method);
    println!("disabled users:    {}", disabled.len());

    let monitored = warnings.monitored_users(now);
    println!("monitored users:   {}", monitored.len());
    for user in monitored {
        if let Some(warning) = warnings.get_active(&user, now) {
            let (violations, _, next) = punishment.user_summary(&user, now);
            println!(
                "  {user}: {} IPs, trust {:.0}, {}s left, {} violation(s), next step {}",
                warning.ip_count,
                warning.trust_score,
                warning.remaining_secs(now),
                violations,
                next,
            );
        }
    }
}

pub async fn cleanup(
    panel: Arc<dyn PanelGate>,
    config: &ConfigHandle,
    disabled: &DisabledUserStore,
    groups: &GroupBackupStore,
    history: &IpHistoryStore,
) -> anyhow::Result<()> {
    let summary = cleanup_deleted_users(panel.as_ref(), config, disabled, groups, history)
        .await
        .context("cleaning up deleted users")?;
    println!("special limits removed: {:?}", summary.special_limits_removed);
    println!("whitelist removed:      {:?}", summary.except_users_removed);
    println!("disabled removed:       {:?}", summary.disabled_users_removed);
    println!("group backups removed:  {:?}", summary.group_backups_removed);
    println!("IP histories removed:   {:?}", summary.histories_removed);
    println!("total: {}", summary.total());
    Ok(())
}

/// Show the long-term IP history of one user.
pub fn history_show(history: &IpHistoryStore, user: &str) {
    match history.user_history(user) {
        None => println!("no recorded history for {user}"),
        Some(entries) => {
            for (ip, entry) in entries {
                println!(
                    "{ip}: first seen {}, last seen {}, {} sighting(s)",
                    format_ts(entry.first_seen),
                    format_ts(entry.last_seen),
                    entry.count,
                );
            }
        }
    }
}

//! ipwarden — IP-connection limiter daemon and admin CLI.
//!
//! `ipwarden run` startup sequence:
//!   1. Load the config file and open the durable stores
//!   2. Build the panel client and fetch the node list
//!   3. Spawn one SSE log-stream task per connected node, plus the
//!      discovery / cancel / refresh control loops
//!   4. Spawn the re-enable loop and drive the evaluator as the main loop
//!
//! Every other subcommand is a one-shot admin operation over the same config
//! file and state directory.

mod admin;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use ipwarden_core::config::ConfigHandle;
use ipwarden_core::WardenConfig;
use ipwarden_enforce::{
    IspResolver, PanelGate, PunishmentEngine, Reenabler, ViolationEvaluator, WarningSet,
};
use ipwarden_ingest::{ActiveUserTable, LogParser, NodeStreamManager};
use ipwarden_panel::{PanelClient, PanelCredentials};
use ipwarden_store::{DisabledUserStore, GroupBackupStore, IpHistoryStore};

#[derive(Parser, Debug)]
#[command(name = "ipwarden", version, about = "IP-connection limiter for panel-managed proxies")]
struct Cli {
    /// Path to the config file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Directory holding the durable state files.
    #[arg(long, default_value = ".")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the limiter daemon (the default).
    Run,
    /// Manage per-user special limits.
    Limit {
        #[command(subcommand)]
        action: LimitAction,
    },
    /// Manage the whitelist of never-limited users.
    Except {
        #[command(subcommand)]
        action: ExceptAction,
    },
    /// Inspect and manage disabled users.
    Disabled {
        #[command(subcommand)]
        action: DisabledAction,
    },
    /// Show configuration and enforcement state.
    Status,
    /// Show the long-term IP history of one user.
    History { user: String },
    /// Drop users deleted from the panel out of local state.
    Cleanup,
}

#[derive(Subcommand, Debug)]
enum LimitAction {
    /// List the general limit and all special limits.
    List,
    /// Set a special limit for one user.
    Set { user: String, limit: u32 },
    /// Remove a user's special limit.
    Del { user: String },
}

#[derive(Subcommand, Debug)]
enum ExceptAction {
    List,
    Add { user: String },
    Del { user: String },
}

#[derive(Subcommand, Debug)]
enum DisabledAction {
    /// List disabled users with their remaining time.
    List,
    /// Re-enable one user now.
    Enable { user: String },
    /// Re-enable every disabled user now.
    EnableAll,
    /// Forget all disabled entries without touching the panel.
    Clear,
}

struct StatePaths {
    disabled: PathBuf,
    groups: PathBuf,
    violations: PathBuf,
    warnings: PathBuf,
    history: PathBuf,
}

impl StatePaths {
    fn new(dir: &std::path::Path) -> Self {
        Self {
            disabled: dir.join("disabled_users.json"),
            groups: dir.join("group_backup.json"),
            violations: dir.join("violation_history.json"),
            warnings: dir.join("warnings.json"),
            history: dir.join("ip_history.json"),
        }
    }
}

fn panel_gate(config: &WardenConfig) -> Arc<PanelClient> {
    Arc::new(PanelClient::new(PanelCredentials {
        username: config.panel.username.clone(),
        password: config.panel.password.clone(),
        domain: config.panel.domain.clone(),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ipwarden=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.state_dir)
        .with_context(|| format!("creating state dir {}", cli.state_dir.display()))?;
    let paths = StatePaths::new(&cli.state_dir);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(&cli.config, &paths).await,

        Command::Limit { action } => {
            let config = ConfigHandle::from_file(&cli.config).context("loading config")?;
            match action {
                LimitAction::List => admin::limit_list(&config),
                LimitAction::Set { user, limit } => admin::limit_set(&config, &user, limit)?,
                LimitAction::Del { user } => admin::limit_del(&config, &user)?,
            }
            Ok(())
        }

        Command::Except { action } => {
            let config = ConfigHandle::from_file(&cli.config).context("loading config")?;
            match action {
                ExceptAction::List => admin::except_list(&config),
                ExceptAction::Add { user } => admin::except_add(&config, &user)?,
                ExceptAction::Del { user } => admin::except_del(&config, &user)?,
            }
            Ok(())
        }

        Command::Disabled { action } => {
            let config = ConfigHandle::from_file(&cli.config).context("loading config")?;
            let current = config.current();
            let disabled = DisabledUserStore::open(&paths.disabled);
            let groups = GroupBackupStore::open(&paths.groups);
            match action {
                DisabledAction::List => admin::disabled_list(&current, &disabled),
                DisabledAction::Enable { user } => {
                    let gate: Arc<dyn PanelGate> = panel_gate(&current);
                    admin::disabled_enable(gate, &current, &disabled, &groups, &user).await?;
                }
                DisabledAction::EnableAll => {
                    let gate: Arc<dyn PanelGate> = panel_gate(&current);
                    admin::disabled_enable_all(gate, &current, &disabled, &groups).await?;
                }
                DisabledAction::Clear => admin::disabled_clear(&disabled),
            }
            Ok(())
        }

        Command::Status => {
            let config = ConfigHandle::from_file(&cli.config).context("loading config")?;
            let current = config.current();
            let disabled = DisabledUserStore::open(&paths.disabled);
            let warnings = WarningSet::open(&paths.warnings);
            let punishment = PunishmentEngine::open(&paths.violations, &current.punishment);
            admin::status(&current, &disabled, &warnings, &punishment);
            Ok(())
        }

        Command::History { user } => {
            let history = IpHistoryStore::open(&paths.history);
            admin::history_show(&history, &user);
            Ok(())
        }

        Command::Cleanup => {
            let config = ConfigHandle::from_file(&cli.config).context("loading config")?;
            let current = config.current();
            let disabled = DisabledUserStore::open(&paths.disabled);
            let groups = GroupBackupStore::open(&paths.groups);
            let history = IpHistoryStore::open(&paths.history);
            let gate: Arc<dyn PanelGate> = panel_gate(&current);
            admin::cleanup(gate, &config, &disabled, &groups, &history).await
        }
    }
}

async fn run_daemon(config_path: &std::path::Path, paths: &StatePaths) -> anyhow::Result<()> {
    let config = Arc::new(ConfigHandle::from_file(config_path).context("loading config")?);
    let current = config.current();
    info!(domain = %current.panel.domain, "ipwarden starting");

    // ── Durable stores ────────────────────────────────────────────────────────
    let disabled = Arc::new(DisabledUserStore::open(&paths.disabled));
    let groups = Arc::new(GroupBackupStore::open(&paths.groups));
    let punishment = Arc::new(PunishmentEngine::open(&paths.violations, &current.punishment));
    let warnings = Arc::new(WarningSet::open(&paths.warnings));
    let history = Arc::new(IpHistoryStore::open(&paths.history));
    if !disabled.is_empty() {
        info!(count = disabled.len(), "previously disabled users restored, re-enable loop will release them");
    }

    // ── Panel client & ingest pipeline ────────────────────────────────────────
    let panel = panel_gate(&current);
    let table = Arc::new(ActiveUserTable::new());
    let parser = Arc::new(LogParser::new(
        current.cdn_inbounds.clone(),
        current.cdn_use_xff,
        current.country_filter().map(str::to_string),
        current.invalid_ips.iter().cloned(),
    ));
    let isp = Arc::new(IspResolver::new(
        current.api.ipinfo_token.clone(),
        current.api.use_fallback_isp_api,
    ));

    // ── Node log streams ──────────────────────────────────────────────────────
    let manager = Arc::new(NodeStreamManager::new(panel.clone(), parser, table.clone()));
    let nodes = panel.list_nodes(false).await.context("fetching node list")?;
    info!(
        nodes = nodes.len(),
        connected = nodes.iter().filter(|n| n.is_connected()).count(),
        "node list fetched"
    );
    manager.spawn_connected(&nodes).await;
    tokio::spawn(Arc::clone(&manager).discovery_loop());
    tokio::spawn(Arc::clone(&manager).cancel_loop());
    tokio::spawn(Arc::clone(&manager).refresh_loop());

    // ── Enforcement loops ─────────────────────────────────────────────────────
    let gate: Arc<dyn PanelGate> = panel.clone();
    let reenabler = Arc::new(Reenabler::new(
        gate.clone(),
        disabled.clone(),
        groups.clone(),
        config.clone(),
    ));
    tokio::spawn(reenabler.run());

    let evaluator = Arc::new(ViolationEvaluator::new(
        gate, table, warnings, punishment, disabled, groups, history, isp, config,
    ));
    info!("ipwarden ready");
    evaluator.run().await;
    Ok(())
}

//! Protocol-level and operational constants.
//!
//! Anything an operator may reasonably want to tune lives in the config
//! instead ([`crate::config`]); these are the fixed parameters of the
//! monitoring protocol and of the panel API contract.

use std::time::Duration;

// ── Panel client ─────────────────────────────────────────────────────────────

/// Acquired admin tokens are reused for this long before re-authenticating.
pub const TOKEN_CACHE_SECS: f64 = 1800.0;

/// The node list is cached for this long between panel refreshes.
pub const NODES_CACHE_SECS: f64 = 3600.0;

/// Maximum outer attempts for a panel operation before giving up.
pub const MAX_PANEL_ATTEMPTS: u32 = 5;

/// Attempts for the user-existence probe (fails open to `true` after this).
pub const MAX_EXISTS_ATTEMPTS: u32 = 3;

/// Page size for paginated user enumeration.
pub const USER_PAGE_LIMIT: usize = 100;

/// Timeout for short panel calls (token, status/group mutations).
pub const PANEL_TIMEOUT_SHORT: Duration = Duration::from_secs(5);

/// Timeout for listing calls that may return larger payloads.
pub const PANEL_TIMEOUT_LONG: Duration = Duration::from_secs(10);

// ── Log streaming ────────────────────────────────────────────────────────────

/// Delay before reconnecting a failed node log stream.
pub const STREAM_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Spacing between stream spawns so node connections do not stampede the
/// panel.
pub const STREAM_SPAWN_SPACING: Duration = Duration::from_secs(1);

/// Cadence of the new-node discovery sweep.
pub const NODE_DISCOVERY_INTERVAL: Duration = Duration::from_secs(120);

/// Cadence of the disconnected-node cancel sweep.
pub const NODE_CANCEL_INTERVAL: Duration = Duration::from_secs(60);

/// Full teardown-and-rebuild of every stream; bounds connection and node
/// list staleness.
pub const STREAM_REFRESH_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

// ── Geo / ISP lookups ────────────────────────────────────────────────────────

/// Per-endpoint timeout for country-code lookups.
pub const GEO_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(3);

/// Hard ceiling for one batched ISP lookup, regardless of IP count.
pub const ISP_BATCH_TIMEOUT: Duration = Duration::from_secs(8);

// ── Violation monitoring ─────────────────────────────────────────────────────

/// Length of the monitoring window opened by a warning.
pub const MONITORING_PERIOD_SECS: f64 = 180.0;

/// An IP active for at least this long counts as a confirmed device.
pub const MIN_DEVICE_DURATION_SECS: f64 = 120.0;

/// An IP must have been seen within this long to still count as a device.
pub const DEVICE_RECENCY_SECS: f64 = 120.0;

/// Cadence of the re-enable due-scan.
pub const REENABLE_SCAN_INTERVAL: Duration = Duration::from_secs(30);

// ── Durable state ────────────────────────────────────────────────────────────

/// Sentinel in the `enable_at` map meaning "never auto-enable".
pub const PERMANENT_SENTINEL: f64 = -1.0;

/// How long an idle IP stays in a user's long-term history.
pub const IP_HISTORY_RETENTION_SECS: f64 = 30.0 * 86_400.0;

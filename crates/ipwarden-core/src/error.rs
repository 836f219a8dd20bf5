use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    // ── Panel errors ─────────────────────────────────────────────────────────
    #[error("panel authentication failed after {attempts} attempts")]
    Auth { attempts: u32 },

    #[error("panel unavailable: {0}")]
    PanelUnavailable(String),

    #[error("user not found on panel: {0}")]
    UserNotFound(String),

    // ── Local data errors ────────────────────────────────────────────────────
    #[error("parse error: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(String),

    // ── Lookup errors ────────────────────────────────────────────────────────
    #[error("all geo-ip endpoints failed for {0}")]
    GeoUnavailable(String),

    // ── Control flow ─────────────────────────────────────────────────────────
    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl WardenError {
    /// True for errors a caller should retry on its own cadence rather than
    /// surface as fatal.
    pub fn is_transient(&self) -> bool {
        matches!(self, WardenError::PanelUnavailable(_) | WardenError::GeoUnavailable(_))
    }
}

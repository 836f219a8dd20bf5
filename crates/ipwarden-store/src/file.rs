//! Shared on-disk JSON helpers.
//!
//! Every durable file has a single owner component; writes are full-file
//! rewrites through a temp file in the same directory followed by a rename,
//! so readers never observe a partial write. A file that fails to parse is
//! treated as empty.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use ipwarden_core::WardenError;

/// Read and deserialize `path`, falling back to `T::default()` when the file
/// is missing, truncated, or otherwise unreadable.
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable state file, starting empty");
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}

/// Serialize `value` and atomically replace `path` with it.
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), WardenError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| WardenError::Storage(e.to_string()))?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text)
        .map_err(|e| WardenError::Storage(format!("writing {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| WardenError::Storage(format!("renaming into {}: {e}", path.display())))
}

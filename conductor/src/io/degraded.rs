//! Persistence for the fleet-wide degraded-mode record.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::fault::RateLimitWindow;

/// Load the degraded-mode record, or `None` if no window is open.
pub fn load_window(path: &Path) -> Result<Option<RateLimitWindow>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let window: RateLimitWindow =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(window))
}

/// Atomically write the degraded-mode record (temp file + rename).
pub fn write_window(path: &Path, window: &RateLimitWindow) -> Result<()> {
    debug!(path = %path.display(), resume_at = %window.resume_at, switched = window.switched.len(), "writing degraded-mode record");
    let mut buf = serde_json::to_string_pretty(window)?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

/// Remove the record after recovery. Missing files are fine.
pub fn delete_window(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::core::fault::SwitchedSession;

    #[test]
    fn window_round_trips_and_deletes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("local").join("degraded.json");
        assert_eq!(load_window(&path).expect("load"), None);

        let window = RateLimitWindow {
            switched: vec![SwitchedSession {
                session: "acme-coder-1".to_string(),
                original_mode: "default".to_string(),
            }],
            detected_at: Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap(),
            resume_at: Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).unwrap(),
            source: Some("acme-coder-1".to_string()),
        };
        write_window(&path, &window).expect("write");
        assert_eq!(load_window(&path).expect("load"), Some(window));

        delete_window(&path).expect("delete");
        delete_window(&path).expect("delete twice");
        assert_eq!(load_window(&path).expect("load"), None);
    }
}

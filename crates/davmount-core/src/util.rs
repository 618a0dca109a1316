use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the epoch.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

//! Wall-clock helper

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as a unix timestamp in milliseconds.
///
/// Token expiry is absolute wall-clock time (it is persisted and compared
/// across restarts), so this deliberately uses `SystemTime` rather than
/// `Instant`. A clock set before the epoch reads as 0.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

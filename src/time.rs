use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in UTC milliseconds. Every timestamp the core
/// produces or compares against goes through this single helper.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

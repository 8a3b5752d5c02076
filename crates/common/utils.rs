use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch. Used for wire timestamps and operator
/// logs only; liveness decisions use monotonic clocks plus heartbeat counters.
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

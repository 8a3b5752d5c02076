use serde::{Deserialize, Serialize};

/// Per-agent lifetime counters, persisted with the rest of the local state
/// and reported on the operator log at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub blocks_mined: u64,
    pub veins_mined: u64,
    pub fuel_consumed: u64,
    pub tunnels_completed: u64,
    pub steps_taken: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

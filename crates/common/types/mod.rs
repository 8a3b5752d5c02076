mod bounds;
mod config;
mod job;
mod metrics;
mod ore;
mod pose;
mod tunnel;

pub use bounds::BoundingBox;
pub use config::{ConfigError, QuarryConfig};
pub use job::{Job, JobId, JobKind, JobPayload, JobStatus};
pub use metrics::Metrics;
pub use ore::{OreObservation, OreStatus};
pub use pose::{Direction, Face, Pose, Position};
pub use tunnel::{Tunnel, TunnelId, TunnelState};

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Unique, stable identifier of one agent in the fleet.
///
/// Ids are totally ordered; the membership layer elects the live agent with
/// the numerically smallest id as leader.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct AgentId(pub u64);

impl Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque name of a coordination domain. Agents only exchange state with
/// peers carrying the same quarry id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct QuarryId(pub String);

impl Display for QuarryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for QuarryId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

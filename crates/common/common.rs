//! Shared data model for the AutoMine fleet.
//!
//! Everything in this crate is plain data plus the invariants that data must
//! uphold: poses and bounds in turtle-space, tunnel records, jobs, ore
//! observations, and the quarry configuration. The storage, bus, and mining
//! crates all build on these types; none of them is re-defined elsewhere.

pub mod types;
pub mod utils;

pub use types::{
    AgentId, BoundingBox, Direction, Face, Job, JobId, JobKind, JobPayload, JobStatus, Metrics,
    OreObservation, OreStatus, Pose, Position, QuarryConfig, QuarryId, Tunnel, TunnelId,
    TunnelState,
};

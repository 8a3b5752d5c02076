use serde::{Deserialize, Serialize};
use std::fmt::Display;

use super::{OreObservation, Tunnel, TunnelId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct JobId(pub u64);

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "J{}", self.0)
    }
}

/// Job categories in priority order. The numeric priority of a job is the
/// discriminant here, so recall always outranks refuel, refuel outranks ore,
/// and ore outranks tunnel work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Recall = 0,
    Refuel = 1,
    OreMine = 2,
    TunnelMine = 3,
}

impl JobKind {
    pub const fn priority(self) -> u8 {
        self as u8
    }

    /// System jobs are singletons: at most one live instance per agent.
    pub const fn is_system(self) -> bool {
        matches!(self, JobKind::Recall | JobKind::Refuel)
    }
}

impl Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobKind::Recall => "recall",
            JobKind::Refuel => "refuel",
            JobKind::OreMine => "ore_mine",
            JobKind::TunnelMine => "tunnel_mine",
        };
        write!(f, "{name}")
    }
}

/// Work-specific payload; the kind is derived from the variant so the two can
/// never disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Recall,
    Refuel,
    OreMine { observation: OreObservation },
    TunnelMine { tunnel: Tunnel },
}

impl JobPayload {
    pub const fn kind(&self) -> JobKind {
        match self {
            JobPayload::Recall => JobKind::Recall,
            JobPayload::Refuel => JobKind::Refuel,
            JobPayload::OreMine { .. } => JobKind::OreMine,
            JobPayload::TunnelMine { .. } => JobKind::TunnelMine,
        }
    }

    pub fn tunnel_id(&self) -> Option<TunnelId> {
        match self {
            JobPayload::TunnelMine { tunnel } => Some(tunnel.id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Claimed,
    Completed,
    Failed,
}

impl JobStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    /// Monotonic per-agent sequence; the queue orders by
    /// `(priority, created_seq)` so equal priorities run FIFO.
    pub created_seq: u64,
    pub attempts: u32,
    pub status: JobStatus,
}

impl Job {
    pub fn new(id: JobId, created_seq: u64, payload: JobPayload) -> Self {
        Self {
            id,
            payload,
            created_seq,
            attempts: 0,
            status: JobStatus::Queued,
        }
    }

    pub const fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    pub const fn priority(&self) -> u8 {
        self.payload.kind().priority()
    }

    /// Heap key: lower sorts first.
    pub const fn order_key(&self) -> (u8, u64) {
        (self.priority(), self.created_seq)
    }
}

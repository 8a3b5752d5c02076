use thiserror::Error;

use automine_bus::BusError;
use automine_common::types::{AgentId, Position, QuarryId};
use automine_storage::{JournalError, StoreError};

/// Failure of one bounded step. The worker maps each kind onto the handling
/// rules: fatal for the step, bounded retry, escalation, or operator halt.
#[derive(Debug, Error)]
pub enum StepError {
    /// Never retried; the step failed and the job deals with it.
    #[error("target {0} is outside the bounding box")]
    OutOfBounds(Position),
    #[error("still obstructed after {0} clearing attempts")]
    Blocked(u32),
    #[error("fuel exhausted: level {level}, needed {needed}")]
    FuelExhausted { level: u32, needed: u32 },
    #[error("chest has no usable items")]
    ChestEmpty,
    /// A replayed journal entry could not be confirmed; no state may advance
    /// past it.
    #[error("{0} pending journal entries failed verification")]
    Unverified(usize),
    #[error("configuration is stale; destructive work halted until synced")]
    ConfigDrift,
    #[error("no response from peer {0}")]
    PeerUnreachable(AgentId),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl StepError {
    /// Short label carried in the next heartbeat's status field so peers see
    /// fleet health.
    pub const fn status_label(&self) -> &'static str {
        match self {
            StepError::OutOfBounds(_) => "error:out_of_bounds",
            StepError::Blocked(_) => "error:blocked",
            StepError::FuelExhausted { .. } => "error:fuel_exhausted",
            StepError::ChestEmpty => "waiting_fuel",
            StepError::Unverified(_) => "error:unverified",
            StepError::ConfigDrift => "error:config_drift",
            StepError::PeerUnreachable(_) => "error:peer_unreachable",
            StepError::Journal(_) => "error:journal",
            StepError::Store(_) => "error:store",
            StepError::Bus(_) => "error:bus",
        }
    }
}

/// Failures while bringing an agent up; these end the process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("no configuration for quarry {0}; run `automine configure` or start a peer")]
    MissingConfig(QuarryId),
    #[error(transparent)]
    Config(#[from] automine_common::types::ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("calibration failed: {0}")]
    Calibration(StepError),
}

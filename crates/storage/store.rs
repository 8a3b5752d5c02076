//! The agent's durable state and configuration documents.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use automine_common::types::{
    AgentId, Metrics, OreObservation, Pose, QuarryConfig, QuarryId, Tunnel,
};

use crate::error::StoreError;
use crate::fsio;

/// Everything an agent must find again after a restart, minus the journal
/// (its own file) and the job queue (the ledger).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: AgentId,
    pub pose: Pose,
    /// Set once the calibration descent has fixed the turtle-space origin.
    /// Until then the bounding box is not engaged.
    pub calibrated: bool,
    /// Local replica of the shared tunnel plan, including claim holders.
    pub tunnels: Vec<Tunnel>,
    /// Local replica of the shared ore registry.
    pub ore: Vec<OreObservation>,
    pub recall_active: bool,
    /// Last bus sequence this agent allocated. Persisted so seq stays
    /// monotonic across restarts and receivers' dedupe keeps working.
    pub bus_seq: u64,
    /// Peers ever seen on this quarry; liveness is re-learned from heartbeats.
    pub peers: BTreeSet<AgentId>,
    pub metrics: Metrics,
}

impl AgentState {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            pose: Pose::default(),
            calibrated: false,
            tunnels: Vec::new(),
            ore: Vec::new(),
            recall_active: false,
            bus_seq: 0,
            peers: BTreeSet::new(),
            metrics: Metrics::default(),
        }
    }
}

/// Handle to one agent's data directory.
#[derive(Debug, Clone)]
pub struct Store {
    datadir: PathBuf,
}

impl Store {
    pub fn open(datadir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let datadir = datadir.into();
        fs::create_dir_all(&datadir)?;
        info!(datadir = %datadir.display(), "store opened");
        Ok(Self { datadir })
    }

    pub fn datadir(&self) -> &Path {
        &self.datadir
    }

    pub fn state_path(&self) -> PathBuf {
        self.datadir.join("state.json")
    }

    pub fn config_path(&self, quarry: &QuarryId) -> PathBuf {
        self.datadir.join(format!("config.{quarry}.json"))
    }

    pub fn journal_path(&self) -> PathBuf {
        self.datadir.join("journal.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.datadir.join("jobs.ledger")
    }

    pub fn load_state(&self) -> Result<Option<AgentState>, StoreError> {
        fsio::read_json(&self.state_path())
    }

    pub fn save_state(&self, state: &AgentState) -> Result<(), StoreError> {
        fsio::atomic_write_json(&self.state_path(), state)
    }

    pub fn load_config(&self, quarry: &QuarryId) -> Result<Option<QuarryConfig>, StoreError> {
        fsio::read_json(&self.config_path(quarry))
    }

    pub fn save_config(&self, config: &QuarryConfig) -> Result<(), StoreError> {
        fsio::atomic_write_json(&self.config_path(&config.quarry_id), config)
    }
}

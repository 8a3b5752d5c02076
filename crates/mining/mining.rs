//! The agent itself: everything between the quarry bus and the drill bit.
//!
//! The [`worker::Worker`] service owns one agent's tick loop. Below it sit
//! the journalled movement layer over a [`rig::Rig`] (the native actuator
//! surface), the axis-ordered navigator, the fuel and deposit protocols, the
//! persistent job queue, the shared tunnel plan, and the ore registry. The
//! [`sim`] module provides a deterministic in-memory rig for tests and
//! simulated fleets.

pub mod backoff;
pub mod calibration;
pub mod error;
pub mod fuel;
pub mod jobs;
pub mod movement;
pub mod navigator;
pub mod ore;
pub mod plan;
pub mod recovery;
pub mod rig;
pub mod sim;
pub mod worker;

pub use error::{StepError, WorkerError};
pub use movement::Movement;
pub use rig::Rig;
pub use sim::{SimRig, SimWorld};
pub use worker::Worker;

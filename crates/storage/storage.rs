//! Agent-local durability.
//!
//! Three documents live under an agent's data directory, all owned exclusively
//! by that agent and written with atomic replace (write temp, fsync, rename):
//!
//! - `state.json`: pose, calibration, plan/ore replicas, recall flag, metrics.
//! - `config.<quarry>.json`: the replicated quarry configuration.
//! - `journal.json`: pending side-effects awaiting verification, plus the
//!   `journal.quarantine` side file for entries that no longer parse.
//!
//! The job queue persists separately as an append-only ledger
//! (`jobs.ledger`, one JSON record per line) because its write pattern is
//! append-heavy and replay-based rather than whole-document.

pub mod error;
mod fsio;
pub mod journal;
pub mod ledger;
pub mod store;

pub use error::{JournalError, StoreError};
pub use journal::{Journal, JournalEntry, JournalOp, ResumeReport};
pub use ledger::{JobLedger, LedgerRecord, LedgerReplay};
pub use store::{AgentState, Store};

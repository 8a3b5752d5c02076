//! The pending-effect journal ("ACID-verify").
//!
//! Every non-idempotent side effect is bracketed: [`Journal::begin`] persists
//! the intent before the native action runs, [`Journal::complete`] removes it
//! after the action is known to have happened. After a crash,
//! [`Journal::resume`] replays the pending set against caller-supplied
//! verifiers that decide, by observing the world, whether each effect took
//! place. Entries that verify are dropped; the rest stay pending and block
//! progress past the unverified step.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use automine_common::types::{Direction, Face, Pose, Position, TunnelId, TunnelState};
use automine_common::utils::unix_now_ms;

use crate::error::JournalError;
use crate::fsio;

/// A journalled side effect together with everything its verifier needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalOp {
    /// Any single-cell move; the verifier checks the tracked pose reached
    /// `target`.
    MoveTo { target: Pose },
    /// Turns are idempotent given the absolute target facing.
    TurnTo { target: Direction },
    /// A clearing dig on one face; verified by re-inspecting the face.
    Dig { face: Face, pos: Position },
    /// The descent that fixes the turtle-space origin. Re-running it is safe.
    Calibrate,
    ClaimTunnel {
        tunnel: TunnelId,
    },
    ReleaseTunnel {
        tunnel: TunnelId,
        progress: u32,
        state: TunnelState,
    },
    Deposit,
    Refuel,
    /// A state-carrying broadcast; verified against the persisted bus
    /// sequence (receivers dedupe on seq, so re-sending is harmless).
    Broadcast { seq: u64 },
}

impl JournalOp {
    pub const fn kind(&self) -> &'static str {
        match self {
            JournalOp::MoveTo { .. } => "move_to",
            JournalOp::TurnTo { .. } => "turn_to",
            JournalOp::Dig { .. } => "dig",
            JournalOp::Calibrate => "calibrate",
            JournalOp::ClaimTunnel { .. } => "claim_tunnel",
            JournalOp::ReleaseTunnel { .. } => "release_tunnel",
            JournalOp::Deposit => "deposit",
            JournalOp::Refuel => "refuel",
            JournalOp::Broadcast { .. } => "broadcast",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: u64,
    pub op: JournalOp,
    pub started_at_ms: u64,
}

/// On-disk shape. Pending values are kept as raw JSON during load so a single
/// corrupt entry can be quarantined without losing the rest.
#[derive(Debug, Serialize, Deserialize, Default)]
struct JournalFile {
    next_id: u64,
    pending: BTreeMap<u64, serde_json::Value>,
}

/// Summary of a [`Journal::open`] or [`Journal::resume`] pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResumeReport {
    pub verified: usize,
    pub still_pending: usize,
}

#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    quarantine_path: PathBuf,
    next_id: u64,
    pending: BTreeMap<u64, JournalEntry>,
    /// Entries that failed to parse at open; operator attention required.
    quarantined: usize,
}

impl Journal {
    /// Load the journal, quarantining any pending entry that no longer
    /// parses. Fails only if the file itself is unreadable, which is the
    /// unrecoverable-corruption case the binary exits non-zero on.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        let quarantine_path = path.with_extension("quarantine");

        let file: JournalFile = match fsio::read_json::<JournalFile>(&path) {
            Ok(Some(file)) => file,
            Ok(None) => JournalFile::default(),
            Err(err) => {
                return Err(JournalError::Corrupt {
                    path,
                    reason: err.to_string(),
                });
            }
        };

        let mut pending = BTreeMap::new();
        let mut quarantined = 0usize;
        for (id, raw) in file.pending {
            match serde_json::from_value::<JournalEntry>(raw.clone()) {
                Ok(entry) => {
                    pending.insert(id, entry);
                }
                Err(err) => {
                    warn!(id, %err, "quarantining unparseable journal entry");
                    quarantine(&quarantine_path, id, &raw)?;
                    quarantined += 1;
                }
            }
        }

        let journal = Self {
            path,
            quarantine_path,
            next_id: file.next_id,
            pending,
            quarantined,
        };
        if quarantined > 0 {
            // The quarantined effects may or may not have happened; the world
            // must be inspected by hand before trusting this agent's state.
            warn!(
                count = quarantined,
                file = %journal.quarantine_path.display(),
                "journal entries quarantined, operator review required"
            );
            journal.persist()?;
        }
        Ok(journal)
    }

    /// Record an intent and make it durable before the native action runs.
    pub fn begin(&mut self, op: JournalOp) -> Result<u64, JournalError> {
        let id = self.next_id;
        self.next_id += 1;
        let entry = JournalEntry {
            id,
            op,
            started_at_ms: unix_now_ms(),
        };
        debug!(id, kind = entry.op.kind(), "journal begin");
        self.pending.insert(id, entry);
        self.persist()?;
        Ok(id)
    }

    /// Drop a confirmed effect.
    pub fn complete(&mut self, id: u64) -> Result<(), JournalError> {
        if self.pending.remove(&id).is_none() {
            return Err(JournalError::UnknownEntry(id));
        }
        self.persist()
    }

    /// Replay all pending entries in id order. `verify` must be a
    /// deterministic predicate: `true` means the effect is observably done
    /// (or was re-applied idempotently) and the entry is removed; `false`
    /// leaves it pending for a later attempt.
    pub fn resume(
        &mut self,
        mut verify: impl FnMut(&JournalEntry) -> bool,
    ) -> Result<ResumeReport, JournalError> {
        let ids: Vec<u64> = self.pending.keys().copied().collect();
        let mut report = ResumeReport::default();
        for id in ids {
            let Some(entry) = self.pending.get(&id) else {
                continue;
            };
            if verify(entry) {
                debug!(id, kind = entry.op.kind(), "journal entry verified");
                self.pending.remove(&id);
                report.verified += 1;
            } else {
                warn!(id, kind = entry.op.kind(), "journal entry unverified");
                report.still_pending += 1;
            }
        }
        if report.verified > 0 {
            self.persist()?;
        }
        Ok(report)
    }

    pub fn pending(&self) -> impl Iterator<Item = &JournalEntry> {
        self.pending.values()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn quarantined(&self) -> usize {
        self.quarantined
    }

    fn persist(&self) -> Result<(), JournalError> {
        let file = JournalFile {
            next_id: self.next_id,
            pending: self
                .pending
                .iter()
                .map(|(id, entry)| (*id, serde_json::to_value(entry).unwrap_or_default()))
                .collect(),
        };
        fsio::atomic_write_json(&self.path, &file).map_err(JournalError::Store)
    }
}

fn quarantine(path: &Path, id: u64, raw: &serde_json::Value) -> Result<(), JournalError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{{\"id\":{id},\"entry\":{raw}}}")?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("journal.json");
        (dir, path)
    }

    #[test]
    fn begin_then_complete_leaves_nothing_pending() {
        let (_dir, path) = scratch();
        let mut journal = Journal::open(&path).expect("open");
        let id = journal
            .begin(JournalOp::TurnTo {
                target: Direction::PosX,
            })
            .expect("begin");
        assert_eq!(journal.len(), 1);
        journal.complete(id).expect("complete");
        assert!(journal.is_empty());

        // Ids keep rising across reopen even when nothing is pending.
        let mut reopened = Journal::open(&path).expect("reopen");
        let next = reopened.begin(JournalOp::Calibrate).expect("begin");
        assert!(next > id);
    }

    #[test]
    fn pending_entries_survive_reopen() {
        let (_dir, path) = scratch();
        let mut journal = Journal::open(&path).expect("open");
        journal
            .begin(JournalOp::MoveTo {
                target: Pose::default(),
            })
            .expect("begin");

        let reopened = Journal::open(&path).expect("reopen");
        assert_eq!(reopened.len(), 1);
        let entry = reopened.pending().next().expect("entry");
        assert_eq!(entry.op.kind(), "move_to");
    }

    #[test]
    fn resume_removes_only_verified_entries() {
        let (_dir, path) = scratch();
        let mut journal = Journal::open(&path).expect("open");
        journal
            .begin(JournalOp::TurnTo {
                target: Direction::NegZ,
            })
            .expect("begin");
        journal.begin(JournalOp::Deposit).expect("begin");

        let report = journal
            .resume(|entry| matches!(entry.op, JournalOp::TurnTo { .. }))
            .expect("resume");
        assert_eq!(
            report,
            ResumeReport {
                verified: 1,
                still_pending: 1
            }
        );
        assert_eq!(journal.len(), 1);

        // Resume is idempotent: a second pass over the same crash-consistent
        // state verifies nothing new and keeps the same pending set.
        let again = journal
            .resume(|entry| matches!(entry.op, JournalOp::TurnTo { .. }))
            .expect("resume");
        assert_eq!(
            again,
            ResumeReport {
                verified: 0,
                still_pending: 1
            }
        );
    }

    #[test]
    fn corrupt_entry_is_quarantined_not_fatal() {
        let (_dir, path) = scratch();
        {
            let mut journal = Journal::open(&path).expect("open");
            journal.begin(JournalOp::Refuel).expect("begin");
        }

        // Hand-mangle one pending entry while keeping the document valid JSON.
        let text = std::fs::read_to_string(&path).expect("read");
        let mangled = text.replace("\"refuel\"", "\"no_such_kind\"");
        std::fs::write(&path, mangled).expect("write");

        let journal = Journal::open(&path).expect("open survives");
        assert_eq!(journal.quarantined(), 1);
        assert!(journal.is_empty());
        assert!(path.with_extension("quarantine").exists());
    }

    #[test]
    fn garbage_file_is_unrecoverable() {
        let (_dir, path) = scratch();
        std::fs::write(&path, b"not json at all").expect("write");
        assert!(matches!(
            Journal::open(&path),
            Err(JournalError::Corrupt { .. })
        ));
    }
}

//! Append-only job ledger.
//!
//! The live queue is an in-memory heap; what hits disk is the history of
//! queue events, one JSON record per line, fsynced per append. Replay folds
//! the history into the latest status per job id, which tolerates a torn
//! final line from a crash mid-append (the event it described had not
//! happened yet by definition).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use automine_common::types::{Job, JobId, JobStatus};

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerRecord {
    Enqueued { job: Job },
    Claimed { id: JobId },
    /// A failed attempt going back to the tail of the queue.
    Requeued {
        id: JobId,
        attempts: u32,
        created_seq: u64,
    },
    Completed { id: JobId },
    Failed { id: JobId },
}

/// The queue state reconstructed from the ledger.
#[derive(Debug, Default)]
pub struct LedgerReplay {
    /// Jobs whose latest status is `Queued`, in enqueue order.
    pub queued: Vec<Job>,
    /// The job that was claimed when the agent stopped, if any.
    pub active: Option<Job>,
    /// One past the highest `created_seq` ever appended.
    pub next_seq: u64,
    /// One past the highest job id ever appended.
    pub next_id: u64,
}

#[derive(Debug)]
pub struct JobLedger {
    path: PathBuf,
    file: File,
}

impl JobLedger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and make it durable before returning.
    pub fn append(&mut self, record: &LedgerRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        writeln!(self.file, "{line}")?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Fold the on-disk history into the current queue state.
    pub fn replay(&self) -> Result<LedgerReplay, StoreError> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);

        let mut jobs: BTreeMap<JobId, Job> = BTreeMap::new();
        let mut order: Vec<JobId> = Vec::new();
        let mut next_seq = 0u64;
        let mut next_id = 0u64;

        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
        let last_line = lines.len().saturating_sub(1);
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: LedgerRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(err) if index == last_line => {
                    // Torn tail from a crash mid-append; the event never
                    // became durable, so dropping it is the correct fold.
                    warn!(%err, "ignoring torn final ledger line");
                    continue;
                }
                Err(err) => {
                    return Err(StoreError::CorruptLedger {
                        path: self.path.clone(),
                        line: index + 1,
                        reason: err.to_string(),
                    });
                }
            };
            match record {
                LedgerRecord::Enqueued { job } => {
                    next_seq = next_seq.max(job.created_seq + 1);
                    next_id = next_id.max(job.id.0 + 1);
                    order.push(job.id);
                    jobs.insert(job.id, job);
                }
                LedgerRecord::Claimed { id } => {
                    if let Some(job) = jobs.get_mut(&id) {
                        job.status = JobStatus::Claimed;
                    }
                }
                LedgerRecord::Requeued {
                    id,
                    attempts,
                    created_seq,
                } => {
                    next_seq = next_seq.max(created_seq + 1);
                    if let Some(job) = jobs.get_mut(&id) {
                        job.status = JobStatus::Queued;
                        job.attempts = attempts;
                        job.created_seq = created_seq;
                    }
                }
                LedgerRecord::Completed { id } | LedgerRecord::Failed { id } => {
                    jobs.remove(&id);
                }
            }
        }

        let mut replay = LedgerReplay {
            next_seq,
            next_id,
            ..Default::default()
        };
        for id in order {
            let Some(job) = jobs.get(&id) else { continue };
            match job.status {
                JobStatus::Queued => replay.queued.push(job.clone()),
                // At most one job is ever claimed at a time, so a later
                // Claimed record simply overwrites an impossible earlier one.
                JobStatus::Claimed => replay.active = Some(job.clone()),
                JobStatus::Completed | JobStatus::Failed => {}
            }
        }
        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automine_common::types::JobPayload;

    fn ledger() -> (tempfile::TempDir, JobLedger) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = JobLedger::open(dir.path().join("jobs.ledger")).expect("open");
        (dir, ledger)
    }

    fn job(id: u64, seq: u64, payload: JobPayload) -> Job {
        Job::new(JobId(id), seq, payload)
    }

    #[test]
    fn replay_reconstructs_latest_status_per_id() {
        let (_dir, mut ledger) = ledger();
        ledger
            .append(&LedgerRecord::Enqueued {
                job: job(0, 0, JobPayload::Refuel),
            })
            .expect("append");
        ledger
            .append(&LedgerRecord::Enqueued {
                job: job(1, 1, JobPayload::Recall),
            })
            .expect("append");
        ledger
            .append(&LedgerRecord::Claimed { id: JobId(0) })
            .expect("append");
        ledger
            .append(&LedgerRecord::Completed { id: JobId(0) })
            .expect("append");

        let replay = ledger.replay().expect("replay");
        assert_eq!(replay.queued.len(), 1);
        assert_eq!(replay.queued[0].id, JobId(1));
        assert!(replay.active.is_none());
        assert_eq!(replay.next_seq, 2);
        assert_eq!(replay.next_id, 2);
    }

    #[test]
    fn claimed_job_survives_as_active() {
        let (_dir, mut ledger) = ledger();
        ledger
            .append(&LedgerRecord::Enqueued {
                job: job(0, 0, JobPayload::Refuel),
            })
            .expect("append");
        ledger
            .append(&LedgerRecord::Claimed { id: JobId(0) })
            .expect("append");

        let replay = ledger.replay().expect("replay");
        assert!(replay.queued.is_empty());
        assert_eq!(replay.active.expect("active").id, JobId(0));
    }

    #[test]
    fn requeue_updates_attempts_and_order_key() {
        let (_dir, mut ledger) = ledger();
        ledger
            .append(&LedgerRecord::Enqueued {
                job: job(0, 0, JobPayload::Refuel),
            })
            .expect("append");
        ledger
            .append(&LedgerRecord::Claimed { id: JobId(0) })
            .expect("append");
        ledger
            .append(&LedgerRecord::Requeued {
                id: JobId(0),
                attempts: 1,
                created_seq: 5,
            })
            .expect("append");

        let replay = ledger.replay().expect("replay");
        assert_eq!(replay.queued.len(), 1);
        assert_eq!(replay.queued[0].attempts, 1);
        assert_eq!(replay.queued[0].created_seq, 5);
        assert_eq!(replay.next_seq, 6);
    }

    #[test]
    fn torn_tail_line_is_ignored() {
        let (_dir, mut ledger) = ledger();
        ledger
            .append(&LedgerRecord::Enqueued {
                job: job(0, 0, JobPayload::Refuel),
            })
            .expect("append");

        // Simulate a crash mid-append of the next record.
        use std::io::Write as _;
        let mut raw = OpenOptions::new()
            .append(true)
            .open(ledger.path())
            .expect("open raw");
        write!(raw, "{{\"event\":\"claimed\",\"id\"").expect("tear");
        drop(raw);

        let replay = ledger.replay().expect("replay tolerates tear");
        assert_eq!(replay.queued.len(), 1);
    }

    #[test]
    fn mid_file_corruption_is_an_error() {
        let (_dir, mut ledger) = ledger();
        {
            use std::io::Write as _;
            let mut raw = OpenOptions::new()
                .append(true)
                .open(ledger.path())
                .expect("open raw");
            writeln!(raw, "garbage").expect("garbage");
        }
        ledger
            .append(&LedgerRecord::Enqueued {
                job: job(0, 0, JobPayload::Refuel),
            })
            .expect("append");

        assert!(matches!(
            ledger.replay(),
            Err(StoreError::CorruptLedger { line: 1, .. })
        ));
    }
}

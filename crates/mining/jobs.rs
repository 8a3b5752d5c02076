//! The per-agent priority job queue.
//!
//! Ledger-backed: every transition appends one durable record, and reopening
//! the queue replays the ledger into the same live state. The in-memory side
//! is a sorted set keyed `(priority, created_seq, id)` so pops are
//! deterministic: highest priority first, FIFO within a priority.

use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

use automine_common::types::{Job, JobId, JobKind, JobPayload, JobStatus};
use automine_storage::{JobLedger, LedgerRecord, StoreError};

/// What happened to the active job on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Requeued,
    Dropped,
}

#[derive(Debug)]
pub struct JobQueue {
    ledger: JobLedger,
    order: BTreeSet<(u8, u64, JobId)>,
    jobs: FxHashMap<JobId, Job>,
    active: Option<Job>,
    next_id: u64,
    next_seq: u64,
}

impl JobQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let ledger = JobLedger::open(path.as_ref())?;
        let replay = ledger.replay()?;

        let mut queue = Self {
            ledger,
            order: BTreeSet::new(),
            jobs: FxHashMap::default(),
            active: replay.active,
            next_id: replay.next_id,
            next_seq: replay.next_seq,
        };
        for job in replay.queued {
            queue.order.insert((job.priority(), job.created_seq, job.id));
            queue.jobs.insert(job.id, job);
        }
        if queue.active.is_some() || !queue.jobs.is_empty() {
            info!(
                queued = queue.jobs.len(),
                resumed_active = queue.active.is_some(),
                "job queue restored from ledger"
            );
        }
        Ok(queue)
    }

    /// Enqueue new work. System jobs (recall, refuel) are idempotent: if one
    /// is already live the call is a durable no-op and returns `None`.
    pub fn enqueue(&mut self, payload: JobPayload) -> Result<Option<JobId>, StoreError> {
        let kind = payload.kind();
        if kind.is_system() && self.has_kind(kind) {
            return Ok(None);
        }
        let job = Job::new(JobId(self.next_id), self.next_seq, payload);
        self.next_id += 1;
        self.next_seq += 1;
        self.ledger
            .append(&LedgerRecord::Enqueued { job: job.clone() })?;
        debug!(id = %job.id, kind = %job.kind(), "job enqueued");
        self.order.insert((job.priority(), job.created_seq, job.id));
        self.jobs.insert(job.id, job.clone());
        Ok(Some(job.id))
    }

    pub fn has_kind(&self, kind: JobKind) -> bool {
        self.active.as_ref().is_some_and(|job| job.kind() == kind)
            || self.jobs.values().any(|job| job.kind() == kind)
    }

    /// A queued (not active) job matching the predicate.
    pub fn find_queued(&self, mut pred: impl FnMut(&Job) -> bool) -> Option<&Job> {
        self.order
            .iter()
            .map(|(_, _, id)| &self.jobs[id])
            .find(|job| pred(job))
    }

    pub fn peek(&self) -> Option<&Job> {
        self.order.first().map(|(_, _, id)| &self.jobs[id])
    }

    /// Claim the highest-priority queued job. Durable before it returns.
    pub fn claim_next(&mut self) -> Result<Option<Job>, StoreError> {
        debug_assert!(self.active.is_none(), "claim with a job still active");
        let Some((_, _, id)) = self.order.pop_first() else {
            return Ok(None);
        };
        let Some(mut job) = self.jobs.remove(&id) else {
            return Ok(None);
        };
        self.ledger.append(&LedgerRecord::Claimed { id })?;
        job.status = JobStatus::Claimed;
        debug!(id = %job.id, kind = %job.kind(), "job claimed");
        self.active = Some(job.clone());
        Ok(Some(job))
    }

    pub fn active(&self) -> Option<&Job> {
        self.active.as_ref()
    }

    pub fn complete_active(&mut self) -> Result<Option<Job>, StoreError> {
        let Some(job) = self.active.take() else {
            return Ok(None);
        };
        self.ledger.append(&LedgerRecord::Completed { id: job.id })?;
        debug!(id = %job.id, kind = %job.kind(), "job completed");
        Ok(Some(job))
    }

    /// Fail the active job: requeue at the tail of its priority class with
    /// `attempts` bumped, or drop it once the failure budget is spent.
    pub fn fail_active(
        &mut self,
        requeue: bool,
        max_failures: u32,
    ) -> Result<Option<FailOutcome>, StoreError> {
        let Some(mut job) = self.active.take() else {
            return Ok(None);
        };
        job.attempts += 1;
        if requeue && job.attempts < max_failures {
            job.created_seq = self.next_seq;
            self.next_seq += 1;
            self.ledger.append(&LedgerRecord::Requeued {
                id: job.id,
                attempts: job.attempts,
                created_seq: job.created_seq,
            })?;
            job.status = JobStatus::Queued;
            debug!(id = %job.id, attempts = job.attempts, "job requeued");
            self.order.insert((job.priority(), job.created_seq, job.id));
            self.jobs.insert(job.id, job);
            Ok(Some(FailOutcome::Requeued))
        } else {
            self.ledger.append(&LedgerRecord::Failed { id: job.id })?;
            info!(id = %job.id, kind = %job.kind(), attempts = job.attempts, "job dropped");
            Ok(Some(FailOutcome::Dropped))
        }
    }

    /// Put the active job back without charging an attempt: used when a
    /// higher-priority job pre-empts it or fuel accounting defers it.
    pub fn defer_active(&mut self) -> Result<Option<JobId>, StoreError> {
        let Some(mut job) = self.active.take() else {
            return Ok(None);
        };
        job.created_seq = self.next_seq;
        self.next_seq += 1;
        self.ledger.append(&LedgerRecord::Requeued {
            id: job.id,
            attempts: job.attempts,
            created_seq: job.created_seq,
        })?;
        job.status = JobStatus::Queued;
        debug!(id = %job.id, kind = %job.kind(), "job deferred");
        let id = job.id;
        self.order.insert((job.priority(), job.created_seq, job.id));
        self.jobs.insert(job.id, job);
        Ok(Some(id))
    }

    /// Remove a queued job that a peer's work made moot.
    pub fn drop_queued(&mut self, id: JobId) -> Result<bool, StoreError> {
        let Some(job) = self.jobs.remove(&id) else {
            return Ok(false);
        };
        self.order.remove(&(job.priority(), job.created_seq, job.id));
        self.ledger.append(&LedgerRecord::Completed { id })?;
        debug!(%id, "queued job dropped (done elsewhere)");
        Ok(true)
    }

    pub fn queued_len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.jobs.is_empty()
    }

    /// The queue-priority invariant: the active job outranks (or ties)
    /// everything still queued.
    pub fn priority_invariant_holds(&self) -> bool {
        match (&self.active, self.peek()) {
            (Some(active), Some(best)) => active.priority() <= best.priority(),
            _ => true,
        }
    }
}

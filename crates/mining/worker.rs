//! The per-agent worker service.
//!
//! One GenServer per agent, handling everything serially: bus deliveries,
//! the self-scheduled tick, heartbeats, and liveness sweeps. Each tick runs
//! at most one bounded step of the active job, and every state mutation is
//! durable before the next step. Fleet control is masterless: whoever
//! currently has the smallest live id acts as leader for tunnel mutex
//! transitions, and everyone else replicates.

use futures::StreamExt;
use rustc_hash::FxHashSet;
use spawned_concurrency::tasks::{
    CallResponse, CastResponse, GenServer, GenServerHandle, InitResult::Success, send_after,
    send_interval, send_message_on, spawn_listener,
};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use automine_bus::{Bus, Envelope, Membership, Message, PeerRecord, SeqFilter};
use automine_common::types::{
    AgentId, Direction, Face, JobKind, JobPayload, Metrics, OreObservation, OreStatus, Pose,
    Position, QuarryConfig, Tunnel, TunnelId, TunnelState,
};
use automine_storage::{AgentState, Journal, JournalOp, Store};

use crate::calibration;
use crate::error::{StepError, WorkerError};
use crate::fuel;
use crate::jobs::{FailOutcome, JobQueue};
use crate::movement::Movement;
use crate::navigator::{self, HOMEBOUND, OUTBOUND};
use crate::ore::{self, VeinProgress, VeinRun};
use crate::plan;
use crate::recovery;
use crate::rig::Rig;

/// Cooldown between `job_request` messages to the leader.
const JOB_REQUEST_COOLDOWN: Duration = Duration::from_secs(3);
/// Unanswered `job_request`s tolerated before the leader is flagged as
/// unreachable in this agent's status.
const MAX_UNANSWERED_REQUESTS: u32 = 5;
/// Base/cap for the waiting-for-fuel backoff.
const FUEL_WAIT_BASE: Duration = Duration::from_millis(500);
const FUEL_WAIT_CAP: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub enum CallMessage {
    /// Observability hook for operators and tests.
    Snapshot,
}

#[derive(Clone)]
pub enum InMessage {
    Tick,
    Heartbeat,
    /// Periodic liveness sweep; also the leader's dead-claim reclaim pass.
    Sweep,
    Delivery(Box<Envelope>),
    Shutdown,
}

#[derive(Clone, Debug)]
pub enum OutMessage {
    Snapshot(Box<WorkerSnapshot>),
}

/// Point-in-time view of one agent, served over a call.
#[derive(Clone, Debug)]
pub struct WorkerSnapshot {
    pub agent_id: AgentId,
    pub pose: Pose,
    pub calibrated: bool,
    pub leader: AgentId,
    pub is_leader: bool,
    pub status: String,
    pub active: Option<JobKind>,
    pub queued: usize,
    pub recall_active: bool,
    pub config_version: u64,
    pub fuel: u32,
    pub tunnels: Vec<Tunnel>,
    pub ore: Vec<OreObservation>,
    /// Live peers with their last-reported status, job, and fuel.
    pub fleet: Vec<(AgentId, PeerRecord)>,
    pub metrics: Metrics,
}

/// Runtime of the active job; rebuilt from the persisted job on restart.
enum JobRun {
    Tunnel(TunnelRun),
    Ore(VeinRun),
    Refuel,
    Recall(RecallPhase),
}

struct TunnelRun {
    tunnel: Tunnel,
}

enum RecallPhase {
    Deposit,
    Home,
    Climb,
    Parked,
}

enum RunOutcome {
    Continue,
    Done,
    /// Parked or waiting on the world; the job stays active but idle.
    Waiting,
}

pub struct Worker<R: Rig> {
    store: Store,
    config: QuarryConfig,
    state: AgentState,
    journal: Journal,
    queue: JobQueue,
    bus: Bus,
    filter: SeqFilter,
    membership: Membership,
    rig: R,
    tick_interval: Duration,
    /// When this process came up. A joining agent listens for one heartbeat
    /// window before acting on self-election, so a fleet with an established
    /// leader is never briefly second-guessed by a rebooting member.
    booted_at: Instant,
    run: Option<JobRun>,
    status: String,
    config_synced: bool,
    unverified: usize,
    last_job_request: Option<Instant>,
    /// Consecutive `job_request`s the leader never answered.
    unanswered_requests: u32,
    fuel_hold_until: Option<Instant>,
    fuel_backoff: crate::backoff::Backoff,
    home_acks: FxHashSet<AgentId>,
    sent_home_ack: bool,
}

impl<R: Rig> Worker<R> {
    /// Bring one agent up: restore state, replay the journal, calibrate, and
    /// start the service. The caller owns process exit codes: a
    /// `WorkerError::Journal` here is the unrecoverable-corruption case.
    pub async fn spawn(
        store: Store,
        config: QuarryConfig,
        mut bus: Bus,
        mut rig: R,
        tick_interval: Duration,
    ) -> Result<GenServerHandle<Worker<R>>, WorkerError> {
        config.validate()?;
        let agent_id = bus.local();

        let mut state = match store.load_state()? {
            Some(mut state) => {
                state.agent_id = agent_id;
                state
            }
            None => AgentState::new(agent_id),
        };
        let mut journal = Journal::open(store.journal_path())?;
        if journal.quarantined() > 0 {
            // Startable, but the quarantined effects may or may not have
            // happened; someone has to look at the side file and the world.
            warn!(
                quarantined = journal.quarantined(),
                "journal entries quarantined at boot, operator review required"
            );
        }
        let mut queue = JobQueue::open(store.ledger_path())?;

        if state.tunnels.is_empty() {
            state.tunnels = plan::enumerate(&config);
            info!(tunnels = state.tunnels.len(), "tunnel plan enumerated");
        }

        calibration::calibrate(&mut rig, &mut journal, &store, &mut state, &config)
            .await
            .map_err(WorkerError::Calibration)?;

        let recovered = recovery::recover(&mut journal, &store, &mut state, &mut rig)
            .map_err(|err| match err {
                StepError::Journal(e) => WorkerError::Journal(e),
                StepError::Store(e) => WorkerError::Store(e),
                other => WorkerError::Calibration(other),
            })?;
        for (tunnel, progress, tunnel_state) in recovered.resend_releases {
            let _ = bus
                .broadcast(Message::JobRelease {
                    tunnel,
                    progress,
                    state: tunnel_state,
                })
                .await
                .inspect_err(|err| warn!(%err, "failed to re-send release"));
        }

        // Any tunnel we still hold must have a job driving it.
        let held: Vec<Tunnel> = state
            .tunnels
            .iter()
            .filter(|t| t.claimed_by == Some(agent_id) && !matches!(t.state, TunnelState::Done))
            .cloned()
            .collect();
        for tunnel in held {
            let id = tunnel.id;
            let has_job = queue
                .active()
                .is_some_and(|job| job.payload.tunnel_id() == Some(id))
                || queue
                    .find_queued(|job| job.payload.tunnel_id() == Some(id))
                    .is_some();
            if !has_job {
                queue.enqueue(JobPayload::TunnelMine { tunnel })?;
            }
        }

        // The caller seeds the bus past the persisted counter (see
        // [`automine_bus::RESTART_SEQ_SKIP`]); record where it landed.
        state.bus_seq = state.bus_seq.max(bus.seq());
        store.save_state(&state)?;

        let membership = Membership::new(
            agent_id,
            Duration::from_millis(config.heartbeat_timeout_ms),
        );
        let filter = SeqFilter::new(agent_id, config.quarry_id.clone());

        info!(
            agent = %agent_id,
            quarry = %config.quarry_id,
            unverified = recovered.still_pending,
            "worker up"
        );
        let worker = Self {
            store,
            config,
            state,
            journal,
            queue,
            bus,
            filter,
            membership,
            rig,
            tick_interval,
            booted_at: Instant::now(),
            run: None,
            status: "idle".to_string(),
            config_synced: true,
            unverified: recovered.still_pending,
            last_job_request: None,
            unanswered_requests: 0,
            fuel_hold_until: None,
            fuel_backoff: crate::backoff::Backoff::new(FUEL_WAIT_BASE, FUEL_WAIT_CAP),
            home_acks: FxHashSet::default(),
            sent_home_ack: false,
        };
        Ok(worker.start())
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            agent_id: self.state.agent_id,
            pose: self.state.pose,
            calibrated: self.state.calibrated,
            leader: self.membership.leader(),
            is_leader: self.membership.is_leader(),
            status: self.status.clone(),
            active: self.queue.active().map(|job| job.kind()),
            queued: self.queue.queued_len(),
            recall_active: self.state.recall_active,
            config_version: self.config.config_version,
            fuel: self.rig.fuel_level(),
            tunnels: self.state.tunnels.clone(),
            ore: self.state.ore.clone(),
            fleet: self.membership.live_view(),
            metrics: self.state.metrics,
        }
    }

    fn movement(&mut self) -> Movement<'_, R> {
        Movement::new(
            &mut self.rig,
            &mut self.journal,
            &self.store,
            &mut self.state,
            &self.config,
        )
    }

    // ---- bus handling -----------------------------------------------------

    async fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), StepError> {
        let sender = envelope.sender;
        debug!(from = %sender, msg = %envelope.message, "bus delivery");
        match envelope.message {
            Message::Heartbeat {
                status,
                job,
                fuel,
                config_version,
            } => {
                let leader_changed =
                    self.membership
                        .observe_heartbeat(sender, status, job, fuel, config_version);
                if self.state.peers.insert(sender) {
                    self.store.save_state(&self.state)?;
                }
                if config_version > self.config.config_version {
                    self.config_synced = false;
                    let _ = self.bus.send_to(sender, Message::ConfigRequest).await;
                } else if config_version < self.config.config_version {
                    let config = self.config.clone();
                    let _ = self
                        .bus
                        .send_to(sender, Message::ConfigResponse { config })
                        .await;
                }
                if leader_changed {
                    self.on_leadership_change();
                }
            }
            Message::ConfigRequest => {
                let config = self.config.clone();
                let _ = self
                    .bus
                    .send_to(sender, Message::ConfigResponse { config })
                    .await;
            }
            Message::ConfigResponse { config } | Message::ConfigUpdate { config } => {
                self.adopt_config(config)?;
            }
            Message::JobRequest => {
                if self.membership.is_leader() {
                    self.assign_tunnel_to(sender).await?;
                }
            }
            Message::Assign { tunnel } => {
                if tunnel.claimed_by == Some(self.state.agent_id) {
                    self.accept_assignment(tunnel)?;
                }
            }
            Message::JobRelease {
                tunnel,
                progress,
                state,
            } => {
                plan::apply_release(&mut self.state.tunnels, tunnel, progress, state, sender);
                self.store.save_state(&self.state)?;
            }
            Message::OreFound { observation } => {
                self.observe_peer_ore(sender, observation)?;
            }
            Message::OreMined { block, mined } => {
                ore::promote_mined(&mut self.state.ore, &block, &mined);
                self.drop_moot_ore_jobs(&block, &mined)?;
                self.store.save_state(&self.state)?;
            }
            Message::Recall { active } => {
                self.apply_recall(active)?;
            }
            Message::HomeAck => {
                self.home_acks.insert(sender);
                if self.membership.is_leader() {
                    let live = self.membership.live_members();
                    let all_home = live
                        .iter()
                        .filter(|id| **id != self.state.agent_id)
                        .all(|id| self.home_acks.contains(id));
                    if all_home {
                        info!(agents = live.len(), "fleet is parked on the spawn column");
                    }
                }
            }
        }
        Ok(())
    }

    fn on_leadership_change(&mut self) {
        if self.membership.is_leader() {
            info!(agent = %self.state.agent_id, "acting as leader");
            let live = self.membership.live_members();
            let released = plan::release_dead_claims(&mut self.state.tunnels, &live);
            if !released.is_empty() {
                let _ = self
                    .store
                    .save_state(&self.state)
                    .inspect_err(|err| error!(%err, "failed to persist reclaimed tunnels"));
            }
        }
    }

    async fn assign_tunnel_to(&mut self, requester: AgentId) -> Result<(), StepError> {
        let Some(tunnel) = plan::claim_first_idle(&mut self.state.tunnels, requester) else {
            debug!(%requester, "no idle tunnel to assign");
            return Ok(());
        };
        // Persist the transition before the assignment leaves this agent;
        // the claim must survive a leader crash.
        self.store.save_state(&self.state)?;
        let _ = self
            .bus
            .send_to(requester, Message::Assign { tunnel })
            .await
            .inspect_err(|err| warn!(%err, %requester, "failed to send assignment"));
        Ok(())
    }

    fn accept_assignment(&mut self, tunnel: Tunnel) -> Result<(), StepError> {
        info!(tunnel = %tunnel.id, "assignment accepted");
        self.unanswered_requests = 0;
        plan::adopt_assignment(&mut self.state.tunnels, &tunnel);
        let id = self.journal.begin(JournalOp::ClaimTunnel { tunnel: tunnel.id })?;
        self.store.save_state(&self.state)?;
        self.queue.enqueue(JobPayload::TunnelMine { tunnel })?;
        self.journal.complete(id)?;
        Ok(())
    }

    fn observe_peer_ore(
        &mut self,
        sender: AgentId,
        observation: OreObservation,
    ) -> Result<(), StepError> {
        let fresh = ore::record(&mut self.state.ore, observation.clone());
        if fresh {
            self.store.save_state(&self.state)?;
            return Ok(());
        }
        // Both of us spotted it. The lower id keeps its job; the other
        // drops the duplicate so exactly one flood-fill runs.
        if sender < self.state.agent_id {
            let duplicate = self
                .queue
                .find_queued(|job| match &job.payload {
                    JobPayload::OreMine { observation: ours } => {
                        ours.key() == observation.key()
                    }
                    _ => false,
                })
                .map(|job| job.id);
            if let Some(id) = duplicate {
                info!(%sender, pos = %observation.pos, "yielding duplicate ore job");
                self.queue.drop_queued(id)?;
            }
        }
        Ok(())
    }

    fn drop_moot_ore_jobs(
        &mut self,
        block: &str,
        mined: &[Position],
    ) -> Result<(), StepError> {
        loop {
            let moot = self
                .queue
                .find_queued(|job| match &job.payload {
                    JobPayload::OreMine { observation } => {
                        observation.block == block && mined.contains(&observation.pos)
                    }
                    _ => false,
                })
                .map(|job| job.id);
            match moot {
                Some(id) => {
                    self.queue.drop_queued(id)?;
                }
                None => return Ok(()),
            }
        }
    }

    fn adopt_config(&mut self, config: QuarryConfig) -> Result<(), StepError> {
        if config.config_version <= self.config.config_version {
            self.config_synced = true;
            return Ok(());
        }
        if let Err(err) = config.validate() {
            warn!(%err, version = config.config_version, "rejecting invalid config update");
            return Ok(());
        }
        info!(
            old = self.config.config_version,
            new = config.config_version,
            "adopting configuration"
        );
        self.store.save_config(&config)?;
        self.state.tunnels = plan::merge_after_config_change(&self.state.tunnels, &config);
        self.config = config;
        self.config_synced = true;

        // Pose re-validation: outside the new box, nothing destructive may
        // run until the agent is back at spawn. Raising the recall flag (not
        // just a job) keeps the standard clear path working: a later
        // `recall{active=false}` releases the parked agent.
        if self.state.calibrated && !self.config.bounds.contains(self.state.pose.pos) {
            warn!(pose = %self.state.pose, "pose outside new bounding box, recalling");
            self.apply_recall(true)?;
        }
        self.store.save_state(&self.state)?;
        Ok(())
    }

    fn apply_recall(&mut self, active: bool) -> Result<(), StepError> {
        if self.state.recall_active == active {
            return Ok(());
        }
        info!(active, "recall signal");
        self.state.recall_active = active;
        self.store.save_state(&self.state)?;
        if active {
            self.queue.enqueue(JobPayload::Recall)?;
        } else {
            self.sent_home_ack = false;
            self.home_acks.clear();
            if self
                .queue
                .active()
                .is_some_and(|job| job.kind() == JobKind::Recall)
            {
                self.queue.complete_active()?;
                self.state.metrics.jobs_completed += 1;
                self.run = None;
            }
            let queued_recall = self
                .queue
                .find_queued(|job| job.kind() == JobKind::Recall)
                .map(|job| job.id);
            if let Some(id) = queued_recall {
                self.queue.drop_queued(id)?;
            }
            self.status = "idle".to_string();
        }
        Ok(())
    }

    // ---- the tick ---------------------------------------------------------

    async fn run_tick(&mut self) -> Result<(), StepError> {
        if self.unverified > 0 {
            // Keep retrying the replay; the obstruction may have cleared.
            let recovered = recovery::recover(
                &mut self.journal,
                &self.store,
                &mut self.state,
                &mut self.rig,
            )?;
            for (tunnel, progress, tunnel_state) in recovered.resend_releases {
                let _ = self
                    .bus
                    .broadcast(Message::JobRelease {
                        tunnel,
                        progress,
                        state: tunnel_state,
                    })
                    .await;
            }
            self.unverified = recovered.still_pending;
            if self.unverified > 0 {
                self.status = "error:unverified".to_string();
                return Err(StepError::Unverified(self.unverified));
            }
        }

        if !self.config_synced {
            // The peer that advertised the newer version may have died
            // before answering; if no live peer still outversions us, the
            // drift is moot.
            if self.membership.max_config_version() <= self.config.config_version {
                self.config_synced = true;
            } else {
                self.status = "config_drift".to_string();
                return Ok(());
            }
        }

        self.enqueue_system_jobs()?;
        self.preempt_if_outranked()?;

        if self.queue.active().is_none() {
            self.try_claim().await?;
        }
        if self.queue.active().is_none() {
            self.try_acquire_tunnel().await?;
        }

        if self.queue.active().is_some() {
            if self.run.is_none() {
                self.build_run()?;
            }
            self.step_active().await?;
        } else if self.run.is_none() {
            self.status = "idle".to_string();
        }
        Ok(())
    }

    fn enqueue_system_jobs(&mut self) -> Result<(), StepError> {
        if self.state.recall_active && !self.queue.has_kind(JobKind::Recall) {
            self.queue.enqueue(JobPayload::Recall)?;
        }
        let fuel_held = self
            .fuel_hold_until
            .is_some_and(|until| Instant::now() < until);
        if !self.state.recall_active
            && !fuel_held
            && self.rig.fuel_level() < self.config.fuel_reserve
            && !self.queue.has_kind(JobKind::Refuel)
        {
            debug!(fuel = self.rig.fuel_level(), "fuel below reserve, queueing refuel");
            self.queue.enqueue(JobPayload::Refuel)?;
        }
        Ok(())
    }

    /// Restore the queue-priority invariant: a queued job that outranks the
    /// active one pre-empts it at the next step boundary.
    fn preempt_if_outranked(&mut self) -> Result<(), StepError> {
        let outranked = match (self.queue.active(), self.queue.peek()) {
            (Some(active), Some(best)) => best.priority() < active.priority(),
            _ => false,
        };
        if outranked {
            debug!("active job pre-empted by higher-priority work");
            self.queue.defer_active()?;
            self.run = None;
        }
        Ok(())
    }

    /// Claim the best queued job, with worst-case fuel accounting gating
    /// everything except recall and refuel themselves.
    async fn try_claim(&mut self) -> Result<(), StepError> {
        let Some(best) = self.queue.peek() else {
            return Ok(());
        };
        let needs_accounting = !matches!(best.kind(), JobKind::Recall | JobKind::Refuel);
        if needs_accounting
            && !fuel::claimable(
                &best.payload,
                self.state.pose.pos,
                self.rig.fuel_level(),
                &self.config,
            )
        {
            debug!(
                fuel = self.rig.fuel_level(),
                kind = %best.kind(),
                "insufficient fuel for next job, escalating refuel"
            );
            // The refuel outranks the job it displaces, so the claim below
            // picks it up instead.
            self.queue.enqueue(JobPayload::Refuel)?;
        }
        self.queue.claim_next()?;
        Ok(())
    }

    /// With an empty queue, go get tunnel work: the leader claims directly,
    /// followers ask the leader (with a cooldown).
    async fn try_acquire_tunnel(&mut self) -> Result<(), StepError> {
        if !self.queue.is_idle() || self.state.recall_active || self.unverified > 0 {
            return Ok(());
        }
        // Observation window: until one heartbeat timeout has passed, a
        // self-elected view may simply not have heard the real leader yet.
        let observing = self.booted_at.elapsed()
            < Duration::from_millis(self.config.heartbeat_timeout_ms)
            && self.membership.live_members().len() == 1;
        if observing {
            return Ok(());
        }
        if self.membership.is_leader() {
            let me = self.state.agent_id;
            if let Some(tunnel) = plan::claim_first_idle(&mut self.state.tunnels, me) {
                let id = self
                    .journal
                    .begin(JournalOp::ClaimTunnel { tunnel: tunnel.id })?;
                self.store.save_state(&self.state)?;
                self.queue.enqueue(JobPayload::TunnelMine { tunnel })?;
                self.journal.complete(id)?;
            }
            return Ok(());
        }
        let cooled_down = self
            .last_job_request
            .is_none_or(|at| at.elapsed() >= JOB_REQUEST_COOLDOWN);
        if cooled_down {
            self.last_job_request = Some(Instant::now());
            let leader = self.membership.leader();
            self.unanswered_requests += 1;
            if self.unanswered_requests > MAX_UNANSWERED_REQUESTS {
                // The plan may simply be exhausted, but a mute leader is
                // worth flagging to the fleet either way.
                let err = StepError::PeerUnreachable(leader);
                warn!(%err, requests = self.unanswered_requests, "leader not answering");
                self.status = err.status_label().to_string();
            }
            let _ = self
                .bus
                .send_to(leader, Message::JobRequest)
                .await
                .inspect_err(|err| warn!(%err, %leader, "job request failed"));
        }
        Ok(())
    }

    fn build_run(&mut self) -> Result<(), StepError> {
        let Some(job) = self.queue.active().cloned() else {
            return Ok(());
        };
        self.run = match job.payload {
            JobPayload::Recall => Some(JobRun::Recall(RecallPhase::Deposit)),
            JobPayload::Refuel => Some(JobRun::Refuel),
            JobPayload::OreMine { observation } => {
                // A peer may have consumed the vein while this job queued.
                let already_mined = ore::get(&self.state.ore, observation.pos, &observation.block)
                    .is_some_and(|obs| obs.status == OreStatus::Mined);
                if already_mined {
                    self.queue.complete_active()?;
                    self.state.metrics.jobs_completed += 1;
                    None
                } else {
                    Some(JobRun::Ore(VeinRun::new(&observation)))
                }
            }
            JobPayload::TunnelMine { tunnel } => {
                // Progress lives in the replica; the payload may be stale
                // after a restart or a deferred resume.
                let live = plan::find(&self.state.tunnels, tunnel.id)
                    .cloned()
                    .unwrap_or(tunnel);
                if live.claimed_by != Some(self.state.agent_id) {
                    // Reconciliation handed this corridor to someone else
                    // while the job sat queued.
                    info!(tunnel = %live.id, "claim lost to reconciliation, dropping job");
                    self.queue.fail_active(false, self.config.max_job_failures)?;
                    None
                } else {
                    Some(JobRun::Tunnel(TunnelRun { tunnel: live }))
                }
            }
        };
        Ok(())
    }

    async fn step_active(&mut self) -> Result<(), StepError> {
        let Some(mut run) = self.run.take() else {
            return Ok(());
        };
        let result = self.step_run(&mut run).await;
        match result {
            Ok(RunOutcome::Continue) => {
                self.run = Some(run);
            }
            Ok(RunOutcome::Waiting) => {
                self.run = Some(run);
            }
            Ok(RunOutcome::Done) => {
                self.finish_run(run).await?;
            }
            Err(err) => {
                self.handle_step_error(run, err).await?;
            }
        }
        Ok(())
    }

    async fn step_run(&mut self, run: &mut JobRun) -> Result<RunOutcome, StepError> {
        match run {
            JobRun::Tunnel(tunnel_run) => self.step_tunnel(tunnel_run).await,
            JobRun::Ore(vein) => {
                self.status = "ore".to_string();
                let mut mv = Movement::new(
                    &mut self.rig,
                    &mut self.journal,
                    &self.store,
                    &mut self.state,
                    &self.config,
                );
                match vein.step(&mut mv)? {
                    VeinProgress::Mining => Ok(RunOutcome::Continue),
                    VeinProgress::Finished => Ok(RunOutcome::Done),
                }
            }
            JobRun::Refuel => self.step_refuel(),
            JobRun::Recall(phase) => self.step_recall(phase).await,
        }
    }

    async fn step_tunnel(&mut self, run: &mut TunnelRun) -> Result<RunOutcome, StepError> {
        self.status = "tunnel".to_string();
        let entry = run
            .tunnel
            .origin
            .translated(0, 0, run.tunnel.progress as i32);
        if self.state.pose.pos != entry && run.tunnel.remaining() > 0 {
            let mut mv = self.movement();
            navigator::step_toward(&mut mv, entry, OUTBOUND)?;
            return Ok(RunOutcome::Continue);
        }
        if run.tunnel.remaining() == 0 {
            return Ok(RunOutcome::Done);
        }

        // One corridor cell: clear the floor-level block ahead, step in,
        // clear the headroom, then look for ore from both corridor cells.
        let mut found = Vec::new();
        {
            let mut mv = Movement::new(
                &mut self.rig,
                &mut self.journal,
                &self.store,
                &mut self.state,
                &self.config,
            );
            mv.turn_to(Direction::PosZ)?;
            mv.dig(Face::Forward)?;
            mv.forward()?;
            mv.dig(Face::Up)?;
            found.extend(ore::scan(&mut mv)?);
            mv.up()?;
            found.extend(ore::scan(&mut mv)?);
            mv.down()?;
        }
        for observation in found {
            if ore::record(&mut self.state.ore, observation.clone()) {
                self.queue.enqueue(JobPayload::OreMine {
                    observation: observation.clone(),
                })?;
                let _ = self
                    .bus
                    .broadcast(Message::OreFound { observation })
                    .await
                    .inspect_err(|err| warn!(%err, "ore announcement failed"));
            }
        }

        run.tunnel.progress += 1;
        run.tunnel.state = TunnelState::Active;
        if let Some(tunnel) = plan::find_mut(&mut self.state.tunnels, run.tunnel.id) {
            tunnel.progress = run.tunnel.progress;
            tunnel.state = TunnelState::Active;
        }
        self.store.save_state(&self.state)?;

        if run.tunnel.remaining() == 0 {
            Ok(RunOutcome::Done)
        } else {
            Ok(RunOutcome::Continue)
        }
    }

    fn step_refuel(&mut self) -> Result<RunOutcome, StepError> {
        self.status = "refuel".to_string();
        let (station_cell, _) = fuel::station(self.config.fuel_chest_offset, &self.config);
        if self.state.pose.pos != station_cell {
            let mut mv = self.movement();
            navigator::step_toward(&mut mv, station_cell, HOMEBOUND)?;
            return Ok(RunOutcome::Continue);
        }
        let mut mv = self.movement();
        fuel::refuel_exchange(&mut mv)?;
        self.fuel_backoff.reset();
        self.fuel_hold_until = None;
        Ok(RunOutcome::Done)
    }

    async fn step_recall(&mut self, phase: &mut RecallPhase) -> Result<RunOutcome, StepError> {
        self.status = "recalled".to_string();
        match phase {
            RecallPhase::Deposit => {
                let (station_cell, _) =
                    fuel::station(self.config.deposit_chest_offset, &self.config);
                if self.state.pose.pos != station_cell {
                    let mut mv = self.movement();
                    navigator::step_toward(&mut mv, station_cell, HOMEBOUND)?;
                    return Ok(RunOutcome::Continue);
                }
                let mut mv = self.movement();
                fuel::deposit_exchange(&mut mv)?;
                *phase = RecallPhase::Home;
                Ok(RunOutcome::Continue)
            }
            RecallPhase::Home => {
                let on_column = self.state.pose.pos.x == 0 && self.state.pose.pos.z == 0;
                let result = {
                    let mut mv = self.movement();
                    navigator::step_toward(&mut mv, Position::ORIGIN, HOMEBOUND)
                };
                match result {
                    Ok(true) => {
                        *phase = RecallPhase::Climb;
                        Ok(RunOutcome::Continue)
                    }
                    Ok(false) => Ok(RunOutcome::Continue),
                    // Descending onto a peer already parked lower in the
                    // column: this is our parking spot.
                    Err(StepError::Blocked(_)) if on_column => {
                        *phase = RecallPhase::Parked;
                        Ok(RunOutcome::Continue)
                    }
                    Err(err) => Err(err),
                }
            }
            RecallPhase::Climb => {
                let mut mv = self.movement();
                match mv.up() {
                    Ok(()) => Ok(RunOutcome::Continue),
                    // Obstructed by the next agent or the box ceiling: parked.
                    Err(StepError::Blocked(_)) | Err(StepError::OutOfBounds(_)) => {
                        *phase = RecallPhase::Parked;
                        Ok(RunOutcome::Continue)
                    }
                    Err(err) => Err(err),
                }
            }
            RecallPhase::Parked => {
                self.status = "parked".to_string();
                if !self.sent_home_ack {
                    self.sent_home_ack = true;
                    let _ = self
                        .bus
                        .broadcast(Message::HomeAck)
                        .await
                        .inspect_err(|err| warn!(%err, "home ack failed"));
                }
                Ok(RunOutcome::Waiting)
            }
        }
    }

    async fn finish_run(&mut self, run: JobRun) -> Result<(), StepError> {
        match run {
            JobRun::Tunnel(tunnel_run) => {
                let tunnel = tunnel_run.tunnel;
                info!(tunnel = %tunnel.id, "tunnel complete");
                self.state.metrics.tunnels_completed += 1;
                self.release_tunnel(tunnel.id, tunnel.length, TunnelState::Done)
                    .await?;
            }
            JobRun::Ore(vein) => {
                info!(block = %vein.block, mined = vein.mined.len(), "vein consumed");
                self.state.metrics.veins_mined += 1;
                ore::promote_mined(&mut self.state.ore, &vein.block, &vein.mined);
                self.store.save_state(&self.state)?;
                let _ = self
                    .bus
                    .broadcast(Message::OreMined {
                        block: vein.block,
                        mined: vein.mined,
                    })
                    .await
                    .inspect_err(|err| warn!(%err, "ore-mined announcement failed"));
            }
            JobRun::Refuel | JobRun::Recall(_) => {}
        }
        self.queue.complete_active()?;
        self.state.metrics.jobs_completed += 1;
        self.store.save_state(&self.state)?;
        self.run = None;
        self.status = "idle".to_string();
        Ok(())
    }

    async fn release_tunnel(
        &mut self,
        id: TunnelId,
        progress: u32,
        tunnel_state: TunnelState,
    ) -> Result<(), StepError> {
        let journal_id = self.journal.begin(JournalOp::ReleaseTunnel {
            tunnel: id,
            progress,
            state: tunnel_state,
        })?;
        plan::apply_release(
            &mut self.state.tunnels,
            id,
            progress,
            tunnel_state,
            self.state.agent_id,
        );
        self.store.save_state(&self.state)?;
        let _ = self
            .bus
            .broadcast(Message::JobRelease {
                tunnel: id,
                progress,
                state: tunnel_state,
            })
            .await
            .inspect_err(|err| warn!(%err, "release broadcast failed"));
        self.state.bus_seq = self.bus.seq();
        self.store.save_state(&self.state)?;
        self.journal.complete(journal_id)?;
        Ok(())
    }

    async fn handle_step_error(&mut self, run: JobRun, err: StepError) -> Result<(), StepError> {
        self.status = err.status_label().to_string();
        match &err {
            StepError::OutOfBounds(_) => {
                // Fatal for the job: deterministic retry would fail again.
                warn!(%err, "job failed on bounds");
                self.abandon(run, false).await?;
            }
            StepError::Blocked(_) => {
                warn!(%err, "job step blocked");
                self.abandon(run, true).await?;
            }
            StepError::FuelExhausted { .. } => {
                debug!(%err, "deferring job for refuel");
                self.queue.enqueue(JobPayload::Refuel)?;
                self.queue.defer_active()?;
                self.run = None;
                return Ok(());
            }
            StepError::ChestEmpty => {
                // Nothing to burn yet: requeue with backoff and tell the
                // fleet we are starving via the status field.
                let delay = self.fuel_backoff.next_delay();
                self.fuel_hold_until = Some(Instant::now() + delay);
                self.queue.defer_active()?;
                self.run = None;
                return Ok(());
            }
            _ => {
                error!(%err, "job step failed");
                self.abandon(run, true).await?;
            }
        }
        self.state.metrics.jobs_failed += 1;
        self.store.save_state(&self.state)?;
        Ok(())
    }

    /// Fail the active job. A dropped tunnel job also releases its claim so
    /// the leader can hand the corridor to someone else.
    async fn abandon(&mut self, run: JobRun, requeue: bool) -> Result<(), StepError> {
        let outcome = self
            .queue
            .fail_active(requeue, self.config.max_job_failures)?;
        if let (JobRun::Tunnel(tunnel_run), Some(FailOutcome::Dropped)) = (run, outcome) {
            self.release_tunnel(
                tunnel_run.tunnel.id,
                tunnel_run.tunnel.progress,
                TunnelState::Idle,
            )
            .await?;
        }
        self.run = None;
        Ok(())
    }

    // ---- timers -----------------------------------------------------------

    async fn send_heartbeat(&mut self) {
        let message = Message::Heartbeat {
            status: self.status.clone(),
            job: self.queue.active().map(|job| job.kind()),
            fuel: self.rig.fuel_level(),
            config_version: self.config.config_version,
        };
        match self.bus.broadcast(message).await {
            Ok(seq) => {
                self.state.bus_seq = seq;
            }
            Err(err) => warn!(%err, "heartbeat failed"),
        }
    }

    fn sweep(&mut self) {
        let leader_changed = self.membership.revalidate();
        if leader_changed {
            self.on_leadership_change();
        } else if self.membership.is_leader() {
            let live = self.membership.live_members();
            let released = plan::release_dead_claims(&mut self.state.tunnels, &live);
            if !released.is_empty() {
                let _ = self
                    .store
                    .save_state(&self.state)
                    .inspect_err(|err| error!(%err, "failed to persist reclaimed tunnels"));
            }
        }
    }
}

impl<R: Rig> GenServer for Worker<R> {
    type CallMsg = CallMessage;
    type CastMsg = InMessage;
    type OutMsg = OutMessage;
    type Error = WorkerError;

    async fn init(
        self,
        handle: &GenServerHandle<Self>,
    ) -> Result<spawned_concurrency::tasks::InitResult<Self>, Self::Error> {
        spawn_listener(
            handle.clone(),
            self.bus
                .incoming()
                .map(|envelope| InMessage::Delivery(Box::new(envelope))),
        );
        send_interval(
            Duration::from_millis(self.config.heartbeat_interval_ms),
            handle.clone(),
            InMessage::Heartbeat,
        );
        send_interval(
            Duration::from_millis(self.config.heartbeat_timeout_ms),
            handle.clone(),
            InMessage::Sweep,
        );
        send_after(self.tick_interval, handle.clone(), InMessage::Tick);
        send_message_on(handle.clone(), tokio::signal::ctrl_c(), InMessage::Shutdown);
        // Announce ourselves without waiting out the first interval.
        let _ = handle.clone().cast(InMessage::Heartbeat).await;
        Ok(Success(self))
    }

    async fn handle_cast(
        &mut self,
        message: Self::CastMsg,
        handle: &GenServerHandle<Self>,
    ) -> CastResponse {
        match message {
            InMessage::Tick => {
                let _ = self
                    .run_tick()
                    .await
                    .inspect_err(|err| debug!(%err, "tick ended in error"));
                send_after(self.tick_interval, handle.clone(), InMessage::Tick);
            }
            InMessage::Heartbeat => {
                self.send_heartbeat().await;
            }
            InMessage::Sweep => {
                self.sweep();
            }
            InMessage::Delivery(envelope) => {
                if self.filter.admit(&envelope) {
                    let _ = self
                        .handle_envelope(*envelope)
                        .await
                        .inspect_err(|err| warn!(%err, "message handling failed"));
                }
            }
            InMessage::Shutdown => {
                info!(metrics = ?self.state.metrics, "worker shutting down");
                self.state.bus_seq = self.bus.seq();
                let _ = self
                    .store
                    .save_state(&self.state)
                    .inspect_err(|err| error!(%err, "final state save failed"));
                return CastResponse::Stop;
            }
        }
        CastResponse::NoReply
    }

    async fn handle_call(
        &mut self,
        message: Self::CallMsg,
        _handle: &GenServerHandle<Self>,
    ) -> CallResponse<Self> {
        match message {
            CallMessage::Snapshot => {
                CallResponse::Reply(OutMessage::Snapshot(Box::new(self.snapshot())))
            }
        }
    }
}

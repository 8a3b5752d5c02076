//! Heartbeat-driven fleet view and leader election.
//!
//! Liveness is wall-clock first (`last_seen` within the timeout) with a
//! logical supplement: each peer's heartbeat count is compared against the
//! baseline taken at the previous revalidation sweep, so a fleet whose host
//! pauses time (and delivers a burst of stale-looking heartbeats afterwards)
//! does not falsely bury live peers.
//!
//! Election is stateless: the leader is the live agent with the numerically
//! smallest id, the local agent included. Unique ids make ties impossible and
//! a deterministic rule over a consistent view needs no terms or voting.

use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use automine_common::types::{AgentId, JobKind};

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub last_seen: Instant,
    /// Heartbeats observed from this peer since we first saw it.
    pub beats: u64,
    pub status: String,
    pub job: Option<JobKind>,
    pub fuel: u32,
    pub config_version: u64,
}

#[derive(Debug)]
pub struct Membership {
    local: AgentId,
    timeout: Duration,
    peers: FxHashMap<AgentId, PeerRecord>,
    /// Per-peer beat counts at the last revalidation sweep.
    sweep_baseline: FxHashMap<AgentId, u64>,
    leader: AgentId,
}

impl Membership {
    pub fn new(local: AgentId, timeout: Duration) -> Self {
        Self {
            local,
            timeout,
            peers: FxHashMap::default(),
            sweep_baseline: FxHashMap::default(),
            leader: local,
        }
    }

    pub fn local(&self) -> AgentId {
        self.local
    }

    /// Record a heartbeat. Returns `true` if this changed the leader.
    pub fn observe_heartbeat(
        &mut self,
        sender: AgentId,
        status: String,
        job: Option<JobKind>,
        fuel: u32,
        config_version: u64,
    ) -> bool {
        let now = Instant::now();
        let entry = self
            .peers
            .entry(sender)
            .and_modify(|record| {
                record.last_seen = now;
                record.beats += 1;
            })
            .or_insert_with(|| {
                info!(peer = %sender, "new fleet member");
                PeerRecord {
                    last_seen: now,
                    beats: 1,
                    status: String::new(),
                    job: None,
                    fuel: 0,
                    config_version: 0,
                }
            });
        entry.status = status;
        entry.job = job;
        entry.fuel = fuel;
        entry.config_version = config_version;
        self.recompute_leader()
    }

    /// A peer is live if heard from recently, or if its beat counter moved
    /// since the previous sweep (wall-clock pauses stall `Instant` deltas on
    /// some hosts without stopping traffic).
    pub fn is_live(&self, id: AgentId) -> bool {
        if id == self.local {
            return true;
        }
        let Some(record) = self.peers.get(&id) else {
            return false;
        };
        let fresh = record.last_seen.elapsed() <= self.timeout;
        let advanced = self
            .sweep_baseline
            .get(&id)
            .is_none_or(|baseline| record.beats > *baseline);
        fresh || advanced
    }

    /// Periodic liveness sweep. Liveness is judged against the baseline from
    /// the previous sweep, then counters are rebaselined for the next one.
    /// Returns `true` if the leader changed.
    pub fn revalidate(&mut self) -> bool {
        let changed = self.recompute_leader();
        self.sweep_baseline = self
            .peers
            .iter()
            .map(|(id, record)| (*id, record.beats))
            .collect();
        changed
    }

    /// Live members, local agent included, ascending by id.
    pub fn live_members(&self) -> Vec<AgentId> {
        let mut members: Vec<AgentId> = self
            .peers
            .keys()
            .copied()
            .filter(|id| self.is_live(*id))
            .collect();
        members.push(self.local);
        members.sort_unstable();
        members.dedup();
        members
    }

    pub fn leader(&self) -> AgentId {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.leader == self.local
    }

    /// The live peers with their last-reported state, for operator views.
    pub fn live_view(&self) -> Vec<(AgentId, PeerRecord)> {
        let mut view: Vec<(AgentId, PeerRecord)> = self
            .peers
            .iter()
            .filter(|(id, _)| self.is_live(**id))
            .map(|(id, record)| (*id, record.clone()))
            .collect();
        view.sort_unstable_by_key(|(id, _)| *id);
        view
    }

    /// Highest configuration version advertised by any live peer.
    pub fn max_config_version(&self) -> u64 {
        self.peers
            .iter()
            .filter(|(id, _)| self.is_live(**id))
            .map(|(_, record)| record.config_version)
            .max()
            .unwrap_or(0)
    }

    fn recompute_leader(&mut self) -> bool {
        let new_leader = self
            .live_members()
            .first()
            .copied()
            .unwrap_or(self.local);
        if new_leader != self.leader {
            debug!(old = %self.leader, new = %new_leader, "leader changed");
            self.leader = new_leader;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(local: u64) -> Membership {
        Membership::new(AgentId(local), Duration::from_millis(50))
    }

    fn beat(m: &mut Membership, id: u64) -> bool {
        m.observe_heartbeat(AgentId(id), "idle".into(), None, 100, 1)
    }

    #[test]
    fn alone_elects_self() {
        let m = membership(5);
        assert_eq!(m.leader(), AgentId(5));
        assert!(m.is_leader());
    }

    #[test]
    fn lowest_live_id_wins_and_stays_fixed() {
        let mut m = membership(2);
        assert!(beat(&mut m, 1));
        assert_eq!(m.leader(), AgentId(1));
        assert!(!m.is_leader());

        // A higher id joining does not disturb the leader.
        assert!(!beat(&mut m, 3));
        assert_eq!(m.leader(), AgentId(1));
        assert_eq!(
            m.live_members(),
            vec![AgentId(1), AgentId(2), AgentId(3)]
        );
    }

    #[test]
    fn silent_peer_expires_after_two_sweeps() {
        let mut m = membership(2);
        beat(&mut m, 1);
        assert_eq!(m.leader(), AgentId(1));

        // First sweep baselines the peer's beat count; it is still live via
        // the freshness window.
        std::thread::sleep(Duration::from_millis(60));
        m.revalidate();
        // Second sweep: no fresh heartbeat and no counter movement.
        let changed = m.revalidate();
        assert!(changed);
        assert_eq!(m.leader(), AgentId(2));
        assert!(!m.is_live(AgentId(1)));
    }

    #[test]
    fn beat_advance_keeps_peer_live_despite_stale_clock() {
        let mut m = membership(2);
        beat(&mut m, 1);
        std::thread::sleep(Duration::from_millis(60));
        m.revalidate();
        // Stale by wall clock, but the counter advanced since the sweep.
        beat(&mut m, 1);
        assert!(m.is_live(AgentId(1)));
        assert_eq!(m.leader(), AgentId(1));
    }

    #[test]
    fn rejoining_dead_leader_reclaims_leadership() {
        let mut m = membership(3);
        beat(&mut m, 1);
        std::thread::sleep(Duration::from_millis(60));
        m.revalidate();
        m.revalidate();
        assert_eq!(m.leader(), AgentId(3));

        beat(&mut m, 1);
        assert_eq!(m.leader(), AgentId(1));
    }

    #[test]
    fn max_config_version_ignores_dead_peers() {
        let mut m = membership(1);
        m.observe_heartbeat(AgentId(2), "idle".into(), None, 0, 9);
        assert_eq!(m.max_config_version(), 9);
        std::thread::sleep(Duration::from_millis(60));
        m.revalidate();
        m.revalidate();
        assert_eq!(m.max_config_version(), 0);
    }
}

//! Journal replay after a restart.
//!
//! Each pending entry is checked against the world: either the recorded
//! effect observably happened (remove it), or it is re-applied where that is
//! idempotent, or it stays pending and the worker refuses to advance state
//! past it until an operator intervenes.

use tracing::{info, warn};

use automine_common::types::{Face, Pose, TunnelId, TunnelState};
use automine_storage::{AgentState, Journal, JournalEntry, JournalOp, Store};

use crate::error::StepError;
use crate::plan;
use crate::rig::Rig;

/// What the replay decided, plus side effects the worker must finish: a
/// release that may never have reached the leader is re-sent.
#[derive(Debug, Default)]
pub struct Recovery {
    pub verified: usize,
    pub still_pending: usize,
    pub resend_releases: Vec<(TunnelId, u32, TunnelState)>,
}

pub fn recover<R: Rig>(
    journal: &mut Journal,
    store: &Store,
    state: &mut AgentState,
    rig: &mut R,
) -> Result<Recovery, StepError> {
    if journal.is_empty() {
        return Ok(Recovery::default());
    }
    info!(pending = journal.len(), "replaying journal");

    let mut resend_releases = Vec::new();
    let local = state.agent_id;
    let report = journal.resume(|entry| {
        verify(entry, state, rig, local, &mut resend_releases)
    })?;
    store.save_state(state)?;

    if report.still_pending > 0 {
        warn!(
            pending = report.still_pending,
            "journal entries remain unverified; holding all work until they clear"
        );
    }
    Ok(Recovery {
        verified: report.verified,
        still_pending: report.still_pending,
        resend_releases,
    })
}

fn verify<R: Rig>(
    entry: &JournalEntry,
    state: &mut AgentState,
    rig: &mut R,
    local: automine_common::types::AgentId,
    resend_releases: &mut Vec<(TunnelId, u32, TunnelState)>,
) -> bool {
    match &entry.op {
        JournalOp::MoveTo { target } => verify_move(state, rig, *target),
        JournalOp::TurnTo { target } => {
            // Turns are idempotent on the absolute facing: re-issue from the
            // tracked direction and record the result.
            if state.pose.dir != *target {
                let (lefts, rights) = state.pose.dir.turns_to(*target);
                if lefts <= rights {
                    for _ in 0..lefts {
                        rig.turn_left();
                    }
                } else {
                    for _ in 0..rights {
                        rig.turn_right();
                    }
                }
                state.pose.dir = *target;
            }
            true
        }
        JournalOp::Dig { face, pos } => {
            if face_cell(state.pose, *face) != *pos {
                // The pose has moved past this dig; the face it described is
                // no longer in front of us, and the dig either happened or
                // its block will be met again by whoever mines that cell.
                return true;
            }
            match rig.detect(*face) {
                None => true,
                Some(_) => rig.dig(*face),
            }
        }
        // Calibration is re-run by the bootstrap itself; the flag tells us
        // whether it ever finished.
        JournalOp::Calibrate => state.calibrated,
        JournalOp::ClaimTunnel { tunnel } => plan::find(&state.tunnels, *tunnel)
            .is_some_and(|t| t.claimed_by == Some(local)),
        JournalOp::ReleaseTunnel {
            tunnel,
            progress,
            state: tunnel_state,
        } => {
            // Apply locally if the crash beat us to it, and queue a re-send:
            // the leader may never have heard the original. Receivers dedupe
            // by sequence, so repeating is harmless.
            plan::apply_release(&mut state.tunnels, *tunnel, *progress, *tunnel_state, local);
            resend_releases.push((*tunnel, *progress, *tunnel_state));
            true
        }
        // Chest exchanges are re-entrant: re-running them moves whatever is
        // still movable and nothing twice.
        JournalOp::Deposit | JournalOp::Refuel => true,
        // The payload may or may not have left the socket; fleet state
        // converges through reconciliation either way, and receivers drop
        // duplicate sequences.
        JournalOp::Broadcast { .. } => true,
    }
}

fn verify_move<R: Rig>(state: &mut AgentState, rig: &mut R, target: Pose) -> bool {
    if state.pose == target {
        return true;
    }
    let from = state.pose.pos;
    let to = target.pos;
    let (dx, dy, dz) = (to.x - from.x, to.y - from.y, to.z - from.z);
    // Re-attempt the single step if it is still well-formed; otherwise the
    // entry stays pending for the operator.
    let moved = match (dx, dy, dz) {
        (0, 1, 0) => rig.up(),
        (0, -1, 0) => rig.down(),
        (0, 0, _) | (_, 0, 0) if from.manhattan(to) == 1 => {
            if state.pose.dir == target.dir && state.pose.forward().pos == to {
                rig.forward()
            } else if state.pose.back().pos == to {
                rig.back()
            } else {
                false
            }
        }
        _ => false,
    };
    if moved {
        state.pose = target;
    }
    moved
}

fn face_cell(pose: Pose, face: Face) -> automine_common::types::Position {
    match face {
        Face::Forward => pose.pos.stepped(pose.dir),
        Face::Up => pose.pos.up(),
        Face::Down => pose.pos.down(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automine_common::types::{AgentId, Direction, Position, QuarryConfig, QuarryId, Tunnel};
    use automine_storage::Journal;
    use crate::sim::{SimRig, SimWorld};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Store,
        journal: Journal,
        state: AgentState,
        world: SimWorld,
        rig: SimRig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path()).expect("store");
        let journal = Journal::open(store.journal_path()).expect("journal");
        let config = QuarryConfig::defaults(QuarryId::from("alpha"));
        let mut state = AgentState::new(AgentId(1));
        state.calibrated = true;
        let world = SimWorld::quarry(&config, 2);
        let rig = SimRig::new(&world, Position::ORIGIN, Direction::PosZ, 100);
        Fixture {
            _dir: dir,
            store,
            journal,
            state,
            world,
            rig,
        }
    }

    #[test]
    fn completed_move_verifies_by_pose() {
        let mut fx = fixture();
        // Crash after the native move and pose save, before journal.complete:
        // pose already matches the target.
        let target = Pose::new(Position::new(0, 1, 0), Direction::PosZ);
        fx.journal
            .begin(JournalOp::MoveTo { target })
            .expect("begin");
        fx.state.pose = target;

        let recovery = recover(&mut fx.journal, &fx.store, &mut fx.state, &mut fx.rig)
            .expect("recover");
        assert_eq!(recovery.verified, 1);
        assert_eq!(recovery.still_pending, 0);
        assert!(fx.journal.is_empty());
    }

    #[test]
    fn unfinished_move_is_reattempted() {
        let mut fx = fixture();
        // Crash before the native move: pose still at origin, the cell above
        // is clear, so the re-attempt succeeds and the pose catches up.
        let target = Pose::new(Position::new(0, 1, 0), Direction::PosZ);
        fx.journal
            .begin(JournalOp::MoveTo { target })
            .expect("begin");

        let recovery = recover(&mut fx.journal, &fx.store, &mut fx.state, &mut fx.rig)
            .expect("recover");
        assert_eq!(recovery.verified, 1);
        assert_eq!(fx.state.pose, target);
        assert_eq!(fx.rig.position(), Position::new(0, 1, 0));
    }

    #[test]
    fn impossible_move_stays_pending() {
        let mut fx = fixture();
        // Target is a teleport two cells away; no single step reproduces it.
        let target = Pose::new(Position::new(0, 2, 5), Direction::PosZ);
        fx.journal
            .begin(JournalOp::MoveTo { target })
            .expect("begin");

        let recovery = recover(&mut fx.journal, &fx.store, &mut fx.state, &mut fx.rig)
            .expect("recover");
        assert_eq!(recovery.still_pending, 1);
        assert_eq!(fx.journal.len(), 1);
    }

    #[test]
    fn pending_release_is_reapplied_and_marked_for_resend() {
        let mut fx = fixture();
        fx.state.tunnels = vec![Tunnel {
            id: automine_common::types::TunnelId(0),
            origin: Position::new(0, 0, 0),
            length: 4,
            progress: 2,
            state: TunnelState::Active,
            claimed_by: Some(AgentId(1)),
        }];
        fx.journal
            .begin(JournalOp::ReleaseTunnel {
                tunnel: automine_common::types::TunnelId(0),
                progress: 4,
                state: TunnelState::Done,
            })
            .expect("begin");

        let recovery = recover(&mut fx.journal, &fx.store, &mut fx.state, &mut fx.rig)
            .expect("recover");
        assert_eq!(
            recovery.resend_releases,
            vec![(automine_common::types::TunnelId(0), 4, TunnelState::Done)]
        );
        assert_eq!(fx.state.tunnels[0].state, TunnelState::Done);
        assert_eq!(fx.state.tunnels[0].claimed_by, None);
        assert!(fx.journal.is_empty());
    }

    #[test]
    fn dig_reverifies_against_the_face() {
        let mut fx = fixture();
        // Crash between begin and the native dig: the stone is still there,
        // so the replay digs it.
        fx.world.set_block(Position::new(0, 0, 1), "minecraft:stone");
        fx.journal
            .begin(JournalOp::Dig {
                face: Face::Forward,
                pos: Position::new(0, 0, 1),
            })
            .expect("begin");

        let recovery = recover(&mut fx.journal, &fx.store, &mut fx.state, &mut fx.rig)
            .expect("recover");
        assert_eq!(recovery.verified, 1);
        assert!(fx.world.block(Position::new(0, 0, 1)).is_none());
    }

    #[test]
    fn turn_reverifies_to_absolute_direction() {
        let mut fx = fixture();
        fx.journal
            .begin(JournalOp::TurnTo {
                target: Direction::NegX,
            })
            .expect("begin");

        let recovery = recover(&mut fx.journal, &fx.store, &mut fx.state, &mut fx.rig)
            .expect("recover");
        assert_eq!(recovery.verified, 1);
        assert_eq!(fx.state.pose.dir, Direction::NegX);
        assert_eq!(fx.rig.facing(), Direction::NegX);
    }
}

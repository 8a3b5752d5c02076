//! The spawn-column descent that fixes the turtle-space origin.
//!
//! Runs once per agent, before the bounding box engages. Agents are dropped
//! stacked on the spawn column facing the configured direction; each descends
//! until `down` fails against the floor. A peer directly below is waited out
//! with exponential backoff (it will calibrate and leave for work), making
//! the whole procedure idempotent: re-running it after a crash reaches the
//! same floor in the same world.

use std::time::Duration;
use tracing::{debug, info};

use automine_common::types::{Pose, Position, QuarryConfig};
use automine_storage::{AgentState, Journal, JournalOp, Store};

use crate::backoff::Backoff;
use crate::error::StepError;
use crate::rig::{Rig, is_agent_block};

const MAX_WAIT_ROUNDS: u32 = 10;
const WAIT_BASE: Duration = Duration::from_millis(500);
const WAIT_CAP: Duration = Duration::from_secs(8);

pub async fn calibrate<R: Rig>(
    rig: &mut R,
    journal: &mut Journal,
    store: &Store,
    state: &mut AgentState,
    config: &QuarryConfig,
) -> Result<(), StepError> {
    if state.calibrated {
        return Ok(());
    }

    // A crash mid-calibration leaves the entry pending; reuse it rather than
    // stacking a second intent for the same idempotent procedure.
    let pending_id = journal
        .pending()
        .find(|entry| matches!(entry.op, JournalOp::Calibrate))
        .map(|entry| entry.id);
    let id = match pending_id {
        Some(id) => id,
        None => journal.begin(JournalOp::Calibrate)?,
    };

    let mut backoff = Backoff::new(WAIT_BASE, WAIT_CAP);
    let mut waits = 0u32;
    loop {
        let mut descended = 0u32;
        while rig.down() {
            descended += 1;
        }
        if descended > 0 {
            debug!(descended, "descent hit the floor");
            break;
        }
        // Blocked on the very first cell: either a stacked peer that will
        // move away, or we were placed straight on the floor.
        let below = rig.detect(automine_common::types::Face::Down);
        let peer_below = below.as_deref().is_some_and(is_agent_block);
        if !peer_below || waits >= MAX_WAIT_ROUNDS {
            break;
        }
        waits += 1;
        // Make headroom for the column above us, then wait the peer out.
        if rig.up() {
            debug!(waits, "climbed to yield the column");
        }
        tokio::time::sleep(backoff.next_delay()).await;
    }

    state.pose = Pose::new(Position::ORIGIN, config.spawn_facing);
    state.calibrated = true;
    store.save_state(state)?;
    journal.complete(id)?;
    info!(facing = ?config.spawn_facing, "calibrated at spawn-column floor");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use automine_common::types::{AgentId, Direction, QuarryId};
    use crate::sim::{SimRig, SimWorld};

    fn setup() -> (tempfile::TempDir, Store, Journal, AgentState, QuarryConfig) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path()).expect("store");
        let journal = Journal::open(store.journal_path()).expect("journal");
        let state = AgentState::new(AgentId(1));
        let config = QuarryConfig::defaults(QuarryId::from("alpha"));
        (dir, store, journal, state, config)
    }

    #[tokio::test]
    async fn descends_to_floor_and_fixes_origin() {
        let (_dir, store, mut journal, mut state, config) = setup();
        let world = SimWorld::quarry(&config, 1);
        let mut rig = SimRig::new(&world, Position::new(0, 4, 0), Direction::PosZ, 100);

        calibrate(&mut rig, &mut journal, &store, &mut state, &config)
            .await
            .expect("calibrate");

        assert!(state.calibrated);
        assert_eq!(state.pose, Pose::new(Position::ORIGIN, config.spawn_facing));
        assert_eq!(rig.position(), Position::ORIGIN);
        assert!(journal.is_empty());
    }

    #[tokio::test]
    async fn placed_on_floor_calibrates_in_place() {
        let (_dir, store, mut journal, mut state, config) = setup();
        let world = SimWorld::quarry(&config, 1);
        let mut rig = SimRig::new(&world, Position::ORIGIN, Direction::PosZ, 100);

        calibrate(&mut rig, &mut journal, &store, &mut state, &config)
            .await
            .expect("calibrate");
        assert!(state.calibrated);
        assert_eq!(rig.position(), Position::ORIGIN);
    }

    #[tokio::test]
    async fn waits_out_a_peer_below() {
        let (_dir, store, mut journal, mut state, config) = setup();
        let world = SimWorld::quarry(&config, 1);
        // A parked peer occupies the floor cell, then leaves shortly after.
        let parked = SimRig::new(&world, Position::ORIGIN, Direction::PosZ, 100);
        let mut rig = SimRig::new(&world, Position::new(0, 1, 0), Direction::PosZ, 100);

        let waiter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(parked);
        });

        calibrate(&mut rig, &mut journal, &store, &mut state, &config)
            .await
            .expect("calibrate");
        waiter.await.expect("peer task");

        assert!(state.calibrated);
        assert_eq!(rig.position(), Position::ORIGIN);
    }

    #[tokio::test]
    async fn rerun_after_crash_is_idempotent() {
        let (_dir, store, mut journal, mut state, config) = setup();
        let world = SimWorld::quarry(&config, 1);
        let mut rig = SimRig::new(&world, Position::new(0, 2, 0), Direction::PosZ, 100);

        // Simulate a crash: the intent is journalled but never completed.
        journal.begin(JournalOp::Calibrate).expect("begin");
        calibrate(&mut rig, &mut journal, &store, &mut state, &config)
            .await
            .expect("calibrate");

        assert!(journal.is_empty());
        assert!(state.calibrated);

        // A second call is a no-op.
        calibrate(&mut rig, &mut journal, &store, &mut state, &config)
            .await
            .expect("noop");
        assert_eq!(rig.position(), Position::ORIGIN);
    }
}

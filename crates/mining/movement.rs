//! Journalled, bounds- and fuel-gated motion primitives.
//!
//! Every primitive follows the same durability bracket: journal the intent,
//! run the native action (clearing obstructions within a bounded retry
//! budget), persist the post-action pose, then retire the journal entry. A
//! crash anywhere inside the bracket is resolved on restart by the journal
//! replay in [`crate::recovery`].

use tracing::trace;

use automine_common::types::{Direction, Face, Pose, Position, QuarryConfig};
use automine_storage::{AgentState, Journal, JournalOp, Store};

use crate::error::StepError;
use crate::rig::Rig;

#[derive(Debug, Clone, Copy)]
enum MoveKind {
    Forward,
    Back,
    Up,
    Down,
}

/// Borrowed execution context for motion. Constructed fresh for each bounded
/// step from the worker's fields; holds no state of its own.
pub struct Movement<'a, R: Rig> {
    pub rig: &'a mut R,
    pub journal: &'a mut Journal,
    pub store: &'a Store,
    pub state: &'a mut AgentState,
    pub config: &'a QuarryConfig,
    bounds_engaged: bool,
}

impl<'a, R: Rig> Movement<'a, R> {
    pub fn new(
        rig: &'a mut R,
        journal: &'a mut Journal,
        store: &'a Store,
        state: &'a mut AgentState,
        config: &'a QuarryConfig,
    ) -> Self {
        // Until calibration fixes the origin, poses are provisional and the
        // box cannot be meaningfully enforced.
        let bounds_engaged = state.calibrated;
        Self {
            rig,
            journal,
            store,
            state,
            config,
            bounds_engaged,
        }
    }

    pub fn pose(&self) -> Pose {
        self.state.pose
    }

    pub fn forward(&mut self) -> Result<(), StepError> {
        self.move_step(self.state.pose.forward(), MoveKind::Forward)
    }

    pub fn back(&mut self) -> Result<(), StepError> {
        self.move_step(self.state.pose.back(), MoveKind::Back)
    }

    pub fn up(&mut self) -> Result<(), StepError> {
        self.move_step(self.state.pose.above(), MoveKind::Up)
    }

    pub fn down(&mut self) -> Result<(), StepError> {
        self.move_step(self.state.pose.below(), MoveKind::Down)
    }

    pub fn turn_left(&mut self) -> Result<(), StepError> {
        self.turn_to(self.state.pose.dir.left())
    }

    pub fn turn_right(&mut self) -> Result<(), StepError> {
        self.turn_to(self.state.pose.dir.right())
    }

    /// Rotate to an absolute facing via the shorter side. Idempotent: the
    /// journal records the target direction, not the turn count.
    pub fn turn_to(&mut self, target: Direction) -> Result<(), StepError> {
        if self.state.pose.dir == target {
            return Ok(());
        }
        let id = self.journal.begin(JournalOp::TurnTo { target })?;
        let (lefts, rights) = self.state.pose.dir.turns_to(target);
        if lefts <= rights {
            for _ in 0..lefts {
                self.rig.turn_left();
            }
        } else {
            for _ in 0..rights {
                self.rig.turn_right();
            }
        }
        self.state.pose.dir = target;
        self.store.save_state(self.state)?;
        self.journal.complete(id)?;
        Ok(())
    }

    /// The cell a face refers to from the current pose.
    pub fn face_cell(&self, face: Face) -> Position {
        match face {
            Face::Forward => self.state.pose.pos.stepped(self.state.pose.dir),
            Face::Up => self.state.pose.pos.up(),
            Face::Down => self.state.pose.pos.down(),
        }
    }

    /// Deliberately break the block on a face. Returns the block's name if
    /// something was removed. Digging outside the box is refused outright.
    pub fn dig(&mut self, face: Face) -> Result<Option<String>, StepError> {
        let pos = self.face_cell(face);
        if self.bounds_engaged && !self.config.bounds.contains(pos) {
            return Err(StepError::OutOfBounds(pos));
        }
        let Some(name) = self.rig.detect(face) else {
            return Ok(None);
        };
        let id = self.journal.begin(JournalOp::Dig { face, pos })?;
        let removed = self.rig.dig(face);
        if removed {
            self.state.metrics.blocks_mined += 1;
            self.store.save_state(self.state)?;
        }
        self.journal.complete(id)?;
        trace!(%pos, block = %name, removed, "dig");
        Ok(removed.then_some(name))
    }

    /// What the rig sees on a face, without touching it.
    pub fn inspect(&mut self, face: Face) -> Option<String> {
        self.rig.detect(face)
    }

    fn move_step(&mut self, target: Pose, kind: MoveKind) -> Result<(), StepError> {
        if self.bounds_engaged {
            // Inside the box only in-box targets are legal. A stray agent
            // (the box shrank under it) may still step strictly toward
            // containment so a recall can bring it home.
            let here = self.config.bounds.distance_to(self.state.pose.pos);
            let there = self.config.bounds.distance_to(target.pos);
            if there > 0 && there >= here {
                return Err(StepError::OutOfBounds(target.pos));
            }
        }
        let level = self.rig.fuel_level();
        if level < 1 {
            return Err(StepError::FuelExhausted { level, needed: 1 });
        }

        let id = self.journal.begin(JournalOp::MoveTo { target })?;
        let clear_face = match kind {
            MoveKind::Forward => Some(Face::Forward),
            MoveKind::Up => Some(Face::Up),
            MoveKind::Down => Some(Face::Down),
            // Backing up cannot clear; there is no rear-facing tool.
            MoveKind::Back => None,
        };

        let mut attempts = 0u32;
        loop {
            let moved = match kind {
                MoveKind::Forward => self.rig.forward(),
                MoveKind::Back => self.rig.back(),
                MoveKind::Up => self.rig.up(),
                MoveKind::Down => self.rig.down(),
            };
            if moved {
                break;
            }
            let Some(face) = clear_face else {
                // The intent provably did not happen; retire it.
                self.journal.complete(id)?;
                return Err(StepError::Blocked(0));
            };
            if attempts >= self.config.max_clear_attempts {
                self.journal.complete(id)?;
                return Err(StepError::Blocked(attempts));
            }
            attempts += 1;
            self.clear(face);
        }

        self.state.pose = target;
        self.state.metrics.steps_taken += 1;
        self.state.metrics.fuel_consumed += 1;
        self.store.save_state(self.state)?;
        self.journal.complete(id)?;
        trace!(pose = %self.state.pose, "moved");
        Ok(())
    }

    /// One obstruction-clear round: dig if a block is there, swing otherwise
    /// (mobs obstruct without being detectable as blocks).
    fn clear(&mut self, face: Face) {
        if self.rig.detect(face).is_some() {
            if !self.rig.dig(face) {
                self.rig.attack(face);
            }
        } else {
            self.rig.attack(face);
        }
    }
}

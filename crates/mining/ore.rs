//! Ore registry and vein mining.
//!
//! The registry is the replicated, monotone record of every sighting:
//! entries are keyed `(pos, block)` and only ever move `Queued -> Mined`.
//! Scanning happens during tunnel advances; vein consumption is a bounded
//! flood-fill over 6-connected same-named blocks, run one cell per tick so
//! the worker loop stays pre-emptible.

use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use tracing::debug;

use automine_common::types::{Face, OreObservation, OreStatus, Position};

use crate::error::StepError;
use crate::movement::Movement;
use crate::navigator::{self, OUTBOUND};
use crate::rig::Rig;

/// Insert a sighting unless its key is already present. Returns `true` for
/// a genuinely new entry.
pub fn record(registry: &mut Vec<OreObservation>, obs: OreObservation) -> bool {
    if registry.iter().any(|existing| existing.key() == obs.key()) {
        return false;
    }
    registry.push(obs);
    true
}

pub fn get<'r>(
    registry: &'r [OreObservation],
    pos: Position,
    block: &str,
) -> Option<&'r OreObservation> {
    registry
        .iter()
        .find(|obs| obs.pos == pos && obs.block == block)
}

/// Promote every entry covering `cells` of `block` to mined. Monotone: a
/// mined entry never reverts, and promoting twice is a no-op.
pub fn promote_mined(registry: &mut [OreObservation], block: &str, cells: &[Position]) -> usize {
    let mut promoted = 0;
    for obs in registry.iter_mut() {
        if obs.block == block
            && obs.status == OreStatus::Queued
            && cells.contains(&obs.pos)
        {
            obs.status = OreStatus::Mined;
            promoted += 1;
        }
    }
    promoted
}

/// Inspect the six reachable faces from the current cell (up, down, and the
/// four horizontals by rotating in place) and return any ore sightings.
pub fn scan<R: Rig>(mv: &mut Movement<'_, R>) -> Result<Vec<OreObservation>, StepError> {
    let mut found = Vec::new();
    for face in [Face::Up, Face::Down] {
        note(mv, face, &mut found);
    }
    for _ in 0..4 {
        note(mv, Face::Forward, &mut found);
        mv.turn_left()?;
    }
    Ok(found)
}

fn note<R: Rig>(mv: &mut Movement<'_, R>, face: Face, found: &mut Vec<OreObservation>) {
    if let Some(name) = mv.inspect(face)
        && mv.config.is_ore(&name)
    {
        let cell = mv.face_cell(face);
        if mv.config.bounds.contains(cell) {
            found.push(OreObservation::queued(cell, name));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VeinProgress {
    Mining,
    Finished,
}

/// Runtime of one vein flood-fill. Not persisted: a crash restarts the fill
/// from the original observation, and cells mined before the crash are
/// simply absent from the world, so the BFS converges on the remainder.
#[derive(Debug)]
pub struct VeinRun {
    pub block: String,
    frontier: VecDeque<Position>,
    visited: FxHashSet<Position>,
    target: Option<Position>,
    pub mined: Vec<Position>,
}

impl VeinRun {
    pub fn new(observation: &OreObservation) -> Self {
        let mut visited = FxHashSet::default();
        visited.insert(observation.pos);
        Self {
            block: observation.block.clone(),
            frontier: VecDeque::from([observation.pos]),
            visited,
            target: None,
            mined: Vec::new(),
        }
    }

    /// One bounded step: advance one cell toward the current target, or pick
    /// the next frontier cell. Arrival consumes the cell (the movement layer
    /// digs through it) and expands the frontier with matching neighbours.
    pub fn step<R: Rig>(&mut self, mv: &mut Movement<'_, R>) -> Result<VeinProgress, StepError> {
        if self.mined.len() as u32 >= mv.config.flood_fill_cap {
            debug!(block = %self.block, mined = self.mined.len(), "flood-fill cap reached");
            return Ok(VeinProgress::Finished);
        }
        let target = match self.target {
            Some(target) => target,
            None => match self.frontier.pop_front() {
                Some(next) => {
                    self.target = Some(next);
                    next
                }
                None => return Ok(VeinProgress::Finished),
            },
        };

        if !navigator::step_toward(mv, target, OUTBOUND)? {
            return Ok(VeinProgress::Mining);
        }

        // Arrived: the ore cell is now consumed. Look around for the rest of
        // the component.
        self.target = None;
        self.mined.push(target);
        for obs in scan(mv)? {
            if obs.block == self.block && self.visited.insert(obs.pos) {
                self.frontier.push_back(obs.pos);
            }
        }
        Ok(VeinProgress::Mining)
    }
}

//! Axis-ordered point-to-point motion.
//!
//! Paths are deterministic: outbound legs run `y` then `x` then `z`, so an
//! agent leaving the spawn column climbs to its layer, tracks along the
//! layer's main branch at `z = 0`, and only then enters tunnel depth. The
//! homebound order is the exact reverse (`z`, `x`, `y`): back out of the
//! tunnel to the branch, along the branch to the column, then down. A resumed
//! agent replays the same intermediate poses, and distinct tunnels never
//! share a `y` mid-traverse.

use automine_common::types::{Direction, Position};

use crate::error::StepError;
use crate::movement::Movement;
use crate::rig::Rig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// Leg order when heading away from the spawn column.
pub const OUTBOUND: [Axis; 3] = [Axis::Y, Axis::X, Axis::Z];
/// Leg order when heading back toward it.
pub const HOMEBOUND: [Axis; 3] = [Axis::Z, Axis::X, Axis::Y];

/// Advance at most one cell toward `target` along the given axis order.
/// Returns `true` once the position matches the target (facing is left
/// wherever the last leg needed it).
pub fn step_toward<R: Rig>(
    mv: &mut Movement<'_, R>,
    target: Position,
    order: [Axis; 3],
) -> Result<bool, StepError> {
    let pos = mv.pose().pos;
    for axis in order {
        match axis {
            Axis::Y => {
                if pos.y < target.y {
                    mv.up()?;
                } else if pos.y > target.y {
                    mv.down()?;
                } else {
                    continue;
                }
            }
            Axis::X => {
                if pos.x == target.x {
                    continue;
                }
                let dir = if pos.x < target.x {
                    Direction::PosX
                } else {
                    Direction::NegX
                };
                mv.turn_to(dir)?;
                mv.forward()?;
            }
            Axis::Z => {
                if pos.z == target.z {
                    continue;
                }
                let dir = if pos.z < target.z {
                    Direction::PosZ
                } else {
                    Direction::NegZ
                };
                mv.turn_to(dir)?;
                mv.forward()?;
            }
        }
        return Ok(mv.pose().pos == target);
    }
    Ok(true)
}

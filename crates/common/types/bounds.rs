use serde::{Deserialize, Serialize};

use super::Position;

/// The axis-aligned region agents may occupy: `[0..=max_x] x [0..=max_y] x
/// [0..=max_z]` in turtle-space. Immutable within a configuration version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub max_x: u32,
    pub max_y: u32,
    pub max_z: u32,
}

impl BoundingBox {
    pub const fn new(max_x: u32, max_y: u32, max_z: u32) -> Self {
        Self {
            max_x,
            max_y,
            max_z,
        }
    }

    pub const fn contains(&self, pos: Position) -> bool {
        pos.x >= 0
            && pos.y >= 0
            && pos.z >= 0
            && pos.x <= self.max_x as i32
            && pos.y <= self.max_y as i32
            && pos.z <= self.max_z as i32
    }

    /// Manhattan distance from `pos` to the nearest cell of the box; zero
    /// inside. Lets a stray agent (after a box shrink) move strictly back
    /// toward containment while every other move stays forbidden.
    pub const fn distance_to(&self, pos: Position) -> u32 {
        let dx = if pos.x < 0 {
            (-pos.x) as u32
        } else if pos.x > self.max_x as i32 {
            (pos.x - self.max_x as i32) as u32
        } else {
            0
        };
        let dy = if pos.y < 0 {
            (-pos.y) as u32
        } else if pos.y > self.max_y as i32 {
            (pos.y - self.max_y as i32) as u32
        } else {
            0
        };
        let dz = if pos.z < 0 {
            (-pos.z) as u32
        } else if pos.z > self.max_z as i32 {
            (pos.z - self.max_z as i32) as u32
        } else {
            0
        };
        dx + dy + dz
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::new(8, 6, 16)
    }
}

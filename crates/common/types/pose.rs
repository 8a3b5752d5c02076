use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

/// A cell in turtle-space: the right-handed integer frame whose origin is the
/// calibrated bottom cell of the spawn column, `y` vertical.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Position {
    pub const ORIGIN: Position = Position { x: 0, y: 0, z: 0 };

    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub const fn translated(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            z: self.z + dz,
        }
    }

    pub const fn up(self) -> Self {
        self.translated(0, 1, 0)
    }

    pub const fn down(self) -> Self {
        self.translated(0, -1, 0)
    }

    /// One cell in the given horizontal direction.
    pub const fn stepped(self, dir: Direction) -> Self {
        let (dx, dz) = dir.delta();
        self.translated(dx, 0, dz)
    }

    pub const fn manhattan(self, other: Position) -> u32 {
        (self.x - other.x).unsigned_abs()
            + (self.y - other.y).unsigned_abs()
            + (self.z - other.z).unsigned_abs()
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

#[derive(Debug, Error)]
#[error("direction must be 0..=3, got {0}")]
pub struct InvalidDirection(u8);

/// Facing as quarter turns: 0 = +z, 1 = +x, 2 = -z, 3 = -x.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(into = "u8", try_from = "u8")]
pub enum Direction {
    #[default]
    PosZ = 0,
    PosX = 1,
    NegZ = 2,
    NegX = 3,
}

impl Direction {
    /// Unit step `(dx, dz)` on the horizontal plane.
    pub const fn delta(self) -> (i32, i32) {
        match self {
            Direction::PosZ => (0, 1),
            Direction::PosX => (1, 0),
            Direction::NegZ => (0, -1),
            Direction::NegX => (-1, 0),
        }
    }

    pub const fn left(self) -> Direction {
        match self {
            Direction::PosZ => Direction::PosX,
            Direction::PosX => Direction::NegZ,
            Direction::NegZ => Direction::NegX,
            Direction::NegX => Direction::PosZ,
        }
    }

    pub const fn right(self) -> Direction {
        self.left().left().left()
    }

    pub const fn opposite(self) -> Direction {
        self.left().left()
    }

    /// Quarter turns needed to face `target`, as `(lefts, rights)`; the
    /// movement layer picks whichever is shorter.
    pub const fn turns_to(self, target: Direction) -> (u8, u8) {
        let lefts = (target as u8).wrapping_sub(self as u8) % 4;
        (lefts, (4 - lefts) % 4)
    }
}

impl From<Direction> for u8 {
    fn from(value: Direction) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for Direction {
    type Error = InvalidDirection;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Direction::PosZ),
            1 => Ok(Direction::PosX),
            2 => Ok(Direction::NegZ),
            3 => Ok(Direction::NegX),
            other => Err(InvalidDirection(other)),
        }
    }
}

/// The three faces an agent can inspect or dig without moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Face {
    Forward,
    Up,
    Down,
}

/// An agent's position and facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Pose {
    pub pos: Position,
    pub dir: Direction,
}

impl Pose {
    pub const fn new(pos: Position, dir: Direction) -> Self {
        Self { pos, dir }
    }

    /// Target pose of one forward step.
    pub const fn forward(self) -> Pose {
        Pose {
            pos: self.pos.stepped(self.dir),
            dir: self.dir,
        }
    }

    /// Target pose of one backward step (facing unchanged).
    pub const fn back(self) -> Pose {
        Pose {
            pos: self.pos.stepped(self.dir.opposite()),
            dir: self.dir,
        }
    }

    pub const fn above(self) -> Pose {
        Pose {
            pos: self.pos.up(),
            dir: self.dir,
        }
    }

    pub const fn below(self) -> Pose {
        Pose {
            pos: self.pos.down(),
            dir: self.dir,
        }
    }
}

impl Display for Pose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, self.dir as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_turns_compose() {
        for d in [
            Direction::PosZ,
            Direction::PosX,
            Direction::NegZ,
            Direction::NegX,
        ] {
            assert_eq!(d.left().right(), d);
            assert_eq!(d.left().left(), d.opposite());
            assert_eq!(d.right().right(), d.opposite());
            assert_eq!(d.opposite().opposite(), d);
        }
    }

    #[test]
    fn turns_to_is_minimal_pair() {
        let (l, r) = Direction::PosZ.turns_to(Direction::NegX);
        assert_eq!((l, r), (3, 1));
        let (l, r) = Direction::PosX.turns_to(Direction::PosX);
        assert_eq!((l, r), (0, 0));
    }

    #[test]
    fn forward_follows_facing() {
        let p = Pose::new(Position::new(2, 0, 5), Direction::NegX);
        assert_eq!(p.forward().pos, Position::new(1, 0, 5));
        assert_eq!(p.back().pos, Position::new(3, 0, 5));
    }

    #[test]
    fn manhattan_symmetric() {
        let a = Position::new(1, 2, 3);
        let b = Position::new(-2, 0, 7);
        assert_eq!(a.manhattan(b), b.manhattan(a));
        assert_eq!(a.manhattan(b), 9);
    }

    #[test]
    fn direction_roundtrips_as_u8() {
        for raw in 0u8..4 {
            let d = Direction::try_from(raw).expect("valid direction");
            assert_eq!(u8::from(d), raw);
        }
        assert!(Direction::try_from(4).is_err());
    }
}

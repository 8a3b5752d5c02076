use serde::{Deserialize, Serialize};

use super::Position;

/// Lifecycle of an observed ore block. Transitions are monotone: an entry
/// never returns from `Mined` to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OreStatus {
    #[default]
    Queued,
    Mined,
}

/// A single ore sighting. The registry dedupes on `(pos, block)`; a vein is
/// the 6-connected component of same-named blocks reachable from `pos`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OreObservation {
    pub pos: Position,
    pub block: String,
    pub status: OreStatus,
}

impl OreObservation {
    pub fn queued(pos: Position, block: impl Into<String>) -> Self {
        Self {
            pos,
            block: block.into(),
            status: OreStatus::Queued,
        }
    }

    /// Registry key: position plus block name.
    pub fn key(&self) -> (Position, &str) {
        (self.pos, self.block.as_str())
    }
}

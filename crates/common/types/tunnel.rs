use serde::{Deserialize, Serialize};
use std::fmt::Display;

use super::{AgentId, Position};

/// Identifier of one tunnel in the quarry plan. Stable across restarts: the
/// plan enumeration is deterministic in the configuration, so the same id
/// names the same corridor on every agent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TunnelId(pub u32);

impl Display for TunnelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{:03}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    #[default]
    Idle,
    Claimed,
    Active,
    Done,
}

/// One planned 2x1 corridor extending along +z from its origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: TunnelId,
    pub origin: Position,
    pub length: u32,
    /// Cells already cleared, measured from the origin.
    pub progress: u32,
    pub state: TunnelState,
    /// Holder of the mutex while `state` is `Claimed` or `Active`.
    pub claimed_by: Option<AgentId>,
}

impl Tunnel {
    pub fn new(id: TunnelId, origin: Position, length: u32) -> Self {
        Self {
            id,
            origin,
            length,
            progress: 0,
            state: TunnelState::Idle,
            claimed_by: None,
        }
    }

    pub const fn is_idle(&self) -> bool {
        matches!(self.state, TunnelState::Idle)
    }

    pub const fn remaining(&self) -> u32 {
        self.length.saturating_sub(self.progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_counts_down_and_saturates() {
        let mut tunnel = Tunnel::new(TunnelId(0), Position::new(3, 0, 0), 2);
        assert_eq!(tunnel.remaining(), 2);
        tunnel.progress = 1;
        assert_eq!(tunnel.remaining(), 1);
        tunnel.progress = 3;
        assert_eq!(tunnel.remaining(), 0);
    }
}

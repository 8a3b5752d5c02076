use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use super::{BoundingBox, Direction, Position, QuarryId};

/// Minimum tunnel and layer spacing. Anything tighter violates the two-cell
/// air gap between corridors.
pub const MIN_SPACING: u32 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("tunnel_spacing {0} below minimum {MIN_SPACING}")]
    TunnelSpacing(u32),
    #[error("layer_spacing {0} below minimum {MIN_SPACING}")]
    LayerSpacing(u32),
    #[error("chunk_length must be at least 1")]
    ChunkLength,
    #[error("chunk_length {length} exceeds bounding box depth {max_z}")]
    ChunkTooDeep { length: u32, max_z: u32 },
    #[error("fuel_target {target} below fuel_reserve {reserve}")]
    FuelTarget { target: u32, reserve: u32 },
    #[error("allowed_fuel set is empty")]
    NoFuel,
    #[error("ore_tags set is empty")]
    NoOreTags,
    #[error("heartbeat_timeout_ms {timeout} must exceed heartbeat_interval_ms {interval}")]
    HeartbeatWindow { timeout: u64, interval: u64 },
}

/// Everything the fleet must agree on for one quarry. Created interactively
/// on the first boot of any agent, then replicated over the bus; any change
/// bumps `config_version` and is rebroadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarryConfig {
    pub quarry_id: QuarryId,
    /// Monotonic. A peer advertising a higher version holds a newer config.
    pub config_version: u64,
    pub bounds: BoundingBox,
    pub tunnel_spacing: u32,
    pub layer_spacing: u32,
    pub chunk_length: u32,
    /// Below this fuel level the agent refuses new work and queues a refuel.
    pub fuel_reserve: u32,
    /// Refueling stops once the tank reaches this level.
    pub fuel_target: u32,
    /// Fuel items kept back from deposits so the agent stays autonomous.
    pub keep_fuel_items: u32,
    /// Extra fuel demanded on top of every worst-case job estimate.
    pub safety_margin: u32,
    pub max_job_failures: u32,
    /// Obstruction dig/attack rounds before a step reports `Blocked`.
    pub max_clear_attempts: u32,
    /// Cap on blocks mined by a single vein flood-fill.
    pub flood_fill_cap: u32,
    pub spawn_facing: Direction,
    /// Chest positions in turtle-space, behind the spawn column.
    pub fuel_chest_offset: Position,
    pub deposit_chest_offset: Position,
    /// Where a recalled agent parks once home.
    pub rest_offset: Position,
    pub allowed_fuel: BTreeSet<String>,
    pub ore_tags: BTreeSet<String>,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
}

impl QuarryConfig {
    /// A workable configuration for the given quarry; the interactive wizard
    /// starts from this and the operator adjusts.
    pub fn defaults(quarry_id: QuarryId) -> Self {
        Self {
            quarry_id,
            config_version: 1,
            bounds: BoundingBox::default(),
            tunnel_spacing: 3,
            layer_spacing: 3,
            chunk_length: 4,
            fuel_reserve: 100,
            fuel_target: 1000,
            keep_fuel_items: 8,
            safety_margin: 16,
            max_job_failures: 3,
            max_clear_attempts: 8,
            flood_fill_cap: 64,
            spawn_facing: Direction::PosZ,
            fuel_chest_offset: Position::new(0, 0, -1),
            deposit_chest_offset: Position::new(0, 1, -1),
            rest_offset: Position::new(0, 0, 0),
            allowed_fuel: ["minecraft:coal", "minecraft:charcoal", "minecraft:coal_block"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            ore_tags: [
                "minecraft:iron_ore",
                "minecraft:gold_ore",
                "minecraft:diamond_ore",
                "minecraft:redstone_ore",
                "minecraft:lapis_ore",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            heartbeat_interval_ms: 2_000,
            heartbeat_timeout_ms: 10_000,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnel_spacing < MIN_SPACING {
            return Err(ConfigError::TunnelSpacing(self.tunnel_spacing));
        }
        if self.layer_spacing < MIN_SPACING {
            return Err(ConfigError::LayerSpacing(self.layer_spacing));
        }
        if self.chunk_length == 0 {
            return Err(ConfigError::ChunkLength);
        }
        if self.chunk_length > self.bounds.max_z {
            return Err(ConfigError::ChunkTooDeep {
                length: self.chunk_length,
                max_z: self.bounds.max_z,
            });
        }
        if self.fuel_target < self.fuel_reserve {
            return Err(ConfigError::FuelTarget {
                target: self.fuel_target,
                reserve: self.fuel_reserve,
            });
        }
        if self.allowed_fuel.is_empty() {
            return Err(ConfigError::NoFuel);
        }
        if self.ore_tags.is_empty() {
            return Err(ConfigError::NoOreTags);
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::HeartbeatWindow {
                timeout: self.heartbeat_timeout_ms,
                interval: self.heartbeat_interval_ms,
            });
        }
        Ok(())
    }

    pub fn is_fuel(&self, item: &str) -> bool {
        self.allowed_fuel.contains(item)
    }

    pub fn is_ore(&self, block: &str) -> bool {
        self.ore_tags.contains(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = QuarryConfig::defaults(QuarryId::from("alpha"));
        config.validate().expect("default config is valid");
    }

    #[test]
    fn rejects_tight_spacing() {
        let mut config = QuarryConfig::defaults(QuarryId::from("alpha"));
        config.tunnel_spacing = 2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TunnelSpacing(2))
        ));
    }

    #[test]
    fn rejects_inverted_fuel_thresholds() {
        let mut config = QuarryConfig::defaults(QuarryId::from("alpha"));
        config.fuel_target = config.fuel_reserve - 1;
        assert!(matches!(config.validate(), Err(ConfigError::FuelTarget { .. })));
    }

    #[test]
    fn json_roundtrip_is_lossless() {
        let config = QuarryConfig::defaults(QuarryId::from("alpha"));
        let encoded = serde_json::to_string(&config).expect("encode");
        let decoded: QuarryConfig = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(config, decoded);
    }
}

//! Deterministic in-memory rig for tests and `--sim` fleets.
//!
//! The simulated world shares the turtle-space frame: its origin is the
//! spawn-column floor cell, so poses tracked by the movement layer and cells
//! stored here coincide once calibration has run. Multiple rigs share one
//! world behind a mutex, which is enough to exercise stacked spawns, shared
//! chests, and peers racing for the same vein.

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use automine_common::types::{Direction, Face, Position, QuarryConfig};

use crate::rig::{ItemStack, Rig, SLOT_COUNT};

/// Block name reported when a face is occupied by another agent.
pub const AGENT_BLOCK: &str = "computercraft:turtle";
const BEDROCK: &str = "minecraft:bedrock";
const CHEST: &str = "minecraft:chest";
const STONE: &str = "minecraft:stone";

fn burn_value(item: &str) -> u32 {
    match item {
        "minecraft:coal" | "minecraft:charcoal" => 80,
        "minecraft:coal_block" => 800,
        "minecraft:lava_bucket" => 1000,
        _ => 0,
    }
}

#[derive(Debug, Default)]
struct WorldInner {
    blocks: FxHashMap<Position, String>,
    chests: FxHashMap<Position, Vec<ItemStack>>,
    /// Cells occupied by live rigs, keyed by rig token.
    agents: FxHashMap<usize, Position>,
    next_token: usize,
}

impl WorldInner {
    fn occupied(&self, pos: Position, except: usize) -> bool {
        self.agents
            .iter()
            .any(|(token, at)| *token != except && *at == pos)
    }
}

/// A shared block field plus chest inventories.
#[derive(Debug, Clone, Default)]
pub struct SimWorld {
    inner: Arc<Mutex<WorldInner>>,
}

impl SimWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fully stocked quarry for the given configuration: solid stone in the
    /// bounding box, a clear spawn column, bedrock floor, and both chests
    /// placed and filled per the config offsets.
    pub fn quarry(config: &QuarryConfig, fuel_stacks: u32) -> Self {
        let world = Self::new();
        {
            let mut inner = world.lock();
            let bounds = config.bounds;
            for x in -1..=(bounds.max_x as i32 + 1) {
                for z in -2..=(bounds.max_z as i32 + 1) {
                    inner
                        .blocks
                        .insert(Position::new(x, -1, z), BEDROCK.to_string());
                }
            }
            for x in 0..=(bounds.max_x as i32) {
                for y in 0..=(bounds.max_y as i32) {
                    for z in 0..=(bounds.max_z as i32) {
                        if x == 0 && z == 0 {
                            continue; // spawn column stays clear
                        }
                        inner
                            .blocks
                            .insert(Position::new(x, y, z), STONE.to_string());
                    }
                }
            }
            inner
                .blocks
                .insert(config.fuel_chest_offset, CHEST.to_string());
            inner
                .blocks
                .insert(config.deposit_chest_offset, CHEST.to_string());
            let fuel: Vec<ItemStack> = (0..fuel_stacks)
                .map(|_| ItemStack {
                    name: "minecraft:coal".to_string(),
                    count: 64,
                })
                .collect();
            inner.chests.insert(config.fuel_chest_offset, fuel);
            inner.chests.insert(config.deposit_chest_offset, Vec::new());
        }
        world
    }

    fn lock(&self) -> MutexGuard<'_, WorldInner> {
        // A poisoned lock only happens after a panicking test; the world
        // itself is still structurally sound.
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn set_block(&self, pos: Position, name: impl Into<String>) {
        self.lock().blocks.insert(pos, name.into());
    }

    pub fn clear_block(&self, pos: Position) {
        self.lock().blocks.remove(&pos);
    }

    pub fn block(&self, pos: Position) -> Option<String> {
        self.lock().blocks.get(&pos).cloned()
    }

    pub fn add_chest(&self, pos: Position, items: Vec<ItemStack>) {
        let mut inner = self.lock();
        inner.blocks.insert(pos, CHEST.to_string());
        inner.chests.insert(pos, items);
    }

    pub fn chest_contents(&self, pos: Position) -> Vec<ItemStack> {
        self.lock().chests.get(&pos).cloned().unwrap_or_default()
    }

    pub fn agent_positions(&self) -> FxHashSet<Position> {
        self.lock().agents.values().copied().collect()
    }
}

/// One simulated robot.
#[derive(Debug)]
pub struct SimRig {
    world: SimWorld,
    token: usize,
    pos: Position,
    facing: Direction,
    fuel: u32,
    inventory: Vec<Option<ItemStack>>,
}

impl SimRig {
    pub fn new(world: &SimWorld, pos: Position, facing: Direction, fuel: u32) -> Self {
        let token = {
            let mut inner = world.lock();
            let token = inner.next_token;
            inner.next_token += 1;
            inner.agents.insert(token, pos);
            token
        };
        Self {
            world: world.clone(),
            token,
            pos,
            facing,
            fuel,
            inventory: vec![None; SLOT_COUNT],
        }
    }

    pub fn position(&self) -> Position {
        self.pos
    }

    pub fn facing(&self) -> Direction {
        self.facing
    }

    pub fn set_fuel(&mut self, fuel: u32) {
        self.fuel = fuel;
    }

    /// Put a stack straight into the first empty slot, as if picked up.
    pub fn give(&mut self, stack: ItemStack) {
        if let Some(slot) = self.inventory.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(stack);
        }
    }

    fn face_cell(&self, face: Face) -> Position {
        match face {
            Face::Forward => self.pos.stepped(self.facing),
            Face::Up => self.pos.up(),
            Face::Down => self.pos.down(),
        }
    }

    fn try_move(&mut self, target: Position) -> bool {
        if self.fuel == 0 {
            return false;
        }
        let mut inner = self.world.lock();
        if inner.blocks.contains_key(&target) || inner.occupied(target, self.token) {
            return false;
        }
        inner.agents.insert(self.token, target);
        drop(inner);
        self.pos = target;
        self.fuel -= 1;
        true
    }

    fn store_stack(&mut self, stack: ItemStack) -> bool {
        if let Some(existing) = self
            .inventory
            .iter_mut()
            .flatten()
            .find(|existing| existing.name == stack.name)
        {
            existing.count += stack.count;
            return true;
        }
        match self.inventory.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(stack);
                true
            }
            None => false,
        }
    }
}

impl Drop for SimRig {
    fn drop(&mut self) {
        self.world.lock().agents.remove(&self.token);
    }
}

impl Rig for SimRig {
    fn forward(&mut self) -> bool {
        self.try_move(self.pos.stepped(self.facing))
    }

    fn back(&mut self) -> bool {
        self.try_move(self.pos.stepped(self.facing.opposite()))
    }

    fn up(&mut self) -> bool {
        self.try_move(self.pos.up())
    }

    fn down(&mut self) -> bool {
        self.try_move(self.pos.down())
    }

    fn turn_left(&mut self) {
        self.facing = self.facing.left();
    }

    fn turn_right(&mut self) {
        self.facing = self.facing.right();
    }

    fn detect(&mut self, face: Face) -> Option<String> {
        let cell = self.face_cell(face);
        let inner = self.world.lock();
        if let Some(name) = inner.blocks.get(&cell) {
            return Some(name.clone());
        }
        inner
            .occupied(cell, self.token)
            .then(|| AGENT_BLOCK.to_string())
    }

    fn dig(&mut self, face: Face) -> bool {
        let cell = self.face_cell(face);
        let mut inner = self.world.lock();
        if inner.occupied(cell, self.token) {
            return false;
        }
        match inner.blocks.get(&cell) {
            Some(name) if name.as_str() == BEDROCK => false,
            Some(_) => {
                let name = inner.blocks.remove(&cell).unwrap_or_default();
                inner.chests.remove(&cell);
                drop(inner);
                self.store_stack(ItemStack { name, count: 1 });
                true
            }
            None => false,
        }
    }

    fn attack(&mut self, _face: Face) -> bool {
        // No mobs in the simulation.
        false
    }

    fn fuel_level(&self) -> u32 {
        self.fuel
    }

    fn refuel_from(&mut self, slot: usize) -> u32 {
        let Some(Some(stack)) = self.inventory.get(slot).cloned() else {
            return 0;
        };
        let per_item = burn_value(&stack.name);
        if per_item == 0 {
            return 0;
        }
        let gained = per_item * stack.count;
        self.fuel += gained;
        self.inventory[slot] = None;
        gained
    }

    fn suck(&mut self) -> bool {
        let cell = self.face_cell(Face::Forward);
        let mut inner = self.world.lock();
        let Some(chest) = inner.chests.get_mut(&cell) else {
            return false;
        };
        let Some(stack) = chest.pop() else {
            return false;
        };
        drop(inner);
        if self.store_stack(stack.clone()) {
            true
        } else {
            // Inventory full: put it back.
            let mut inner = self.world.lock();
            if let Some(chest) = inner.chests.get_mut(&cell) {
                chest.push(stack);
            }
            false
        }
    }

    fn drop_slot(&mut self, slot: usize) -> bool {
        let Some(Some(stack)) = self.inventory.get(slot).cloned() else {
            return false;
        };
        self.inventory[slot] = None;
        let cell = self.face_cell(Face::Forward);
        let mut inner = self.world.lock();
        if let Some(chest) = inner.chests.get_mut(&cell) {
            chest.push(stack);
        }
        // Without a chest the stack just scatters on the ground.
        true
    }

    fn slot(&self, slot: usize) -> Option<ItemStack> {
        self.inventory.get(slot).cloned().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automine_common::types::QuarryId;

    fn flat_world() -> SimWorld {
        let world = SimWorld::new();
        for x in -2..=2 {
            for z in -2..=2 {
                world.set_block(Position::new(x, -1, z), BEDROCK);
            }
        }
        world
    }

    #[test]
    fn movement_consumes_fuel_and_respects_blocks() {
        let world = flat_world();
        let mut rig = SimRig::new(&world, Position::ORIGIN, Direction::PosZ, 2);

        assert!(rig.forward());
        assert_eq!(rig.position(), Position::new(0, 0, 1));
        assert_eq!(rig.fuel_level(), 1);

        world.set_block(Position::new(0, 0, 2), STONE);
        assert!(!rig.forward());
        assert!(rig.dig(Face::Forward));
        assert!(rig.forward());
        assert_eq!(rig.fuel_level(), 0);
        assert!(!rig.forward());
    }

    #[test]
    fn agents_block_each_other_but_cannot_be_dug() {
        let world = flat_world();
        let mut top = SimRig::new(&world, Position::new(0, 1, 0), Direction::PosZ, 10);
        let _bottom = SimRig::new(&world, Position::ORIGIN, Direction::PosZ, 10);

        assert_eq!(top.detect(Face::Down).as_deref(), Some(AGENT_BLOCK));
        assert!(!top.dig(Face::Down));
        assert!(!top.down());
    }

    #[test]
    fn chest_roundtrip_and_refuel() {
        let world = flat_world();
        world.add_chest(
            Position::new(0, 0, 1),
            vec![ItemStack {
                name: "minecraft:coal".into(),
                count: 2,
            }],
        );
        let mut rig = SimRig::new(&world, Position::ORIGIN, Direction::PosZ, 0);

        assert!(rig.suck());
        assert_eq!(rig.slot(0).expect("stack").count, 2);
        assert_eq!(rig.refuel_from(0), 160);
        assert_eq!(rig.fuel_level(), 160);
        assert!(rig.slot(0).is_none());

        rig.give(ItemStack {
            name: "minecraft:cobblestone".into(),
            count: 5,
        });
        assert!(rig.drop_slot(0));
        assert_eq!(world.chest_contents(Position::new(0, 0, 1)).len(), 1);
    }

    #[test]
    fn quarry_builder_places_chests_and_clears_spawn() {
        let config = QuarryConfig::defaults(QuarryId::from("alpha"));
        let world = SimWorld::quarry(&config, 4);

        assert_eq!(world.block(config.fuel_chest_offset).as_deref(), Some(CHEST));
        assert_eq!(
            world.block(config.deposit_chest_offset).as_deref(),
            Some(CHEST)
        );
        assert!(world.block(Position::new(0, 3, 0)).is_none());
        assert_eq!(
            world.block(Position::new(1, 0, 1)).as_deref(),
            Some(STONE)
        );
        assert_eq!(world.chest_contents(config.fuel_chest_offset).len(), 4);
    }
}

//! The native actuator surface.
//!
//! A [`Rig`] is the block-level robot under the coordinator: it moves one
//! cell at a time, digs, and shuffles inventory, with no notion of
//! turtle-space, journals, or the fleet. The movement layer is the only code
//! that touches it directly, and everything above reasons purely in tracked
//! poses. Production agents bind the real robot API here; tests and `--sim`
//! runs use [`crate::sim::SimRig`].

use automine_common::types::Face;

/// One inventory slot's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemStack {
    pub name: String,
    pub count: u32,
}

/// Number of inventory slots on a standard rig.
pub const SLOT_COUNT: usize = 16;

/// Whether a detected block is actually a peer agent sitting in the cell.
/// Robot housings report as turtle blocks, whatever their variant suffix.
pub fn is_agent_block(name: &str) -> bool {
    name.contains("turtle")
}

pub trait Rig: Send + 'static {
    /// Attempt one cell forward. `false` means obstructed (or out of fuel);
    /// the caller decides whether to clear and retry.
    fn forward(&mut self) -> bool;
    fn back(&mut self) -> bool;
    fn up(&mut self) -> bool;
    fn down(&mut self) -> bool;

    /// Turns always succeed.
    fn turn_left(&mut self);
    fn turn_right(&mut self);

    /// Name of the block on the given face, if any.
    fn detect(&mut self, face: Face) -> Option<String>;
    /// Break the block on the given face. `false` if there was nothing to
    /// break or it resisted (bedrock, a peer).
    fn dig(&mut self, face: Face) -> bool;
    /// Swing at whatever entity occupies the face. Used to clear mobs that
    /// block movement without being blocks.
    fn attack(&mut self, face: Face) -> bool;

    fn fuel_level(&self) -> u32;
    /// Consume the stack in `slot` as fuel; returns units gained (0 if the
    /// item does not burn).
    fn refuel_from(&mut self, slot: usize) -> u32;

    /// Pull one stack from the container on the forward face into the first
    /// empty slot. `false` when the container is empty or inventory is full.
    fn suck(&mut self) -> bool;
    /// Push the stack in `slot` into the container on the forward face (or
    /// onto the ground if there is none). `false` if the slot was empty.
    fn drop_slot(&mut self, slot: usize) -> bool;
    fn slot(&self, slot: usize) -> Option<ItemStack>;
}

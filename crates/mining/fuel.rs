//! Spawn-column refuel and deposit protocols, plus worst-case fuel
//! accounting.
//!
//! Both chests sit behind the spawn column; an agent services them from the
//! adjacent in-box cell, facing opposite the spawn direction. Exchanges are
//! single bounded steps: navigation to the station happens beforehand via
//! the navigator.

use tracing::{debug, info};

use automine_common::types::{Direction, JobPayload, Position, QuarryConfig};
use automine_storage::JournalOp;

use crate::error::StepError;
use crate::movement::Movement;
use crate::rig::{Rig, SLOT_COUNT};

/// Upper bound on suck rounds in one exchange, over and above the slot
/// count, so a bottomless chest cannot pin the agent in the exchange step.
const MAX_EXCHANGE_ROUNDS: u32 = 64;

/// The cell an agent stands on to service a chest, and the facing required.
pub fn station(chest: Position, config: &QuarryConfig) -> (Position, Direction) {
    (
        chest.stepped(config.spawn_facing),
        config.spawn_facing.opposite(),
    )
}

/// Worst-case fuel for one job from the given position.
pub fn estimated_cost(payload: &JobPayload, from: Position, config: &QuarryConfig) -> u32 {
    match payload {
        JobPayload::Recall => from.manhattan(Position::ORIGIN),
        JobPayload::Refuel => {
            let (cell, _) = station(config.fuel_chest_offset, config);
            from.manhattan(cell)
        }
        JobPayload::OreMine { observation } => {
            // Reach the vein, then the flood-fill worst case.
            from.manhattan(observation.pos) + 2 * config.flood_fill_cap
        }
        JobPayload::TunnelMine { tunnel } => {
            let entry = tunnel.origin.translated(0, 0, tunnel.progress as i32);
            // Per corridor cell: the forward step plus the ceiling-scan hop.
            from.manhattan(entry) + 4 * tunnel.remaining()
        }
    }
}

/// A job may only be claimed with enough fuel to run it *and* still get
/// home: `estimate + manhattan(pose, spawn) + safety_margin`.
pub fn claimable(payload: &JobPayload, from: Position, fuel: u32, config: &QuarryConfig) -> bool {
    let needed = estimated_cost(payload, from, config)
        .saturating_add(from.manhattan(Position::ORIGIN))
        .saturating_add(config.safety_margin);
    fuel >= needed
}

/// Exchange at the fuel chest: burn carried fuel, suck more, push non-fuel
/// strays back, until the tank reaches the target or the chest runs dry
/// (surfaced as [`StepError::ChestEmpty`] so the caller requeues with
/// backoff). Assumes the agent is standing on the fuel station cell.
pub fn refuel_exchange<R: Rig>(mv: &mut Movement<'_, R>) -> Result<u32, StepError> {
    let (_, face_dir) = station(mv.config.fuel_chest_offset, mv.config);
    mv.turn_to(face_dir)?;

    let id = mv.journal.begin(JournalOp::Refuel)?;
    let target = mv.config.fuel_target;
    let before = mv.rig.fuel_level();
    let mut rounds = 0u32;
    while mv.rig.fuel_level() < target && rounds < MAX_EXCHANGE_ROUNDS {
        rounds += 1;
        burn_carried(mv);
        if mv.rig.fuel_level() >= target {
            break;
        }
        if !mv.rig.suck() {
            break;
        }
    }
    // Anything inedible that came out of the chest goes straight back.
    for slot in 0..SLOT_COUNT {
        if let Some(stack) = mv.rig.slot(slot)
            && !mv.config.is_fuel(&stack.name)
        {
            mv.rig.drop_slot(slot);
        }
    }
    let gained = mv.rig.fuel_level().saturating_sub(before);
    mv.journal.complete(id)?;

    if mv.rig.fuel_level() >= target {
        info!(gained, level = mv.rig.fuel_level(), "refueled to target");
        Ok(gained)
    } else {
        debug!(gained, level = mv.rig.fuel_level(), "fuel chest ran dry");
        Err(StepError::ChestEmpty)
    }
}

/// Exchange at the deposit chest: push everything except a fuel reserve of
/// up to `keep_fuel_items` items. Assumes the agent is standing on the
/// deposit station cell.
pub fn deposit_exchange<R: Rig>(mv: &mut Movement<'_, R>) -> Result<u32, StepError> {
    let (_, face_dir) = station(mv.config.deposit_chest_offset, mv.config);
    mv.turn_to(face_dir)?;

    let id = mv.journal.begin(JournalOp::Deposit)?;
    let mut kept_fuel = 0u32;
    let mut dropped = 0u32;
    for slot in 0..SLOT_COUNT {
        let Some(stack) = mv.rig.slot(slot) else {
            continue;
        };
        if mv.config.is_fuel(&stack.name) && kept_fuel < mv.config.keep_fuel_items {
            kept_fuel += stack.count;
            continue;
        }
        if mv.rig.drop_slot(slot) {
            dropped += 1;
        }
    }
    mv.journal.complete(id)?;
    debug!(dropped, kept_fuel, "deposited inventory");
    Ok(dropped)
}

fn burn_carried<R: Rig>(mv: &mut Movement<'_, R>) {
    for slot in 0..SLOT_COUNT {
        if mv.rig.fuel_level() >= mv.config.fuel_target {
            return;
        }
        if let Some(stack) = mv.rig.slot(slot)
            && mv.config.is_fuel(&stack.name)
        {
            mv.rig.refuel_from(slot);
        }
    }
}

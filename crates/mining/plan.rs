//! The shared tunnel plan.
//!
//! The plan is enumerated deterministically from the configuration, so every
//! agent derives the same tunnel ids for the same quarry. Claim transitions
//! funnel through whichever agent currently acts as leader; followers hold a
//! replica updated by `assign` messages and releases. These helpers contain
//! every transition rule, including the reconciliation for claims duplicated
//! across a leadership split.

use tracing::{debug, info, warn};

use automine_common::types::{AgentId, Position, QuarryConfig, Tunnel, TunnelId, TunnelState};

/// Tile the bounding box: one tunnel per `(x, y)` lattice point, extending
/// along +z. Spacing minimums guarantee the two-cell air gap between any two
/// corridors. Corridors are two cells tall, so a layer is only planned where
/// its headroom row still fits inside the box.
pub fn enumerate(config: &QuarryConfig) -> Vec<Tunnel> {
    let mut tunnels = Vec::new();
    let mut id = 0u32;
    let mut y = 0i32;
    while y + 1 <= config.bounds.max_y as i32 {
        let mut x = 0i32;
        while x <= config.bounds.max_x as i32 {
            tunnels.push(Tunnel::new(
                TunnelId(id),
                Position::new(x, y, 0),
                config.chunk_length,
            ));
            id += 1;
            x += config.tunnel_spacing as i32;
        }
        y += config.layer_spacing as i32;
    }
    tunnels
}

/// Re-enumerate after a configuration change, carrying progress and state
/// over for tunnels whose origin survived into the new plan.
pub fn merge_after_config_change(old: &[Tunnel], config: &QuarryConfig) -> Vec<Tunnel> {
    let mut fresh = enumerate(config);
    for tunnel in &mut fresh {
        if let Some(prior) = old.iter().find(|t| t.origin == tunnel.origin) {
            tunnel.progress = prior.progress.min(tunnel.length);
            tunnel.state = if matches!(prior.state, TunnelState::Done)
                && tunnel.progress < tunnel.length
            {
                // The tunnel got longer; there is work again.
                TunnelState::Idle
            } else {
                prior.state
            };
            tunnel.claimed_by = prior.claimed_by;
        }
    }
    fresh
}

pub fn find(tunnels: &[Tunnel], id: TunnelId) -> Option<&Tunnel> {
    tunnels.iter().find(|t| t.id == id)
}

pub fn find_mut(tunnels: &mut [Tunnel], id: TunnelId) -> Option<&mut Tunnel> {
    tunnels.iter_mut().find(|t| t.id == id)
}

/// Leader-side claim: hand the first idle tunnel to `agent`.
pub fn claim_first_idle(tunnels: &mut [Tunnel], agent: AgentId) -> Option<Tunnel> {
    let tunnel = tunnels.iter_mut().find(|t| t.is_idle())?;
    tunnel.state = TunnelState::Claimed;
    tunnel.claimed_by = Some(agent);
    info!(tunnel = %tunnel.id, %agent, "tunnel claimed");
    Some(tunnel.clone())
}

/// Follower-side replica update for an `assign` observed on the bus.
pub fn adopt_assignment(tunnels: &mut Vec<Tunnel>, assigned: &Tunnel) {
    match find_mut(tunnels, assigned.id) {
        Some(tunnel) => *tunnel = assigned.clone(),
        None => {
            // Plans can briefly disagree across config versions; keep the
            // record rather than dropping a live claim on the floor.
            tunnels.push(assigned.clone());
        }
    }
}

/// Leader-side release handling, including reconciliation of claims handed
/// out twice by a split leadership: the further-progressed holder keeps the
/// tunnel, ties going to the lower agent id.
pub fn apply_release(
    tunnels: &mut [Tunnel],
    id: TunnelId,
    progress: u32,
    state: TunnelState,
    by: AgentId,
) {
    let Some(tunnel) = find_mut(tunnels, id) else {
        warn!(tunnel = %id, %by, "release for unknown tunnel ignored");
        return;
    };
    if let Some(holder) = tunnel.claimed_by
        && holder != by
    {
        let releaser_wins = progress > tunnel.progress || (progress == tunnel.progress && by < holder);
        if !releaser_wins {
            debug!(
                tunnel = %id,
                %holder,
                %by,
                "duplicate claim resolved for the current holder"
            );
            return;
        }
        warn!(tunnel = %id, loser = %holder, winner = %by, "duplicate claim resolved");
    }
    tunnel.progress = tunnel.progress.max(progress);
    tunnel.state = state;
    tunnel.claimed_by = match state {
        TunnelState::Claimed | TunnelState::Active => Some(by),
        TunnelState::Idle | TunnelState::Done => None,
    };
    debug!(tunnel = %id, ?state, progress = tunnel.progress, "release applied");
}

/// Return claims held by agents missing from `live` to the idle pool.
/// Invoked by the acting leader when the membership view changes.
pub fn release_dead_claims(tunnels: &mut [Tunnel], live: &[AgentId]) -> Vec<TunnelId> {
    let mut released = Vec::new();
    for tunnel in tunnels.iter_mut() {
        if let Some(holder) = tunnel.claimed_by
            && !live.contains(&holder)
        {
            info!(tunnel = %tunnel.id, %holder, "reclaiming tunnel from dead peer");
            tunnel.state = TunnelState::Idle;
            tunnel.claimed_by = None;
            released.push(tunnel.id);
        }
    }
    released
}

//! Fleet-level scenarios: real workers, an in-memory bus segment, and one
//! shared simulated world.

use std::time::Duration;

use serial_test::serial;
use spawned_concurrency::tasks::GenServerHandle;

use automine_bus::{Bus, BusHub, Message, RESTART_SEQ_SKIP};
use automine_common::types::{AgentId, JobKind, Position, QuarryConfig, QuarryId, TunnelState};
use automine_common::utils::unix_now_ms;
use automine_mining::worker::{CallMessage, InMessage, OutMessage, WorkerSnapshot};
use automine_mining::{SimRig, SimWorld, Worker};
use automine_storage::Store;

const TICK: Duration = Duration::from_millis(20);

fn fleet_config(quarry: &str) -> QuarryConfig {
    let mut config = QuarryConfig::defaults(QuarryId::from(quarry));
    config.heartbeat_interval_ms = 100;
    config.heartbeat_timeout_ms = 500;
    config.fuel_reserve = 50;
    config.fuel_target = 300;
    config
}

struct Agent {
    _datadir: tempfile::TempDir,
    handle: GenServerHandle<Worker<SimRig>>,
}

async fn start_agent(
    hub: &BusHub,
    world: &SimWorld,
    config: &QuarryConfig,
    id: u64,
    spawn_height: i32,
) -> Agent {
    let datadir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(datadir.path()).expect("store");
    let bus = Bus::in_memory(hub, config.quarry_id.clone(), AgentId(id), 0);
    let rig = SimRig::new(
        world,
        Position::new(0, spawn_height, 0),
        config.spawn_facing,
        800,
    );
    let handle = Worker::spawn(store, config.clone(), bus, rig, TICK)
        .await
        .expect("worker spawn");
    Agent {
        _datadir: datadir,
        handle,
    }
}

async fn snapshot_of(handle: &mut GenServerHandle<Worker<SimRig>>) -> WorkerSnapshot {
    let OutMessage::Snapshot(snapshot) = handle
        .call(CallMessage::Snapshot)
        .await
        .expect("snapshot call");
    *snapshot
}

async fn snapshot(agent: &mut Agent) -> WorkerSnapshot {
    snapshot_of(&mut agent.handle).await
}

/// Poll until `check` passes or the deadline expires; panics with `what` on
/// timeout. Containment is asserted on every sample along the way.
async fn wait_for(
    agents: &mut [Agent],
    config: &QuarryConfig,
    what: &str,
    timeout: Duration,
    mut check: impl FnMut(&[WorkerSnapshot]) -> bool,
) -> Vec<WorkerSnapshot> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let mut snapshots = Vec::new();
        for agent in agents.iter_mut() {
            snapshots.push(snapshot(agent).await);
        }
        for snap in &snapshots {
            if snap.calibrated {
                assert!(
                    config.bounds.contains(snap.pose.pos),
                    "agent {} left the box at {}",
                    snap.agent_id,
                    snap.pose
                );
            }
        }
        if check(&snapshots) {
            return snapshots;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}: {snapshots:#?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn operator_bus(hub: &BusHub, config: &QuarryConfig) -> Bus {
    Bus::in_memory(
        hub,
        config.quarry_id.clone(),
        AgentId(u64::MAX),
        unix_now_ms(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn two_agents_share_the_plan_and_answer_a_recall() {
    let config = fleet_config("fleet-a");
    let hub = BusHub::new();
    let world = SimWorld::quarry(&config, 16);

    // Agent 1 lands on the floor; agent 2 stacks above and waits it out.
    let a = start_agent(&hub, &world, &config, 1, 0).await;
    let b = start_agent(&hub, &world, &config, 2, 1).await;
    let mut agents = [a, b];

    // Election converges on the lowest id, from both points of view, and
    // each agent sees the other in its live fleet view.
    wait_for(
        &mut agents,
        &config,
        "leader election",
        Duration::from_secs(10),
        |snaps| {
            snaps.iter().all(|s| s.leader == AgentId(1))
                && snaps.iter().all(|s| s.fleet.len() == 1)
        },
    )
    .await;

    // Both agents end up holding distinct tunnels via the leader mutex.
    let snaps = wait_for(
        &mut agents,
        &config,
        "distinct tunnel claims",
        Duration::from_secs(30),
        |snaps| {
            let plan = &snaps[0].tunnels;
            let held_1 = plan
                .iter()
                .filter(|t| t.claimed_by == Some(AgentId(1)))
                .count();
            let held_2 = plan
                .iter()
                .filter(|t| t.claimed_by == Some(AgentId(2)))
                .count();
            held_1 >= 1 && held_2 >= 1
        },
    )
    .await;
    // Mutex invariant on the leader's replica: no tunnel has two holders,
    // trivially true per record; check claim states are coherent.
    for tunnel in &snaps[0].tunnels {
        if tunnel.claimed_by.is_some() {
            assert!(matches!(
                tunnel.state,
                TunnelState::Claimed | TunnelState::Active
            ));
        }
    }

    // Operator recall: everyone parks on the spawn column within bounded time.
    let mut operator = operator_bus(&hub, &config);
    operator
        .broadcast(Message::Recall { active: true })
        .await
        .expect("recall broadcast");

    wait_for(
        &mut agents,
        &config,
        "fleet parked",
        Duration::from_secs(60),
        |snaps| {
            snaps.iter().all(|s| {
                s.recall_active && s.status == "parked" && s.pose.pos.x == 0 && s.pose.pos.z == 0
            })
        },
    )
    .await;

    // Clearing the recall puts the fleet back to work.
    operator
        .broadcast(Message::Recall { active: false })
        .await
        .expect("recall clear");
    wait_for(
        &mut agents,
        &config,
        "recall cleared",
        Duration::from_secs(10),
        |snaps| snaps.iter().all(|s| !s.recall_active),
    )
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn restart_resumes_tunnel_at_persisted_progress() {
    let mut config = fleet_config("fleet-restart");
    config.chunk_length = 12;
    let quarry = config.quarry_id.clone();
    let hub = BusHub::new();
    let world = SimWorld::quarry(&config, 16);
    let datadir = tempfile::tempdir().expect("tempdir");

    let store = Store::open(datadir.path()).expect("store");
    let bus = Bus::in_memory(&hub, quarry.clone(), AgentId(1), 0);
    let rig = SimRig::new(&world, Position::ORIGIN, config.spawn_facing, 800);
    let mut handle = Worker::spawn(store, config.clone(), bus, rig, TICK)
        .await
        .expect("worker spawn");

    // Mine until the held tunnel shows real progress, then stop the agent
    // the way a chunk unload would.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        let snap = snapshot_of(&mut handle).await;
        // Stop inside a wide window so the claim is still held when the
        // shutdown lands a tick or two later.
        let progressed = snap.tunnels.iter().any(|t| {
            t.claimed_by == Some(AgentId(1)) && t.progress >= 2 && t.progress + 4 <= t.length
        });
        if progressed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no tunnel progress: {snap:#?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    handle.cast(InMessage::Shutdown).await.expect("shutdown");
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Restart from the persisted state: same datadir, same world, the rig
    // standing exactly where the store says it stopped.
    let store = Store::open(datadir.path()).expect("store");
    let persisted = store
        .load_state()
        .expect("load")
        .expect("state survived the stop");
    assert!(persisted.calibrated);
    let held = persisted
        .tunnels
        .iter()
        .find(|t| t.claimed_by == Some(AgentId(1)))
        .expect("claim survived the stop")
        .clone();

    let bus = Bus::in_memory(
        &hub,
        quarry,
        AgentId(1),
        persisted.bus_seq + RESTART_SEQ_SKIP,
    );
    let rig = SimRig::new(&world, persisted.pose.pos, persisted.pose.dir, 800);
    let mut handle = Worker::spawn(store, config, bus, rig, TICK)
        .await
        .expect("worker respawn");

    // The tunnel resumes at the persisted progress (never resets, so no
    // double-mining) and runs to completion.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        let snap = snapshot_of(&mut handle).await;
        let tunnel = snap
            .tunnels
            .iter()
            .find(|t| t.id == held.id)
            .expect("tunnel still planned");
        assert!(
            tunnel.progress >= held.progress,
            "progress regressed: {} < {}",
            tunnel.progress,
            held.progress
        );
        if tunnel.state == TunnelState::Done {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "tunnel never completed: {snap:#?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn bounding_box_shrink_recalls_strays() {
    let mut config = fleet_config("fleet-b");
    config.bounds.max_z = 16;
    config.chunk_length = 8;
    let hub = BusHub::new();
    let world = SimWorld::quarry(&config, 16);

    let agent = start_agent(&hub, &world, &config, 1, 0).await;
    let mut agents = [agent];

    // Let the agent mine deep enough that the shrunk box excludes it.
    wait_for(
        &mut agents,
        &config,
        "tunnel depth",
        Duration::from_secs(60),
        |snaps| snaps[0].pose.pos.z >= 5,
    )
    .await;

    let mut shrunk = config.clone();
    shrunk.config_version = config.config_version + 1;
    shrunk.bounds = automine_common::types::BoundingBox::new(4, 4, 4);
    shrunk.chunk_length = 4;
    shrunk.validate().expect("shrunk config is valid");

    let mut operator = operator_bus(&hub, &config);
    operator
        .broadcast(Message::ConfigUpdate {
            config: shrunk.clone(),
        })
        .await
        .expect("config broadcast");

    // The agent adopts the new version, retreats inside the new box, and
    // parks on the column with the recall flag raised. (Containment is
    // asserted against the new bounds only after adoption.)
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        let snap = snapshot(&mut agents[0]).await;
        if snap.config_version == shrunk.config_version
            && shrunk.bounds.contains(snap.pose.pos)
            && snap.pose.pos.x == 0
            && snap.pose.pos.z == 0
            && snap.recall_active
            && snap.status == "parked"
        {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("agent never retreated: {snap:#?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Clearing the recall puts the agent back on tunnel work, now confined
    // to the shrunk box.
    operator
        .broadcast(Message::Recall { active: false })
        .await
        .expect("recall clear");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        let snap = snapshot(&mut agents[0]).await;
        assert!(
            shrunk.bounds.contains(snap.pose.pos),
            "agent left the shrunk box at {}",
            snap.pose
        );
        if !snap.recall_active && snap.active == Some(JobKind::TunnelMine) {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("agent never resumed mining: {snap:#?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

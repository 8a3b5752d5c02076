use std::{
    io::{self, IsTerminal, Write},
    net::SocketAddr,
    str::FromStr,
    time::Duration,
};

use futures::StreamExt;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Directive, fmt, layer::SubscriberExt};

use automine_bus::{Bus, BusError, Message, RESTART_SEQ_SKIP};
use automine_common::types::{AgentId, ConfigError, Position, QuarryConfig, QuarryId};
use automine_common::utils::unix_now_ms;
use automine_mining::{SimRig, SimWorld, Worker, WorkerError};
use automine_storage::{AgentState, JournalError, Store, StoreError};

use crate::cli::{LogColor, Options};

/// Sender id used by operator commands (`recall`, `configure`). Never
/// heartbeats, so it can never become leader.
const OPERATOR_ID: AgentId = AgentId(u64::MAX);

const CONFIG_FETCH_ATTEMPTS: u32 = 5;
const CONFIG_FETCH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CliError {
    /// Unrecoverable journal corruption gets its own exit code so wrappers
    /// can page an operator instead of restarting in a loop.
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Worker(WorkerError::Journal(JournalError::Corrupt { .. })) => 2,
            _ => 1,
        }
    }
}

/// Returns the file-appender guard; dropping it flushes the operator log.
pub fn init_tracing(opts: &Options) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    let use_color = match opts.log_color {
        LogColor::Always => true,
        LogColor::Never => false,
        LogColor::Auto => io::stdout().is_terminal(),
    };

    let fmt_layer = fmt::layer().with_target(false).with_ansi(use_color);

    let (file_layer, guard) = if let Some(log_dir) = &opts.log_dir {
        if !log_dir.exists() {
            std::fs::create_dir_all(log_dir).expect("Failed to create log directory");
        }
        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(log_dir.join("automine.log"))
            .expect("Failed to open log file");
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let file_layer = fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(non_blocking);
        (Some(file_layer), Some(guard))
    } else {
        (None, None)
    };

    let subscriber =
        Registry::default().with(fmt_layer.and_then(file_layer).with_filter(log_filter));
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
    guard
}

fn resolve_agent_id(opts: &Options, persisted: Option<&AgentState>) -> AgentId {
    if let Some(id) = opts.agent_id {
        return AgentId(id);
    }
    if let Some(state) = persisted {
        return state.agent_id;
    }
    // First boot with no explicit id: pick one and let the worker persist it.
    let id = rand::thread_rng().gen_range(1..10_000u64);
    info!(id, "generated agent id");
    AgentId(id)
}

async fn init_bus(
    opts: &Options,
    quarry: QuarryId,
    agent_id: AgentId,
    persisted_seq: u64,
) -> Result<Bus, BusError> {
    Bus::udp(
        SocketAddr::new(opts.bus_addr, opts.bus_port),
        SocketAddr::new(opts.bus_broadcast, opts.bus_port),
        quarry,
        agent_id,
        persisted_seq + RESTART_SEQ_SKIP,
    )
    .await
}

/// An ephemeral bus endpoint for one-shot operator commands. Seeded with the
/// wall clock so back-to-back invocations keep passing receiver dedupe.
async fn operator_bus(opts: &Options, quarry: QuarryId) -> Result<Bus, BusError> {
    Bus::udp(
        SocketAddr::new(opts.bus_addr, 0),
        SocketAddr::new(opts.bus_broadcast, opts.bus_port),
        quarry,
        OPERATOR_ID,
        unix_now_ms(),
    )
    .await
}

/// Local config if present, otherwise ask the fleet for it.
async fn obtain_config(
    store: &Store,
    quarry: &QuarryId,
    bus: &mut Bus,
) -> Result<QuarryConfig, CliError> {
    if let Some(config) = store.load_config(quarry)? {
        return Ok(config);
    }
    info!(%quarry, "no local configuration, asking peers");
    let mut incoming = bus.incoming();
    for attempt in 1..=CONFIG_FETCH_ATTEMPTS {
        bus.broadcast(Message::ConfigRequest).await?;
        let local = bus.local();
        let response = tokio::time::timeout(CONFIG_FETCH_TIMEOUT, async {
            while let Some(envelope) = incoming.next().await {
                if !envelope.accepted_by(local, quarry) {
                    continue;
                }
                if let Message::ConfigResponse { config } | Message::ConfigUpdate { config } =
                    envelope.message
                {
                    return Some(config);
                }
            }
            None
        })
        .await;
        if let Ok(Some(config)) = response {
            info!(version = config.config_version, "configuration received");
            store.save_config(&config)?;
            return Ok(config);
        }
        debug!(attempt, "no configuration response");
    }
    Err(WorkerError::MissingConfig(quarry.clone()).into())
}

/// `automine start`: run one agent until interrupted.
pub async fn run_agent(opts: Options) -> Result<(), CliError> {
    let store = Store::open(&opts.datadir)?;
    let persisted = store.load_state()?;
    let quarry = QuarryId(opts.quarry.clone());
    let agent_id = resolve_agent_id(&opts, persisted.as_ref());
    let persisted_seq = persisted.as_ref().map_or(0, |state| state.bus_seq);

    let mut bus = init_bus(&opts, quarry.clone(), agent_id, persisted_seq).await?;
    let config = obtain_config(&store, &quarry, &mut bus).await?;

    // This build drives the simulated rig; the native robot binding plugs in
    // at the same trait seam.
    let world = SimWorld::quarry(&config, 8);
    let rig = SimRig::new(
        &world,
        Position::new(0, opts.sim_spawn_height as i32, 0),
        config.spawn_facing,
        opts.sim_fuel,
    );

    let _worker = Worker::spawn(
        store,
        config,
        bus,
        rig,
        Duration::from_millis(opts.tick_ms),
    )
    .await?;
    info!(agent = %agent_id, "agent running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    // Let the worker finish its shutdown save before the process exits.
    tokio::time::sleep(Duration::from_millis(300)).await;
    info!("bye");
    Ok(())
}

/// `automine recall <quarry>`: raise (or clear) the fleet-wide recall.
pub async fn run_recall(opts: &Options, quarry: String, clear: bool) -> Result<(), CliError> {
    let quarry = QuarryId(quarry);
    let mut bus = operator_bus(opts, quarry.clone()).await?;
    bus.broadcast(Message::Recall { active: !clear }).await?;
    if clear {
        info!(%quarry, "recall cleared");
    } else {
        info!(%quarry, "recall raised, agents will park on the spawn column");
    }
    Ok(())
}

/// `automine configure`: interactive wizard, then broadcast the result.
pub async fn run_configure(opts: &Options) -> Result<(), CliError> {
    let store = Store::open(&opts.datadir)?;
    let quarry = QuarryId(opts.quarry.clone());
    let existing = store.load_config(&quarry)?;

    let config = configure_wizard(&quarry, existing)?;
    config.validate()?;
    store.save_config(&config)?;
    info!(version = config.config_version, "configuration written");

    let mut bus = operator_bus(opts, quarry).await?;
    bus.broadcast(Message::ConfigUpdate { config }).await?;
    info!("configuration update broadcast");
    Ok(())
}

fn configure_wizard(
    quarry: &QuarryId,
    existing: Option<QuarryConfig>,
) -> Result<QuarryConfig, CliError> {
    let bumped_version = existing.as_ref().map_or(1, |c| c.config_version + 1);
    let mut config = existing.unwrap_or_else(|| QuarryConfig::defaults(quarry.clone()));
    config.config_version = bumped_version;

    println!("Configuring quarry {quarry} (version {bumped_version}).");
    println!("Enter to keep the value in brackets.");

    config.bounds.max_x = ask("bounding box max x", config.bounds.max_x)?;
    config.bounds.max_y = ask("bounding box max y", config.bounds.max_y)?;
    config.bounds.max_z = ask("bounding box max z", config.bounds.max_z)?;
    config.tunnel_spacing = ask("tunnel spacing (>= 3)", config.tunnel_spacing)?;
    config.layer_spacing = ask("layer spacing (>= 3)", config.layer_spacing)?;
    config.chunk_length = ask("tunnel length", config.chunk_length)?;
    config.fuel_reserve = ask("fuel reserve", config.fuel_reserve)?;
    config.fuel_target = ask("fuel target", config.fuel_target)?;
    config.keep_fuel_items = ask("fuel items kept on deposit", config.keep_fuel_items)?;
    config.max_job_failures = ask("max job failures", config.max_job_failures)?;
    config.flood_fill_cap = ask("vein flood-fill cap", config.flood_fill_cap)?;
    config.heartbeat_interval_ms = ask("heartbeat interval (ms)", config.heartbeat_interval_ms)?;
    config.heartbeat_timeout_ms = ask("heartbeat timeout (ms)", config.heartbeat_timeout_ms)?;
    println!("Fuel whitelist and ore tags can be edited in the written config file.");

    Ok(config)
}

fn ask<T: FromStr + std::fmt::Display>(label: &str, default: T) -> Result<T, CliError> {
    loop {
        print!("  {label} [{default}]: ");
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().read_line(&mut line)?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(default);
        }
        match trimmed.parse() {
            Ok(value) => return Ok(value),
            Err(_) => println!("  could not parse {trimmed:?}, try again"),
        }
    }
}

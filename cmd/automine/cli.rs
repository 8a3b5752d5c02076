use std::{fmt::Display, net::IpAddr, path::PathBuf, str::FromStr};

use clap::{ArgAction, Parser as ClapParser, Subcommand as ClapSubcommand};
use tracing::Level;

#[derive(ClapParser)]
#[command(
    name = "automine",
    author = "AutoMine contributors",
    version,
    about = "Cooperative quarry-mining fleet agent"
)]
pub struct CLI {
    #[command(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Option<Subcommand>,
}

#[derive(ClapParser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "datadir",
        value_name = "DATA_DIRECTORY",
        default_value = "automine-data",
        help = "Directory holding this agent's state, journal, and job ledger.",
        help_heading = "Agent options",
        env = "AUTOMINE_DATADIR"
    )]
    pub datadir: PathBuf,
    #[arg(
        long = "quarry",
        value_name = "QUARRY_ID",
        default_value = "default",
        help = "Coordination domain to join; agents only cooperate within one quarry.",
        help_heading = "Agent options",
        env = "AUTOMINE_QUARRY"
    )]
    pub quarry: String,
    #[arg(
        long = "agent-id",
        value_name = "ID",
        help = "Stable numeric agent id. Defaults to the persisted id, or a random one on first boot.",
        long_help = "Ids order the fleet: the live agent with the smallest id acts as leader. Must be unique per quarry.",
        help_heading = "Agent options",
        env = "AUTOMINE_AGENT_ID"
    )]
    pub agent_id: Option<u64>,
    #[arg(
        long = "tick.ms",
        value_name = "MILLISECONDS",
        default_value_t = 250,
        help = "Worker tick interval: one bounded job step per tick.",
        help_heading = "Agent options",
        env = "AUTOMINE_TICK_MS"
    )]
    pub tick_ms: u64,
    #[arg(
        long = "bus.addr",
        value_name = "ADDRESS",
        default_value = "0.0.0.0",
        help = "Bind address for the quarry bus socket.",
        help_heading = "Bus options",
        env = "AUTOMINE_BUS_ADDR"
    )]
    pub bus_addr: IpAddr,
    #[arg(
        long = "bus.port",
        value_name = "PORT",
        default_value_t = 17701,
        help = "UDP port shared by the quarry's broadcast segment.",
        help_heading = "Bus options",
        env = "AUTOMINE_BUS_PORT"
    )]
    pub bus_port: u16,
    #[arg(
        long = "bus.broadcast",
        value_name = "ADDRESS",
        default_value = "255.255.255.255",
        help = "Broadcast address datagrams are sent to.",
        help_heading = "Bus options",
        env = "AUTOMINE_BUS_BROADCAST"
    )]
    pub bus_broadcast: IpAddr,
    #[arg(
        long = "sim.fuel",
        value_name = "UNITS",
        default_value_t = 500,
        help = "Starting fuel for the simulated rig.",
        help_heading = "Simulation options",
        env = "AUTOMINE_SIM_FUEL"
    )]
    pub sim_fuel: u32,
    #[arg(
        long = "sim.spawn-height",
        value_name = "CELLS",
        default_value_t = 3,
        help = "How far above the floor the simulated rig starts on the spawn column.",
        help_heading = "Simulation options",
        env = "AUTOMINE_SIM_SPAWN_HEIGHT"
    )]
    pub sim_spawn_height: u32,
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        help = "Verbosity: error, warn, info, debug, trace.",
        help_heading = "Agent options",
        env = "AUTOMINE_LOG_LEVEL"
    )]
    pub log_level: Level,
    #[arg(
        long = "log.color",
        default_value_t = LogColor::Auto,
        help = "ANSI colors in log output: auto, always, never.",
        help_heading = "Agent options",
        env = "AUTOMINE_LOG_COLOR"
    )]
    pub log_color: LogColor,
    #[arg(
        long = "log.dir",
        value_name = "LOG_DIR",
        help = "Also append the operator log to a file in this directory.",
        help_heading = "Agent options",
        env = "AUTOMINE_LOG_DIR"
    )]
    pub log_dir: Option<PathBuf>,
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    #[command(about = "Run this agent until interrupted. The default when no command is given.")]
    Start,
    #[command(about = "Broadcast a recall so every agent returns to the spawn column.")]
    Recall {
        #[arg(value_name = "QUARRY_ID")]
        quarry: String,
        #[arg(
            long = "clear",
            action = ArgAction::SetTrue,
            help = "Lift the recall instead of raising it."
        )]
        clear: bool,
    },
    #[command(about = "Interactively write this quarry's configuration and broadcast the update.")]
    Configure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogColor {
    Auto,
    Always,
    Never,
}

impl Display for LogColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogColor::Auto => write!(f, "auto"),
            LogColor::Always => write!(f, "always"),
            LogColor::Never => write!(f, "never"),
        }
    }
}

impl FromStr for LogColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(LogColor::Auto),
            "always" => Ok(LogColor::Always),
            "never" => Ok(LogColor::Never),
            other => Err(format!("invalid log color {other:?}")),
        }
    }
}

use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "netlab", about = "Builds, converges and verifies emulated network labs")]
pub struct CliOpt {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Build the lab, run its tests and tear it down
    Run(RunOpt),
    /// Validate a lab file and print what would be built, without touching any substrate
    Check(CheckOpt),
}

#[derive(Parser, Debug, Clone)]
pub struct RunOpt {
    /// Path to the JSON file describing the lab
    #[arg(long)]
    pub lab: PathBuf,

    /// Where the lab is built
    #[arg(long, value_enum, default_value_t = Backend::Netns)]
    pub backend: Backend,

    /// Open an inspection shell after the tests, before tearing the lab down
    #[arg(long)]
    pub interactive: bool,

    /// Path to which the log of executed commands should be written, as JSON
    #[arg(long)]
    pub command_log: Option<PathBuf>,

    /// The random seed used by the simulated backend (governing packet loss)
    #[arg(long, default_value_t = 42)]
    pub network_rng_seed: u64,

    /// Prefix of the network namespaces created by the netns backend
    #[arg(long, default_value = "nl-")]
    pub namespace_prefix: String,

    #[command(flatten)]
    pub tunables: TunableOverrides,
}

#[derive(Parser, Debug, Clone)]
pub struct CheckOpt {
    /// Path to the JSON file describing the lab
    #[arg(long)]
    pub lab: PathBuf,

    #[command(flatten)]
    pub tunables: TunableOverrides,
}

/// Take precedence over the `tunables` section of the lab file
#[derive(Parser, Debug, Clone, Default)]
pub struct TunableOverrides {
    /// Time between two spanning tree status polls
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// How long to wait for the spanning tree to converge before going on with a warning
    #[arg(long)]
    pub convergence_timeout_ms: Option<u64>,

    /// Pause between the gateway configuration and the first test
    #[arg(long)]
    pub settle_delay_ms: Option<u64>,

    /// Maximum number of attempts per probe
    #[arg(long)]
    pub probe_count: Option<u32>,

    /// Time after which a single probe counts as lost
    #[arg(long)]
    pub probe_timeout_ms: Option<u64>,

    /// Duration of each throughput transfer
    #[arg(long)]
    pub throughput_duration_ms: Option<u64>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Network namespaces and Open vSwitch bridges on this machine (requires root)
    Netns,
    /// An in-memory model of the same tools, running on a paused clock
    Simulated,
}

impl Display for Backend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Netns => f.write_str("netns"),
            Backend::Simulated => f.write_str("simulated"),
        }
    }
}

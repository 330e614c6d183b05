//! Argument definitions for the `stagebox` binary.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "stagebox",
    about = "Staged provisioning for Shelly Gen3 device fleets",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args)]
pub struct GlobalOpts {
    /// Config file (default: platform config dir)
    #[arg(long, global = true, env = "STAGEBOX_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long = "verbose", global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[arg(short = 'o', long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    pub output: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Onboard factory-fresh devices over their access points
    Stage1(Stage1Args),

    /// Adopt discovered devices into the static address pool
    Stage2(StageArgs),

    /// Firmware updates and friendly-name reconciliation
    Stage3(StageArgs),

    /// Apply device-type profiles
    Stage4(StageArgs),

    /// Fleet snapshots
    #[command(subcommand)]
    Snapshot(SnapshotCommand),

    /// Compare the live fleet against a snapshot
    Audit(AuditArgs),

    /// Show the device registry
    Devices,
}

#[derive(Args)]
pub struct Stage1Args {
    /// Keep cycling until interrupted instead of running one cycle
    #[arg(long = "loop")]
    pub run_loop: bool,

    /// Report what would happen without configuring anything
    #[arg(long)]
    pub dry_run: bool,

    /// Only provision the device with this MAC
    #[arg(long)]
    pub mac: Option<String>,

    /// Wireless interface to use (autodetected when omitted)
    #[arg(long)]
    pub interface: Option<String>,
}

#[derive(Args)]
pub struct StageArgs {
    /// Report what would happen without changing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Only process the device with this MAC
    #[arg(long)]
    pub mac: Option<String>,
}

#[derive(Subcommand)]
pub enum SnapshotCommand {
    /// Scan the fleet and write a new snapshot bundle
    Take,

    /// List stored snapshot bundles
    List,
}

#[derive(Args)]
pub struct AuditArgs {
    /// Reference snapshot file (default: the latest)
    pub snapshot: Option<PathBuf>,
}

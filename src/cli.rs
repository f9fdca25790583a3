//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "t7flash")]
#[command(author, version, about = "LabJack T7 firmware upgrade tool", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the header of a firmware file
    Info {
        /// Firmware .bin file
        file: PathBuf,
    },

    /// List T7 devices reachable on the network
    List {
        /// Device address, repeatable (host or host:port)
        #[arg(long = "host", required = true)]
        hosts: Vec<String>,
    },

    /// Install a firmware file on a device
    Upgrade {
        /// Firmware .bin file
        file: PathBuf,

        /// Device address, repeatable (host or host:port)
        #[arg(long = "host", required = true)]
        hosts: Vec<String>,

        /// Serial number of the device to upgrade (required when several
        /// devices are reachable)
        #[arg(long)]
        serial: Option<u32>,

        /// Seconds between reboot and the first rediscovery scan, and
        /// between scans
        #[arg(long, default_value = "5")]
        grace: u64,

        /// Give up on rediscovery after this many seconds (0 waits forever)
        #[arg(long = "wait-timeout", default_value = "300")]
        wait_timeout: u64,

        /// Stop after the compatibility checks, without touching the device
        #[arg(long)]
        dry_run: bool,
    },
}

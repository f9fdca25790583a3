//! t7flash - LabJack T7 firmware upgrade tool
//!
//! Installs a firmware image on a T7 over its Modbus-TCP interface:
//! compatibility checks, flash erase and programming with full readback
//! verification, the upgrade reboot, and confirmation that the device
//! came back running the new version.
//!
//! A failure after programming has started leaves the device without
//! bootable firmware until a subsequent upgrade run succeeds; the
//! device-side bootloader stays reachable in that state.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use std::error::Error;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let result = match cli.command {
        Commands::Info { file } => commands::info::run_info(&file),
        Commands::List { hosts } => commands::list::run_list(hosts),
        Commands::Upgrade {
            file,
            hosts,
            serial,
            grace,
            wait_timeout,
            dry_run,
        } => commands::upgrade::run_upgrade(&file, hosts, serial, grace, wait_timeout, dry_run),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {}", cause);
            source = cause.source();
        }
        std::process::exit(1);
    }
}

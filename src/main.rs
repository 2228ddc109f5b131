// mose - configuration management injection engine
//
// Locates the control files of Ansible, Puppet, Salt and Chef, injects a
// payload reference so the tool distributes it to its managed nodes, and
// records every change so the run can be reverted.

mod backends;
mod backup;
mod cli;
mod config;
mod error;
mod ledger;
mod locator;
mod logger;
mod planner;
mod prompt;
mod runner;
mod safety;
mod templates;
mod tools;
mod utils;

use clap::Parser;
use cli::Cli;
use log::{error, info};
use std::{env, process};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Parse first so --debug can pick the log level
    let cli = Cli::parse();

    logger::init_logger(cli.debug);
    if cli.no_color || env::var_os("NO_COLOR").is_some() {
        colored::control::set_override(false);
    }

    info!("Starting mose v{}", env!("CARGO_PKG_VERSION"));

    match run_command(cli).await {
        Ok(_) => {
            info!("mose v{} finished", env!("CARGO_PKG_VERSION"));
            process::exit(0);
        }
        Err(e) => {
            error!("mose failed: {e}");
            process::exit(1);
        }
    }
}

async fn run_command(cli: Cli) -> Result<(), String> {
    let settings = config::load_config(cli.settings.as_deref())?;

    match cli.command.target() {
        None => runner::list_targets(),
        Some((tool, opts)) => {
            safety::check_environment()?;
            runner::run_target(tool, opts, &settings).await
        }
    }
}

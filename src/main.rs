mod cli;
mod commands;
mod config;
mod node;
mod paths;
mod pipeline;
mod platform;
mod progress;
mod role;
mod runner;
mod secrets;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub config: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        config: cli.config,
        state_dir: cli.state_dir,
    };

    match cli.command {
        Command::Converge(args) => {
            commands::converge::run(&ctx, args.role.role, args.dry_run, args.no_reboot)
        }
        Command::Plan(args) => commands::plan::run(&ctx, args.role),
        Command::Status { json } => commands::status::run(&ctx, json),
        Command::Reset { yes } => commands::reset::run(&ctx, yes),
        Command::Config(cmd) => commands::config::run(&ctx, cmd),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "hpcnode", &mut io::stdout());
            Ok(())
        }
    }
}

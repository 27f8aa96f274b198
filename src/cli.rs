use crate::paths::{ENV_CONFIG, ENV_STATE_DIR};
use crate::role::Role;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hpcnode")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Converge a Windows node into an HPC Pack cluster", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file
    #[arg(long, global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Directory holding the pass state and lock
    #[arg(long, global = true, env = ENV_STATE_DIR)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run one convergence pass for this node's role
    Converge(ConvergeArgs),

    /// Show which steps a pass would run, without changing anything
    Plan(RoleArg),

    /// Show the persisted progress of the current or last pass
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Forget all convergence progress so the next pass starts over
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Inspect the configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct RoleArg {
    /// Node role; overrides `role` in the config file
    #[arg(short, long, value_enum)]
    pub role: Option<Role>,
}

#[derive(Args)]
pub struct ConvergeArgs {
    #[command(flatten)]
    pub role: RoleArg,

    /// Evaluate guards only; same as `plan`
    #[arg(long)]
    pub dry_run: bool,

    /// Stop instead of restarting when a step needs a reboot
    #[arg(long)]
    pub no_reboot: bool,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration with secrets redacted
    Show,

    /// Check the configuration for a role
    Validate(RoleArg),
}

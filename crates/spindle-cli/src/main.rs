use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

mod command_flows;
mod completion;
mod core_flows;
mod dispatch;
mod logger;
mod metadata;
mod render;

#[derive(Parser, Debug)]
#[command(name = "spindle")]
#[command(about = "Source-based package manager with a dependency concretizer", long_about = None)]
struct Cli {
    /// Store root holding config.toml, install prefixes and the database.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Package repository to read declarations from.
    #[arg(long, global = true)]
    registry_root: Option<PathBuf>,
    /// Run against this environment.
    #[arg(short = 'e', long = "env", global = true)]
    env: Option<String>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Concretize a spec and print its dependency tree.
    Spec {
        spec: String,
        /// Print the concrete spec as JSON.
        #[arg(long)]
        json: bool,
    },
    Install {
        #[arg(required = true)]
        specs: Vec<String>,
    },
    Uninstall(UninstallArgs),
    /// Query installed specs.
    Find { spec: Option<String> },
    /// Installed specs that depend on the given one.
    Dependents {
        spec: String,
        #[arg(short, long)]
        transitive: bool,
    },
    /// Installed specs the given one depends on.
    Dependencies {
        spec: String,
        #[arg(short, long)]
        transitive: bool,
    },
    Info { name: String },
    /// List package names available in the registry.
    List { query: Option<String> },
    Env {
        #[command(subcommand)]
        command: EnvCommands,
    },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct UninstallArgs {
    specs: Vec<String>,
    /// Remove regardless of dependents and environments.
    #[arg(short, long)]
    force: bool,
    /// Also remove every installed dependent.
    #[arg(short = 'R', long)]
    dependents: bool,
    /// Do not ask for confirmation.
    #[arg(short = 'y', long = "yes-to-all")]
    yes_to_all: bool,
    /// Remove every match; with no specs, remove everything in scope.
    #[arg(short, long)]
    all: bool,
}

#[derive(Subcommand, Debug)]
enum EnvCommands {
    Create { name: String },
    List,
    /// Add root specs to an environment.
    Add {
        #[arg(required = true)]
        specs: Vec<String>,
    },
    /// Remove root specs from an environment.
    Remove {
        #[arg(required = true)]
        specs: Vec<String>,
    },
    Destroy {
        name: String,
        #[arg(short = 'y', long = "yes-to-all")]
        yes_to_all: bool,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliCompletionShell {
    Bash,
    Zsh,
    Fish,
    Powershell,
}

impl From<CliCompletionShell> for Shell {
    fn from(value: CliCompletionShell) -> Self {
        match value {
            CliCompletionShell::Bash => Shell::Bash,
            CliCompletionShell::Zsh => Shell::Zsh,
            CliCompletionShell::Fish => Shell::Fish,
            CliCompletionShell::Powershell => Shell::PowerShell,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init_logger(cli.verbose);
    dispatch::run_cli(cli)
}

#[cfg(test)]
mod tests;

//! Command-line interface definitions for baryon.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Recursive multi-package build orchestrator.
#[derive(Parser)]
#[command(name = "baryon", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Recursion depth marker; injected automatically into sub-package
    /// invocations.
    #[arg(long, global = true, default_value_t = 0, hide = true)]
    pub sublevel: u32,

    /// Override the build output directory.
    #[arg(long, short = 'b', global = true, value_name = "DIR")]
    pub build_base: Option<PathBuf>,

    /// Prefer in-tree prerequisite resolution over system locations.
    #[arg(long, global = true)]
    pub local_install: bool,

    /// Dispatch sub-package builds concurrently.
    #[arg(long, global = true)]
    pub parallel: bool,

    /// Maximum number of parallel workers (0 or omitted = auto-detect).
    #[arg(long, short = 'j', global = true)]
    pub jobs: Option<usize>,

    /// Re-probe all prerequisites, bypassing the environment cache.
    #[arg(long, short = 'f', global = true)]
    pub force: bool,

    /// Suppress progress output; show only errors and the final summary.
    #[arg(long, short = 'q', global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Enable verbose output with probe search details and timings.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Resolve prerequisites, build sub-packages, then run the native
    /// build pipeline.
    Build,
    /// Build and install the package and its sub-packages into a prefix.
    Install(InstallArgs),
    /// Remove build artifacts, recursively.
    Clean,
    /// Build, then run the declared test commands.
    Test(TestArgs),
    /// Report the package's full prerequisite list.
    Dependencies(DepsArgs),
}

/// Arguments for the `install` subcommand.
#[derive(Parser)]
pub struct InstallArgs {
    /// Installation prefix (defaults to `<root>/local` with
    /// --local-install).
    #[arg(long, value_name = "DIR")]
    pub prefix: Option<PathBuf>,
}

/// Arguments for the `test` subcommand.
#[derive(Parser)]
pub struct TestArgs {
    /// Extra arguments appended to every test command after `--`.
    #[arg(last = true)]
    pub extra_args: Vec<String>,
}

/// Arguments for the `dependencies` subcommand.
#[derive(Parser)]
pub struct DepsArgs {
    /// Also print each sub-package's own dependency list.
    #[arg(long, short = 's', alias = "show")]
    pub show_subpackages: bool,

    /// Render the full dependency graph as ASCII art.
    #[arg(long)]
    pub graph: bool,
}

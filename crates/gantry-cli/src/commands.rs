//! CLI command definitions.

use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a pipeline definition and expand its matrices
    Validate {
        /// Path to pipeline file
        #[arg(default_value = "gantry.yaml")]
        path: PathBuf,
    },

    /// Show stage order, dependencies and job instances
    Plan {
        /// Path to pipeline file
        #[arg(default_value = "gantry.yaml")]
        path: PathBuf,
    },

    /// Evaluate change detectors against a change-set
    Detect {
        /// Pipeline whose detector steps should be evaluated
        #[arg(short, long)]
        pipeline: Option<PathBuf>,

        /// Patterns of paths that do not count as relevant changes
        #[arg(long, conflicts_with = "include")]
        exclude: Vec<String>,

        /// Patterns of paths that count as relevant changes
        #[arg(long)]
        include: Vec<String>,

        #[command(flatten)]
        changes: ChangeArgs,
    },

    /// Execute a pipeline locally
    Run {
        /// Path to pipeline file
        #[arg(default_value = "gantry.yaml")]
        path: PathBuf,

        /// Override a pipeline parameter (name=value)
        #[arg(short, long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,

        /// Working directory for steps, logs and artifacts
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        /// Write the run report as JSON
        #[arg(short, long)]
        report: Option<PathBuf>,

        /// Maximum number of jobs running at once
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Stream step output
        #[arg(short, long)]
        verbose: bool,

        #[command(flatten)]
        changes: ChangeArgs,
    },

    /// Print the JSON schema of pipeline definitions
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Where the change-set comes from.
#[derive(Args, Debug, Clone, Default)]
pub struct ChangeArgs {
    /// File listing changed paths, one per line
    #[arg(long, conflicts_with = "base")]
    pub changes_file: Option<PathBuf>,

    /// Diff `<base>...HEAD` with git
    #[arg(long)]
    pub base: Option<String>,

    /// Changed paths given directly
    #[arg(long = "changed", value_name = "PATH")]
    pub paths: Vec<String>,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}

use clap::{Args, Parser, Subcommand, ValueEnum};

use std::path::PathBuf;

use super::constants::{
    DEFAULT_MANIFEST_FILE, DEFAULT_PLAN_DIR, ENV_DEST_CONFIG, ENV_LOG_FORMAT, ENV_SOURCE_CONFIG,
};

#[derive(Parser)]
#[command(name = "pgcatalog")]
#[command(
    version,
    about = "Migrate PostgreSQL roles, databases and database grants between servers",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log output format
    #[arg(long, global = true, env = ENV_LOG_FORMAT, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Options shared by every command that writes to the destination
#[derive(Args, Clone, Debug)]
pub struct ApplyArgs {
    /// Prepare statements without executing them
    #[arg(long)]
    pub dry_run: bool,

    /// Halt on the first warning or error
    #[arg(long)]
    pub stop_on_error: bool,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Snapshot roles, databases and grants of the source into a manifest
    Extract {
        /// Source connection config
        #[arg(long, env = ENV_SOURCE_CONFIG)]
        source: PathBuf,

        /// Manifest output file
        #[arg(long, default_value = DEFAULT_MANIFEST_FILE)]
        out: PathBuf,
    },
    /// Render a manifest into ordered SQL files
    Generate {
        /// Manifest to read
        #[arg(long = "in")]
        input: PathBuf,

        /// Output directory for the SQL files
        #[arg(long, default_value = DEFAULT_PLAN_DIR)]
        out: PathBuf,

        /// Skip grants to roles that were not migrated
        #[arg(long)]
        no_strict: bool,
    },
    /// Apply a manifest to the destination
    Apply {
        /// Destination connection config
        #[arg(long, env = ENV_DEST_CONFIG)]
        dest: PathBuf,

        /// Manifest to apply
        #[arg(long = "in")]
        input: PathBuf,

        #[command(flatten)]
        apply: ApplyArgs,

        /// Show the plan summary and ask before applying
        #[arg(long, short)]
        interactive: bool,

        /// Write the report here instead of stdout
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Compare effective database privileges of source and destination
    Validate {
        /// Source connection config
        #[arg(long, env = ENV_SOURCE_CONFIG)]
        source: PathBuf,

        /// Destination connection config
        #[arg(long, env = ENV_DEST_CONFIG)]
        dest: PathBuf,

        /// Write the report here instead of stdout
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Extract, generate, apply and validate in one run
    Migrate {
        /// Source connection config
        #[arg(long, env = ENV_SOURCE_CONFIG)]
        source: PathBuf,

        /// Destination connection config
        #[arg(long, env = ENV_DEST_CONFIG)]
        dest: PathBuf,

        #[command(flatten)]
        apply: ApplyArgs,

        /// Keep the manifest, SQL files and reports in this directory
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Copy, Default)]
pub struct CliConfig {
    pub log_format: LogFormat,
    pub verbose: u8,
}

/// Parse CLI arguments and return config with command
pub fn parse() -> (CliConfig, Commands) {
    let cli = Cli::parse();
    let config = CliConfig {
        log_format: cli.log_format,
        verbose: cli.verbose,
    };
    (config, cli.command)
}

use clap::{Parser, Subcommand};

use crate::config::SourceKind;

/// Sync SonarQube issues and DPy code smells onto a Kanboard board
#[derive(Parser, Debug, Clone)]
#[command(name = "kanbridge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<CliCommand>,

    /// Run a single synchronization pass then exit
    #[arg(long)]
    pub once: bool,

    /// Run continuously, one pass per interval
    #[arg(long, conflicts_with = "once")]
    pub continuous: bool,

    /// Maximum number of passes before stopping
    #[arg(long, conflicts_with = "once")]
    pub max_passes: Option<u32>,

    /// Show what a pass would do without writing to the board
    #[arg(long)]
    pub dry_run: bool,

    /// Finding source to sync (repeatable: sonarqube, dpy)
    #[arg(long, value_enum, global = true)]
    pub source: Vec<SourceKind>,

    /// Path to config file (default: kanbridge.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Column new and reopened findings go to
    #[arg(long)]
    pub target_column: Option<String>,

    /// Column resolved findings go to
    #[arg(long)]
    pub resolved_column: Option<String>,

    /// Minutes between pass starts (continuous mode)
    #[arg(long = "interval-minutes", alias = "interval")]
    pub interval_minutes: Option<u64>,

    /// Directory holding DPy smell reports
    #[arg(long, global = true)]
    pub directory: Option<String>,

    /// Concurrent board workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Kanboard project id
    #[arg(long, global = true)]
    pub project_id: Option<u64>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Compare source findings against board tasks without writing
    Status,

    /// Count findings per source without contacting the board
    Count,
}

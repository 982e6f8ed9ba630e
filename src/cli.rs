use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands::inspect::DEFAULT_LOG_TAIL;
use crate::rerun::RerunChoice;
use crate::tools::Skips;

#[derive(Parser, Debug)]
#[command(name = "evops", version)]
#[command(
    about = "Run Hayabusa, APT-Hunter and Chainsaw against a directory of event logs",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Directory containing the event logs to analyze (defaults to the current directory)
    pub target: Option<PathBuf>,

    /// Do not run Hayabusa
    #[arg(long)]
    pub skip_hayabusa: bool,

    /// Do not run APT-Hunter
    #[arg(long)]
    pub skip_apt_hunter: bool,

    /// Do not run Chainsaw
    #[arg(long)]
    pub skip_chainsaw: bool,

    /// Pull and rebuild the tool checkouts before running
    #[arg(long)]
    pub update_tools: bool,

    /// Retry every failed or timed out tool once
    #[arg(long)]
    pub retry_failed: bool,

    /// Generate an LLM summary of the tool outputs
    #[arg(long)]
    pub llm_summary: bool,

    /// Zip the output directory when done
    #[arg(long)]
    pub archive: bool,

    /// Kill any tool invocation running longer than this many seconds
    #[arg(long, value_name = "SECS")]
    pub tool_timeout: Option<u64>,

    /// Configuration file (defaults to $EVENTLOG_OPS_CONFIG, then eventlog_tools.toml next to the executable)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Write a default configuration file when none exists
    #[arg(long)]
    pub auto_config: bool,

    /// What to do when the target already has output, instead of asking
    #[arg(long, value_enum, value_name = "CHOICE")]
    pub on_existing: Option<RerunChoice>,

    /// Output the result as a single JSON document
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose diagnostics on stderr
    #[arg(long, global = true)]
    pub debug: bool,

    /// Also write debug diagnostics to this file
    #[arg(long, value_name = "PATH", global = true)]
    pub debug_log: Option<PathBuf>,
}

/// Read-only views over cases that were already processed. No tool runs.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List processed cases under a directory
    Cases {
        /// Directory whose subdirectories are cases
        base: PathBuf,
    },
    /// Describe the tool outputs, logs and summary of one case
    Show {
        /// Case directory
        target: PathBuf,
    },
    /// Print the end of one tool's log
    Log {
        /// Case directory
        target: PathBuf,
        /// hayabusa, apt-hunter or chainsaw
        tool: String,
        /// Attempt number (defaults to the latest)
        #[arg(long)]
        attempt: Option<u32>,
        /// Number of trailing lines to print
        #[arg(long, default_value_t = DEFAULT_LOG_TAIL)]
        tail: usize,
    },
}

impl Cli {
    pub fn skips(&self) -> Skips {
        Skips {
            hayabusa: self.skip_hayabusa,
            apt_hunter: self.skip_apt_hunter,
            chainsaw: self.skip_chainsaw,
        }
    }
}

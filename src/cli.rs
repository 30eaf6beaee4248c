use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::catalog::Catalog;

/// maintkit - run system maintenance tools with full logs
#[derive(Parser, Debug)]
#[command(name = "maintkit")]
#[command(about = "Runs system maintenance tools in the background and keeps a log of each run")]
#[command(version)]
pub struct Cli {
    /// Directory for log records (default: `logs` next to the executable)
    #[arg(long, global = true, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Configuration file (default: `maintkit.json` next to the executable)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Start operations without checking for administrator rights.
    ///
    /// For development only; the tools themselves will usually fail.
    #[arg(long, global = true)]
    pub skip_elevation_check: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// List the available operations
    List,
    /// Run one or more operations concurrently and wait for them to finish
    Run {
        /// Operations to run (see `list`)
        #[arg(required = true, value_parser = parse_operation_id)]
        operations: Vec<String>,

        /// Do not print command output while it runs
        #[arg(short, long)]
        quiet: bool,

        /// Print the final run states as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the log of an operation's most recent run
    Log {
        #[arg(value_parser = parse_operation_id)]
        operation: String,
    },
    /// Delete every log record (records in use are skipped)
    ClearLogs,
    /// Delete one operation's log record
    ClearLog {
        #[arg(value_parser = parse_operation_id)]
        operation: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Accept only ids present in the built-in catalog.
fn parse_operation_id(value: &str) -> Result<String, String> {
    let catalog = Catalog::builtin();
    if catalog.lookup(value).is_ok() {
        return Ok(value.to_string());
    }
    let known: Vec<&str> = catalog.ids().collect();
    Err(format!("unknown operation (expected one of: {})", known.join(", ")))
}

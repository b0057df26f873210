//! CLI parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::error::{ConfigError, SandboxError};
use crate::security::ReportFormat;

/// Sandbox Isolation - run commands in isolated container sandboxes
#[derive(Parser, Debug)]
#[command(name = "sbx")]
#[command(about = "Sandbox Isolation - run commands in isolated, policy-checked container sandboxes")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long = "debug", global = true)]
    pub debug: bool,

    /// Path to settings file (default: ~/.sbx-settings.json)
    #[arg(short = 's', long = "settings", global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command in an ephemeral sandbox
    Run(RunArgs),

    /// List built-in and custom security profiles
    Profiles,

    /// Export persisted audit events
    Report {
        /// Only events for this sandbox
        #[arg(long)]
        sandbox: Option<String>,

        /// json, csv or html
        #[arg(short = 'f', long, default_value = "json")]
        format: String,
    },

    /// Report which external tools are usable
    Check,
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Run command string directly (split like a shell would)
    #[arg(short = 'c')]
    pub command: Option<String>,

    /// Image override
    #[arg(long)]
    pub image: Option<String>,

    /// Command timeout in seconds
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Task id the sandbox is named after
    #[arg(long, default_value = "cli")]
    pub task: String,

    /// Leave the sandbox in place after the command exits
    #[arg(long)]
    pub keep: bool,

    /// Command and arguments to run
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,
}

impl Cli {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the settings file path.
    pub fn get_settings_path(&self) -> Option<PathBuf> {
        self.settings.clone().or_else(crate::config::default_settings_path)
    }
}

impl RunArgs {
    /// The argv to execute. `-c` wins over positional arguments.
    pub fn get_command(&self) -> Result<Option<Vec<String>>, SandboxError> {
        if let Some(ref cmd) = self.command {
            let argv = crate::utils::split_args(cmd)
                .map_err(|e| ConfigError::ParseError(format!("invalid command string: {}", e)))?;
            Ok(if argv.is_empty() { None } else { Some(argv) })
        } else if !self.args.is_empty() {
            Ok(Some(self.args.clone()))
        } else {
            Ok(None)
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// Parse a `--format` value.
pub fn parse_format(format: &str) -> Result<ReportFormat, SandboxError> {
    format.parse()
}

//! Command-line argument parsing for coder

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// coder - inspect an agent engine's plugins, tools, and configuration
#[derive(Parser, Debug)]
#[command(name = "coder")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Initialize the engine and report plugin status
    Plugins {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Initialize the engine and list registered tools
    Tools {
        /// Print model-facing definitions as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

impl Args {
    /// Subcommand to run, `plugins` when none was given
    pub fn command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Plugins { json: false })
    }
}

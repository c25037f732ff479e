//! coder - administrative front end for coder-engine
//!
//! Loads configuration, initializes an engine with its built-in plugin,
//! and reports plugins, tools, or the effective configuration.

use anyhow::{Context, Result};
use clap::Parser;
use coder_engine::{Config, Engine};
use tracing::{debug, info};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let config =
        Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Initialize logging
    init_logging(
        args.debug,
        args.json_logs || config.logging.json,
        &config.logging.level,
    );

    debug!("Starting coder v{}", env!("CARGO_PKG_VERSION"));

    match args.command() {
        Command::Config => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
        Command::Plugins { json } => {
            let mut engine = Engine::new(config)?;
            engine.initialize().await?;
            print_plugins(&engine, json)?;
            engine.shutdown().await;
        }
        Command::Tools { json } => {
            let mut engine = Engine::new(config)?;
            engine.initialize().await?;
            print_tools(&engine, json)?;
            engine.shutdown().await;
        }
    }

    info!("coder exited");
    Ok(())
}

fn print_plugins(engine: &Engine, json: bool) -> Result<()> {
    let status = engine.plugin_status();
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    if status.is_empty() {
        println!("No plugins registered");
    }
    for plugin in status {
        match plugin.error {
            Some(error) => println!(
                "{:<28} {:<10} {:<10} {}",
                plugin.name, plugin.version, plugin.state, error
            ),
            None => println!("{:<28} {:<10} {}", plugin.name, plugin.version, plugin.state),
        }
    }
    Ok(())
}

fn print_tools(engine: &Engine, json: bool) -> Result<()> {
    let tools = engine.tool_definitions();
    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }

    if tools.is_empty() {
        println!("No tools registered");
    }
    for tool in tools {
        let summary = tool.description.lines().next().unwrap_or_default();
        println!("{:<28} {}", tool.name, summary);
    }
    Ok(())
}

/// Initialize the logging/tracing subsystem
fn init_logging(debug: bool, json: bool, level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

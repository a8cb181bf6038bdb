// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Streaming agent CLI entry point
//!
//! Runs inside the VM, capturing the display and streaming it to the host.

use std::fs::OpenOptions;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Arg, ArgAction, Command};
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

use streaming_agent::agent::DEFAULT_PORT_PATH;
use streaming_agent::{AgentConfig, ConfigureOption, PluginRegistry, StreamingAgent};

fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let matches = Command::new("streaming-agent")
        .version(env!("CARGO_PKG_VERSION"))
        .author("lg-capture Authors")
        .about("Guest agent streaming the display to the host")
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PATH")
                .default_value(DEFAULT_PORT_PATH)
                .help("Path to the stream port device"),
        )
        .arg(
            Arg::new("configure")
                .short('c')
                .long("configure")
                .value_name("NAME=VALUE")
                .action(ArgAction::Append)
                .help("Set a plugin option, e.g. framerate=25 or mjpeg.quality=70"),
        )
        .arg(
            Arg::new("list-plugins")
                .long("list-plugins")
                .action(ArgAction::SetTrue)
                .help("Print the registered plugins as JSON and exit"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Enable debug logging"),
        )
        .get_matches();

    // Initialize logging
    let log_level = if matches.get_flag("debug") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(log_level)
        .init()
        .map_err(|e| anyhow!("Failed to initialize logging: {e}"))?;

    // Build configuration
    let options = matches
        .get_many::<String>("configure")
        .unwrap_or_default()
        .map(|option| option.parse::<ConfigureOption>())
        .collect::<Result<Vec<_>, _>>()?;

    let config = AgentConfig {
        port_path: matches
            .get_one::<String>("port")
            .cloned()
            .unwrap_or_else(|| DEFAULT_PORT_PATH.to_string()),
        options,
        ..Default::default()
    };

    let mut registry = PluginRegistry::new(config.options.clone());
    registry.load_builtin_modules();

    if matches.get_flag("list-plugins") {
        println!("{}", serde_json::to_string_pretty(&registry.describe())?);
        return Ok(());
    }

    if registry.is_empty() {
        return Err(anyhow!("No plugin registered"));
    }

    info!("Starting streaming-agent with config: {config:?}");

    let port = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&config.port_path)
        .with_context(|| format!("Failed to open stream port {}", config.port_path))?;

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to install signal handler")?;

    let mut agent = StreamingAgent::new(config, registry);
    agent
        .run(port.as_fd(), &running)
        .context("Streaming stopped")?;

    info!("Streaming agent stopped");
    Ok(())
}

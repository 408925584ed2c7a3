// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Command-line front end of the `modlink` binary.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ml_core::{ConnectionType, ROOT_UID};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::config::{default_config_path, EngineConfig};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::polling::PollChannel;
use crate::registry::Module;

#[derive(Parser, Debug)]
#[command(name = "modlink")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Mirror a device's module registry over WebSocket")]
pub struct Cli {
    /// Config file [default: $XDG_CONFIG_HOME/modlink/config.toml]
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Device address, overrides the config file
    #[arg(long, global = true)]
    pub host: Option<String>,

    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// settings, fixed or fixed-simulated
    #[arg(long, global = true, value_parser = parse_connection_type)]
    pub connection_type: Option<ConnectionType>,

    /// Dotted IPv4 reported by fixed-simulated clients
    #[arg(long, global = true, value_name = "ip")]
    pub simulated_ip: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Print engine events until interrupted
    Watch,

    /// Wait for the first sync and print the module tree
    Tree {
        /// Seconds to wait for the sync
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Poll module values and print every update
    Values {
        #[arg(required = true)]
        uids: Vec<u32>,

        /// Seconds to keep polling
        #[arg(long, default_value = "10")]
        seconds: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn parse_connection_type(s: &str) -> std::result::Result<ConnectionType, String> {
    s.parse().map_err(|e: ml_core::Error| e.to_string())
}

impl Cli {
    /// Reads the config file, if any, then applies command-line overrides.
    pub fn resolve_config(&self) -> Result<EngineConfig> {
        let mut config = match (&self.config, default_config_path()) {
            (Some(path), _) => EngineConfig::load(path)?,
            (None, Some(path)) if path.exists() => EngineConfig::load(&path)?,
            (None, _) => EngineConfig::new(""),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(connection_type) = self.connection_type {
            config.connection_type = connection_type;
        }
        if let Some(ip) = &self.simulated_ip {
            config.simulated_ip = Some(ip.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

/// Installs the global tracing subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = cli.resolve_config()?;
    match cli.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Watch => watch(config).await,
        Command::Tree { timeout } => tree(config, Duration::from_secs(timeout)).await,
        Command::Values { uids, seconds } => {
            values(config, &uids, Duration::from_secs(seconds)).await
        }
    }
}

async fn watch(config: EngineConfig) -> Result<()> {
    let engine = Engine::spawn(config)?;
    let mut events = engine.events();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => println!("{}", event),
                Err(RecvError::Lagged(skipped)) => warn!("skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }
    engine.remove().await
}

async fn wait_synced(engine: &Engine, limit: Duration) -> Result<()> {
    tokio::time::timeout(limit, engine.wait_synced())
        .await
        .map_err(|_| Error::SyncTimeout(limit))?
}

async fn tree(config: EngineConfig, limit: Duration) -> Result<()> {
    let engine = Engine::spawn(config)?;
    let synced = wait_synced(&engine, limit).await;
    let modules = engine.modules().await;
    engine.remove().await?;
    synced?;
    for line in render_tree(&modules?) {
        println!("{}", line);
    }
    Ok(())
}

async fn values(config: EngineConfig, uids: &[u32], duration: Duration) -> Result<()> {
    let engine = Engine::spawn(config)?;
    let result = poll_values(&engine, uids, duration).await;
    engine.remove().await?;
    result
}

async fn poll_values(engine: &Engine, uids: &[u32], duration: Duration) -> Result<()> {
    wait_synced(engine, duration).await?;
    let watched: BTreeSet<u32> = uids.iter().copied().collect();
    let mut events = engine.events();
    for &uid in &watched {
        engine.subscribe(PollChannel::Value, uid).await?;
    }

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(EngineEvent::ValuesUpdated(touched)) => {
                    for uid in touched.into_iter().filter(|uid| watched.contains(uid)) {
                        if let Some(module) = engine.module(uid).await? {
                            println!("{} {}: {}", uid, module.name(), module.value());
                        }
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    for &uid in &watched {
        engine.unsubscribe(PollChannel::Value, uid).await?;
    }
    Ok(())
}

/// One line per module, children indented under their parent in `sid` order.
pub fn render_tree(modules: &[Module]) -> Vec<String> {
    let mut children: HashMap<u32, Vec<&Module>> = HashMap::new();
    for module in modules {
        if let Some(parent) = module.parent() {
            children.entry(parent).or_default().push(module);
        }
    }
    for list in children.values_mut() {
        list.sort_by_key(|m| (m.sid(), m.uid()));
    }

    let mut lines = Vec::new();
    let mut stack: Vec<(&Module, usize)> = modules
        .iter()
        .filter(|m| m.uid() == ROOT_UID)
        .map(|m| (m, 0))
        .collect();
    let mut seen = BTreeSet::new();
    while let Some((module, depth)) = stack.pop() {
        if !seen.insert(module.uid()) {
            continue;
        }
        let line = format!(
            "{}{} {} {}",
            "  ".repeat(depth),
            module.uid(),
            module.kind(),
            module.name()
        );
        lines.push(line.trim_end().to_string());
        if let Some(list) = children.get(&module.uid()) {
            stack.extend(list.iter().rev().map(|child| (*child, depth + 1)));
        }
    }
    lines
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;

// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! ml-device: simulated device for the modlink wire protocol.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use ml_device::server;
use ml_device::{Device, DeviceState};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// ml-device: simulated module registry device
#[derive(Parser, Debug)]
#[command(name = "ml-device")]
#[command(about = "WebSocket device simulator for the modlink protocol")]
struct Args {
    /// Address to bind the server to
    #[arg(short, long, default_value = "0.0.0.0:9000")]
    bind: SocketAddr,

    /// JSON file holding an array of module objects
    #[arg(short, long)]
    modules: Option<PathBuf>,

    /// Buffer size reported in technical info
    #[arg(long, default_value = "4096")]
    buff_size: usize,

    /// Device name reported in the sync header
    #[arg(long, default_value = "ml-device")]
    name: String,

    /// Account as name:password:user, repeatable
    #[arg(long = "user", value_parser = parse_account)]
    users: Vec<(String, String, u32)>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_account(s: &str) -> Result<(String, String, u32), String> {
    let mut parts = s.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(password), Some(user)) if !name.is_empty() => {
            let user = user.parse().map_err(|_| format!("invalid user number: {user}"))?;
            Ok((name.to_string(), password.to_string(), user))
        }
        _ => Err("expected name:password:user".to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting ml-device");
    info!("  Bind address: {}", args.bind);

    let mut device = Device::new(args.name).with_buff_size(args.buff_size);
    if let Some(path) = &args.modules {
        let modules = Device::load_modules(path)?;
        info!("  Modules: {} from {}", modules.len(), path.display());
        device = device.with_modules(modules);
    }
    for (name, password, user) in &args.users {
        device = device.with_user(name, password, *user);
    }

    server::run(args.bind, DeviceState::new(device)).await?;
    Ok(())
}

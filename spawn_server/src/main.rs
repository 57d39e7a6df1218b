//! Standalone spawn server binary.
//!
//! Usage:
//!   cargo run -p spawn_server -- [--addr 127.0.0.1:40000] [--config spawn_server/config/arena.json]
//!                                [--mode scene|connection] [--debug]
//!
//! Console commands:
//!   status          - Show spawn diagnostics
//!   scene <name>    - Broadcast a scene load and spawn once peers are ready
//!   respawn_all     - Despawn and respawn every client
//!   kick <external> - Kick a player by external id
//!   end             - End the session and clean up every entity
//!   quit            - Shutdown server

use std::env;
use std::io::{BufRead, Write};
use std::net::SocketAddr;

use anyhow::Context;
use spawn_server::{NetHost, ServiceInput, SpawnOrchestrator, SpawnService, WorldFactory};
use spawn_shared::config::{ServerConfig, TriggerMode};
use tokio::sync::mpsc;
use tracing::{error, info};

struct Args {
    addr: Option<String>,
    config: Option<String>,
    mode: Option<TriggerMode>,
    debug: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut out = Args {
        addr: None,
        config: None,
        mode: None,
        debug: false,
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                out.addr = Some(args[i + 1].clone());
                i += 2;
            }
            "--config" if i + 1 < args.len() => {
                out.config = Some(args[i + 1].clone());
                i += 2;
            }
            "--mode" if i + 1 < args.len() => {
                out.mode = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--debug" => {
                out.debug = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    let mut cfg = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(addr) = args.addr {
        cfg.server_addr = addr;
    }
    if let Some(mode) = args.mode {
        cfg.spawn.trigger = mode;
    }
    cfg.spawn.debug_logging |= args.debug;

    let default_filter = if cfg.spawn.debug_logging { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    info!(
        addr = %cfg.server_addr,
        trigger = ?cfg.spawn.trigger,
        spawn_points = cfg.spawn.spawn_points.len(),
        "Starting spawn server"
    );

    let addr: SocketAddr = cfg.server_addr.parse().context("parse --addr")?;
    let host = NetHost::bind(addr).await?;
    info!(local = %host.local_addr()?, "Server listening");

    let factory = WorldFactory::new(cfg.spawn.player_template.clone());
    let service = SpawnService::new(SpawnOrchestrator::new(cfg.spawn.clone(), factory));

    let (tx, rx) = mpsc::channel::<ServiceInput>(256);

    // Spawn stdin reader thread.
    let console_tx = tx.clone();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            let cmd = ServiceInput::Command { line, reply: None };
            if console_tx.blocking_send(cmd).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'scene <name>' to start spawning, 'status' for info, 'quit' to exit.");
    println!();

    let accept = tokio::spawn(host.run(tx));
    let result = service.run(rx).await;
    accept.abort();

    if let Err(e) = &result {
        error!(error = %e, "Spawn service failed");
    }
    result
}

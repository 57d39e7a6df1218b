//! Bot swarm binary.
//!
//! Usage:
//!   cargo run -p spawn_client --bin bots -- [--addr 127.0.0.1:40000] [--count 4]
//!                                           [--prefix bot] [--seconds 30]
//!
//! Connects `count` bots, acknowledges every scene load and logs spawns until
//! the time runs out or the server disconnects them.

use std::env;
use std::time::Duration;

use spawn_client::{BotClient, BotState};
use spawn_shared::net::ExternalId;
use tracing::{info, warn};

struct Args {
    addr: String,
    count: usize,
    prefix: String,
    seconds: u64,
}

fn parse_args() -> Args {
    let mut out = Args {
        addr: "127.0.0.1:40000".to_string(),
        count: 4,
        prefix: "bot".to_string(),
        seconds: 30,
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                out.addr = args[i + 1].clone();
                i += 2;
            }
            "--count" if i + 1 < args.len() => {
                out.count = args[i + 1].parse().unwrap_or(4);
                i += 2;
            }
            "--prefix" if i + 1 < args.len() => {
                out.prefix = args[i + 1].clone();
                i += 2;
            }
            "--seconds" if i + 1 < args.len() => {
                out.seconds = args[i + 1].parse().unwrap_or(30);
                i += 2;
            }
            _ => i += 1,
        }
    }
    out
}

async fn run_bot(addr: String, external: ExternalId, lifetime: Duration) -> anyhow::Result<()> {
    let mut bot = BotClient::connect(&addr, external).await?;
    let finished = bot
        .wait_until(lifetime, |b| b.state == BotState::Disconnected)
        .await?;
    if !finished {
        bot.disconnect().await?;
    }
    info!(
        client_id = ?bot.client_id,
        spawned = bot.own_entity().is_some(),
        entities = bot.entities.len(),
        all_spawned = bot.finished,
        "Bot done"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    info!(addr = %args.addr, count = args.count, "Starting bots");

    let lifetime = Duration::from_secs(args.seconds);
    let mut tasks = Vec::with_capacity(args.count);
    for n in 0..args.count {
        let external = ExternalId::new(format!("{}-{n}", args.prefix));
        tasks.push(tokio::spawn(run_bot(args.addr.clone(), external, lifetime)));
    }

    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Bot failed"),
            Err(e) => warn!(error = %e, "Bot task panicked"),
        }
    }
    Ok(())
}

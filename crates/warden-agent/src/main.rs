use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use libwarden::{CommandScreenLocker, account};
use warden_agent::{Agent, AgentConfig};
use warden_protocol::paths;

#[derive(Parser, Debug)]
#[command(name = "warden-agent", version, about = "Session agent for the warden master")]
struct Cli {
    /// Master address
    #[arg(long, default_value = paths::DEFAULT_LISTEN_ADDR)]
    addr: String,

    /// Account to register as (default: the current user)
    #[arg(long)]
    username: Option<String>,

    #[arg(long, default_value_t = 30)]
    keepalive_secs: u64,

    /// Command line that locks the screen
    #[arg(long)]
    lock_command: Option<String>,

    #[arg(long, default_value_t = 1000)]
    initial_backoff_ms: u64,

    #[arg(long, default_value_t = 16000)]
    max_backoff_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warden_agent=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let username = cli
        .username
        .or_else(account::current_username)
        .context("cannot determine the current user, pass --username")?;
    let locker = match &cli.lock_command {
        Some(line) => CommandScreenLocker::from_command_line(line).context("--lock-command is empty")?,
        None => CommandScreenLocker::default(),
    };

    let mut config = AgentConfig::new(cli.addr, username);
    config.keepalive = Duration::from_secs(cli.keepalive_secs.max(1));
    config.initial_backoff = Duration::from_millis(cli.initial_backoff_ms);
    config.max_backoff = Duration::from_millis(cli.max_backoff_ms);

    info!(addr = %config.addr, username = %config.username, "agent starting");
    let agent = Agent::new(config, Arc::new(locker));

    let token = agent.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, stopping");
            token.cancel();
        }
    });

    agent.run().await
}

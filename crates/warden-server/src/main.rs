use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use libwarden::LocalSessionHost;
use warden_server::{ControlServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "warden-server", version, about = "Session control master")]
struct Cli {
    /// Config file (default: $WARDEN_CONFIG or <data dir>/server.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warden_server=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ServerConfig::load_from(path)?,
        None => ServerConfig::load()?,
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    let spec = config.launch_spec()?;
    let server = Arc::new(
        ControlServer::new(config).with_session_host(Arc::new(LocalSessionHost::new()), spec),
    );
    let listener = server.bind().await?;

    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for ctrl-c: {e}");
            return;
        }
        info!("shutting down...");
        stopper.shutdown().await;
    });

    server.serve(listener).await
}

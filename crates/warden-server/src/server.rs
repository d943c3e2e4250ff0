use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use futures_util::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use libwarden::{AgentLauncher, LaunchSpec, Registry, Session, SessionHost, WardenError};
use warden_protocol::{Command, CustomCommandSpec};

use crate::config::ServerConfig;
use crate::connection;
use crate::events::{AgentEvent, EventBus};

/// Outcome of sending one command to every registered agent.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, WardenError)>,
}

impl BroadcastReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The master side of the control plane.
pub struct ControlServer {
    config: ServerConfig,
    catalog: HashMap<String, CustomCommandSpec>,
    registry: Arc<Registry>,
    events: EventBus,
    launcher: Option<Arc<AgentLauncher>>,
    pub(crate) draining: AtomicBool,
    pub(crate) stopped: CancellationToken,
}

impl ControlServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(Registry::with_queue_capacity(config.queue_capacity));
        let catalog = config
            .commands
            .iter()
            .map(|spec| (spec.name.clone(), spec.clone()))
            .collect();
        Self {
            config,
            catalog,
            registry,
            events: EventBus::new(),
            launcher: None,
            draining: AtomicBool::new(false),
            stopped: CancellationToken::new(),
        }
    }

    /// Enable launching agents on demand in sessions that have none.
    pub fn with_session_host(mut self, host: Arc<dyn SessionHost>, spec: LaunchSpec) -> Self {
        let launcher = AgentLauncher::new(Arc::clone(&self.registry), host, spec)
            .with_timeout(self.config.launch_timeout());
        self.launcher = Some(Arc::new(launcher));
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn launcher(&self) -> Option<&Arc<AgentLauncher>> {
        self.launcher.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: AgentEvent) {
        self.events.publish(event);
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = &self.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to listen on {addr}"))?;
        info!(addr = %listener.local_addr()?, "control server listening");
        Ok(listener)
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept agents until [`ControlServer::shutdown`] completes.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.stopped.cancelled() => {
                    info!("listener closed");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if self.draining.load(Ordering::Acquire) {
                            debug!(%peer, "refusing agent during shutdown");
                            continue;
                        }
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            connection::handle_agent(stream, peer, server).await;
                        });
                    }
                    Err(e) => {
                        error!("accept error: {e}");
                    }
                }
            }
        }
    }

    /// Queue `cmd` for the agent serving `username`.
    pub async fn send_to(&self, username: &str, cmd: Command) -> Result<(), WardenError> {
        let session = self
            .registry
            .find_account(username)
            .await
            .ok_or_else(|| WardenError::NotConnected(username.to_string()))?;
        session.try_enqueue(cmd)
    }

    /// Queue `cmd` for every registered agent. Partial failure is reported,
    /// never fatal.
    pub async fn broadcast(&self, cmd: Command) -> BroadcastReport {
        let sessions = self.registry.all().await;
        let attempts = sessions.iter().map(|session| {
            let cmd = cmd.clone();
            async move { (session, session.try_enqueue(cmd)) }
        });

        let mut report = BroadcastReport::default();
        for (session, result) in join_all(attempts).await {
            let username = session.username().to_string();
            match result {
                Ok(()) => report.delivered.push(username),
                Err(e) => {
                    warn!(%username, kind = ?cmd.kind(), error = %e, "broadcast delivery failed");
                    report.failed.push((username, e));
                }
            }
        }
        report
    }

    /// Deliver `cmd` to `username`, launching an agent in their session first
    /// if none is registered.
    pub async fn dispatch(&self, username: &str, cmd: Command) -> Result<(), WardenError> {
        match self.send_to(username, cmd.clone()).await {
            Err(WardenError::NotConnected(_)) => {}
            other => return other,
        }
        let Some(launcher) = &self.launcher else {
            return Err(WardenError::NotConnected(username.to_string()));
        };

        if let Err(e) = launcher.ensure_agent_for(username).await {
            warn!(username, error = %e, "no agent after launch attempt");
            return Err(WardenError::ActionFailed(username.to_string()));
        }
        self.send_to(username, cmd).await.map_err(|e| {
            warn!(username, error = %e, "dispatch retry failed");
            WardenError::ActionFailed(username.to_string())
        })
    }

    pub async fn lock_screen(&self, username: &str) -> Result<(), WardenError> {
        self.dispatch(username, Command::lock_screen()).await
    }

    pub async fn run_custom_command(
        &self,
        username: &str,
        spec: &CustomCommandSpec,
    ) -> Result<(), WardenError> {
        let cmd = Command::custom(spec)
            .map_err(|e| WardenError::Io(std::io::Error::other(e)))?;
        self.dispatch(username, cmd).await
    }

    /// Look up a command from the configured catalog.
    pub fn named_command(&self, name: &str) -> Option<&CustomCommandSpec> {
        self.catalog.get(name)
    }

    /// Run a catalog command as `username`. Unknown names fail as
    /// [`WardenError::ActionFailed`] without contacting any agent.
    pub async fn run_named_command(&self, username: &str, name: &str) -> Result<(), WardenError> {
        let Some(spec) = self.named_command(name) else {
            warn!(username, command = name, "no such command in catalog");
            return Err(WardenError::ActionFailed(username.to_string()));
        };
        self.run_custom_command(username, spec).await
    }

    pub(crate) fn agent_connected(&self, session: &Session) {
        if let Some(launcher) = &self.launcher {
            launcher.agent_registered();
        }
        self.publish(AgentEvent::Registered {
            username: session.username().to_string(),
            client_id: session.id().to_string(),
        });
    }

    pub(crate) async fn agent_gone(&self, session: &Session) {
        if self.registry.close(session).await {
            self.publish(AgentEvent::Disconnected {
                username: session.username().to_string(),
                client_id: session.id().to_string(),
            });
        }
    }
}

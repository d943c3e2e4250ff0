use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use libwarden::{Backoff, ScreenLocker};
use warden_protocol::{Command, CommandType, EnvelopeCodec, ErrorCode, Hello, Reply, paths};

use crate::handler::{CommandHandler, Flow, Handlers};

type Reader = FramedRead<OwnedReadHalf, EnvelopeCodec>;
type Writer = FramedWrite<OwnedWriteHalf, EnvelopeCodec>;

const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub addr: String,
    pub username: String,
    pub keepalive: Duration,
    pub write_timeout: Duration,
    pub handshake_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl AgentConfig {
    pub fn new(addr: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            username: username.into(),
            keepalive: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            initial_backoff: Backoff::DEFAULT_INITIAL,
            max_backoff: Backoff::DEFAULT_MAX,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new(paths::DEFAULT_LISTEN_ADDR, "")
    }
}

/// The master refused to register this agent.
#[derive(thiserror::Error, Debug)]
#[error("registration rejected ({code:?}): {message}")]
pub struct Rejected {
    pub code: Option<ErrorCode>,
    pub message: String,
}

enum SessionEnd {
    Exit,
    Lost,
}

/// Agent side of the control plane: keeps a registered connection to the
/// master and runs whatever it is sent.
pub struct Agent {
    config: AgentConfig,
    handlers: Handlers,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(config: AgentConfig, locker: Arc<dyn ScreenLocker>) -> Self {
        Self {
            config,
            handlers: Handlers::standard(locker),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_handler(mut self, kind: CommandType, handler: Arc<dyn CommandHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Cancel to stop the agent between or during connections.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Connect, register and serve until the master says exit or the
    /// shutdown token fires. Transient failures are retried forever with
    /// exponential backoff; a rejected registration is returned as
    /// [`Rejected`].
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        loop {
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                res = TcpStream::connect(&self.config.addr) => res,
            };
            match connected {
                Ok(stream) => {
                    backoff.reset();
                    match self.run_session(stream).await {
                        Ok(SessionEnd::Exit) => {
                            info!(username = %self.config.username, "agent exiting");
                            return Ok(());
                        }
                        Ok(SessionEnd::Lost) => info!(addr = %self.config.addr, "connection to master lost"),
                        Err(e) if e.is::<Rejected>() => return Err(e),
                        Err(e) => warn!(addr = %self.config.addr, "session failed: {e:#}"),
                    }
                }
                Err(e) => debug!(addr = %self.config.addr, error = %e, "connect failed"),
            }

            let delay = backoff.next_delay();
            info!(addr = %self.config.addr, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_session(&self, stream: TcpStream) -> anyhow::Result<SessionEnd> {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let mut reader = FramedRead::new(reader, EnvelopeCodec::default());
        let mut writer = FramedWrite::new(writer, EnvelopeCodec::default());

        let client_id = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(SessionEnd::Exit),
            res = self.register(&mut reader, &mut writer) => res?,
        };
        info!(username = %self.config.username, %client_id, "registered with master");

        let (outbox, queue) = mpsc::channel(OUTBOUND_CAPACITY);
        let mut sender = tokio::spawn(send_loop(queue, writer, self.config.write_timeout));
        let keepalive = tokio::spawn(keepalive_loop(outbox.clone(), self.config.keepalive));

        let end = tokio::select! {
            _ = &mut sender => SessionEnd::Lost,
            end = self.receive_loop(&mut reader, &outbox) => end,
            _ = self.shutdown.cancelled() => SessionEnd::Exit,
        };

        keepalive.abort();
        drop(outbox);
        // Let queued replies go out before the socket closes.
        if !sender.is_finished() && timeout(self.config.write_timeout, &mut sender).await.is_err() {
            sender.abort();
        }
        Ok(end)
    }

    async fn register(&self, reader: &mut Reader, writer: &mut Writer) -> anyhow::Result<String> {
        let hello = Hello {
            username: self.config.username.clone(),
            pid: Some(std::process::id()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        };
        timeout(self.config.write_timeout, writer.send(Command::hello(&hello)?))
            .await
            .context("hello write timed out")??;

        let frame = match timeout(self.config.handshake_timeout, reader.next()).await {
            Err(_) => bail!("no registration reply from master"),
            Ok(None) => bail!("master closed connection during handshake"),
            Ok(Some(frame)) => frame.context("malformed registration reply")?,
        };
        if frame.kind() != CommandType::Response {
            bail!("expected registration reply, got {:?}", frame.kind());
        }
        let reply: Reply = frame.json().context("invalid registration reply")?;
        if !reply.ok {
            warn!(username = %self.config.username, code = ?reply.code, "registration rejected");
            return Err(Rejected {
                code: reply.code,
                message: reply.message.unwrap_or_default(),
            }
            .into());
        }
        Ok(reply.client_id.unwrap_or_default())
    }

    async fn receive_loop(&self, reader: &mut Reader, outbox: &mpsc::Sender<Command>) -> SessionEnd {
        loop {
            let frame = match reader.next().await {
                None => return SessionEnd::Lost,
                Some(Err(e)) => {
                    warn!(error = %e, "protocol error from master");
                    return SessionEnd::Lost;
                }
                Some(Ok(frame)) => frame,
            };
            debug!(kind = ?frame.kind(), "command received");
            if self.handlers.dispatch(frame, outbox) == Flow::Exit {
                return SessionEnd::Exit;
            }
        }
    }
}

async fn send_loop(mut queue: mpsc::Receiver<Command>, mut writer: Writer, limit: Duration) {
    while let Some(cmd) = queue.recv().await {
        let kind = cmd.kind();
        match timeout(limit, writer.send(cmd)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(?kind, error = %e, "write to master failed");
                return;
            }
            Err(_) => {
                warn!(?kind, "write to master timed out");
                return;
            }
        }
    }
}

/// Queue a keepalive every `period` regardless of other traffic.
async fn keepalive_loop(outbox: mpsc::Sender<Command>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        match outbox.try_send(Command::keep_alive()) {
            Ok(()) => debug!("keepalive queued"),
            Err(mpsc::error::TrySendError::Full(_)) => debug!("outbound busy, skipping keepalive"),
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

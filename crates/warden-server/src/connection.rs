use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use libwarden::Session;
use warden_protocol::{Command, CommandType, EnvelopeCodec, ErrorCode, Hello, OutputChunk, Reply};

use crate::events::AgentEvent;
use crate::server::ControlServer;

type Reader = FramedRead<OwnedReadHalf, EnvelopeCodec>;
type Writer = FramedWrite<OwnedWriteHalf, EnvelopeCodec>;

/// Serve one agent connection from handshake to teardown.
pub async fn handle_agent(stream: TcpStream, peer: SocketAddr, server: Arc<ControlServer>) {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let mut reader = FramedRead::new(reader, EnvelopeCodec::default());
    let mut writer = FramedWrite::new(writer, EnvelopeCodec::default());
    let config = server.config();
    let write_timeout = config.write_timeout();

    let hello = match read_hello(&mut reader, config.handshake_timeout()).await {
        Ok(hello) => hello,
        Err(e) => {
            warn!(%peer, "handshake failed: {e:#}");
            let reply = Reply::error(ErrorCode::InvalidRequest, format!("{e:#}"));
            let _ = send_reply(&mut writer, &reply, write_timeout).await;
            return;
        }
    };

    let (session, queue) = match admit(&server, &hello.username).await {
        Ok(admitted) => admitted,
        Err(reply) => {
            warn!(%peer, username = %hello.username, code = ?reply.code, "registration rejected");
            let _ = send_reply(&mut writer, &reply, write_timeout).await;
            return;
        }
    };

    let accepted = Reply::accepted(session.id().to_string());
    if let Err(e) = send_reply(&mut writer, &accepted, write_timeout).await {
        warn!(username = %hello.username, "failed to acknowledge registration: {e:#}");
        server.registry().close(&session).await;
        return;
    }
    info!(%peer, username = %hello.username, pid = ?hello.pid, version = ?hello.version, "agent connected");
    server.agent_connected(&session);

    let mut outbound = tokio::spawn(send_loop(
        queue,
        writer,
        write_timeout,
        session.username().to_string(),
    ));

    tokio::select! {
        _ = &mut outbound => {
            debug!(username = %session.username(), "send loop finished");
        }
        reason = receive_loop(&mut reader, &server, &session, config.idle_timeout()) => {
            debug!(username = %session.username(), reason, "receive loop finished");
        }
    }

    // Close queues an exit; give the send loop a bounded chance to flush it.
    server.agent_gone(&session).await;
    if !outbound.is_finished() && timeout(write_timeout, &mut outbound).await.is_err() {
        outbound.abort();
    }
    info!(%peer, username = %session.username(), "agent disconnected");
}

/// Register `username` and mark the session live, or build the rejection.
async fn admit(
    server: &ControlServer,
    username: &str,
) -> Result<(Arc<Session>, mpsc::Receiver<Command>), Reply> {
    if server.is_shutting_down() {
        return Err(shutting_down());
    }
    let session = server.registry().register(username).await.map_err(|e| {
        let (code, message) = e.to_error_code();
        Reply::error(code, message)
    })?;

    // Shutdown may have taken its registry snapshot before this insert.
    if server.is_shutting_down() {
        server.registry().close(&session).await;
        return Err(shutting_down());
    }
    match activate(server, &session) {
        Some(queue) => Ok((session, queue)),
        None => {
            server.registry().close(&session).await;
            Err(Reply::error(ErrorCode::ServerError, "session closed during registration"))
        }
    }
}

/// Hand out the session's queue if it can still move to `Connected`.
fn activate(server: &ControlServer, session: &Session) -> Option<mpsc::Receiver<Command>> {
    let queue = session.take_receiver()?;
    server.registry().connect(session).then_some(queue)
}

fn shutting_down() -> Reply {
    Reply::error(ErrorCode::ServerError, "server is shutting down")
}

async fn read_hello(reader: &mut Reader, limit: Duration) -> anyhow::Result<Hello> {
    let frame = match timeout(limit, reader.next()).await {
        Err(_) => bail!("no hello within {}ms", limit.as_millis()),
        Ok(None) => bail!("connection closed before hello"),
        Ok(Some(frame)) => frame.context("malformed hello envelope")?,
    };
    if frame.kind() != CommandType::Hello {
        bail!("expected hello, got {:?}", frame.kind());
    }
    let hello: Hello = frame.json().context("invalid hello payload")?;
    if hello.username.trim().is_empty() {
        bail!("hello carries no username");
    }
    Ok(hello)
}

async fn send_reply(writer: &mut Writer, reply: &Reply, limit: Duration) -> anyhow::Result<()> {
    let cmd = Command::response(reply)?;
    timeout(limit, writer.send(cmd))
        .await
        .context("write timed out")??;
    Ok(())
}

/// Drain the session queue onto the socket. Ends after writing an exit,
/// when the queue is closed, or on the first write failure.
async fn send_loop(
    mut queue: mpsc::Receiver<Command>,
    mut writer: Writer,
    limit: Duration,
    username: String,
) {
    while let Some(cmd) = queue.recv().await {
        let kind = cmd.kind();
        if kind == CommandType::Unknown {
            debug!(%username, "skipping unknown command");
            continue;
        }
        match timeout(limit, writer.send(cmd)).await {
            Ok(Ok(())) => debug!(%username, ?kind, "command sent"),
            Ok(Err(e)) => {
                warn!(%username, ?kind, error = %e, "write failed");
                return;
            }
            Err(_) => {
                warn!(%username, ?kind, "write timed out");
                return;
            }
        }
        if kind == CommandType::Exit {
            return;
        }
    }
}

async fn receive_loop(
    reader: &mut Reader,
    server: &ControlServer,
    session: &Session,
    idle: Duration,
) -> &'static str {
    let username = session.username();
    loop {
        let frame = match timeout(idle, reader.next()).await {
            Err(_) => return "idle timeout",
            Ok(None) => return "agent closed connection",
            Ok(Some(Err(e))) => {
                warn!(username, error = %e, "protocol error");
                return "protocol error";
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame.kind() {
            CommandType::KeepAlive => debug!(username, "keepalive"),
            CommandType::Response => match frame.json::<Reply>() {
                Ok(reply) => {
                    if !reply.ok {
                        warn!(username, code = ?reply.code, message = ?reply.message, "agent reported failure");
                    }
                    server.publish(AgentEvent::Response {
                        username: username.to_string(),
                        reply,
                    });
                }
                Err(e) => debug!(username, error = %e, "ignoring malformed response"),
            },
            CommandType::Output => match frame.json::<OutputChunk>() {
                Ok(chunk) => server.publish(AgentEvent::Output {
                    username: username.to_string(),
                    chunk,
                }),
                Err(e) => debug!(username, error = %e, "ignoring malformed output"),
            },
            other => debug!(username, kind = ?other, "ignoring frame"),
        }
    }
}

//! What the agent does with each command the master sends.
//!
//! Handlers never block the receive loop: anything slow (locking the
//! screen, running a program) is spawned and reports back through the
//! outbound queue.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use libwarden::ScreenLocker;
use warden_protocol::{
    Command, CommandType, CustomCommandSpec, ErrorCode, OutputChunk, OutputStream, Reply,
};

/// Read size for streamed command output. Small enough that a chunk plus
/// its base64 and JSON overhead always fits one envelope.
const OUTPUT_CHUNK: usize = 8 * 1024;

pub type Outbox = mpsc::Sender<Command>;

/// Whether the receive loop keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub trait CommandHandler: Send + Sync {
    fn handle(&self, cmd: Command, outbox: &Outbox) -> Flow;
}

/// Handler table keyed by command type. Types without an entry are ignored.
#[derive(Clone, Default)]
pub struct Handlers {
    map: HashMap<CommandType, Arc<dyn CommandHandler>>,
}

impl Handlers {
    pub fn standard(locker: Arc<dyn ScreenLocker>) -> Self {
        let mut handlers = Self::default();
        handlers.insert(CommandType::Exit, Arc::new(ExitHandler));
        handlers.insert(CommandType::KeepAlive, Arc::new(NoopHandler));
        handlers.insert(CommandType::Hello, Arc::new(NoopHandler));
        handlers.insert(CommandType::LockScreen, Arc::new(LockScreenHandler::new(locker)));
        handlers.insert(CommandType::CustomCommand, Arc::new(CustomCommandHandler));
        handlers
    }

    pub fn insert(&mut self, kind: CommandType, handler: Arc<dyn CommandHandler>) {
        self.map.insert(kind, handler);
    }

    pub fn dispatch(&self, cmd: Command, outbox: &Outbox) -> Flow {
        let kind = cmd.kind();
        match self.map.get(&kind) {
            Some(handler) => handler.handle(cmd, outbox),
            None => {
                debug!(?kind, "no handler, ignoring");
                Flow::Continue
            }
        }
    }
}

pub struct ExitHandler;

impl CommandHandler for ExitHandler {
    fn handle(&self, _cmd: Command, _outbox: &Outbox) -> Flow {
        info!("exit requested by master");
        Flow::Exit
    }
}

/// Liveness frames carry nothing to act on.
pub struct NoopHandler;

impl CommandHandler for NoopHandler {
    fn handle(&self, _cmd: Command, _outbox: &Outbox) -> Flow {
        Flow::Continue
    }
}

pub struct LockScreenHandler {
    locker: Arc<dyn ScreenLocker>,
}

impl LockScreenHandler {
    pub fn new(locker: Arc<dyn ScreenLocker>) -> Self {
        Self { locker }
    }
}

impl CommandHandler for LockScreenHandler {
    fn handle(&self, _cmd: Command, outbox: &Outbox) -> Flow {
        let locker = Arc::clone(&self.locker);
        let outbox = outbox.clone();
        tokio::spawn(async move {
            let reply = match tokio::task::spawn_blocking(move || locker.lock_current_session()).await {
                Ok(Ok(())) => {
                    info!("screen locked");
                    Reply::ok()
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "screen lock failed");
                    Reply::error(ErrorCode::ActionFailed, e.to_string())
                }
                Err(e) => {
                    warn!(error = %e, "screen lock task failed");
                    Reply::error(ErrorCode::ActionFailed, "lock task failed")
                }
            };
            send_reply(&outbox, &reply).await;
        });
        Flow::Continue
    }
}

pub struct CustomCommandHandler;

impl CommandHandler for CustomCommandHandler {
    fn handle(&self, cmd: Command, outbox: &Outbox) -> Flow {
        match cmd.json::<CustomCommandSpec>() {
            Ok(spec) => {
                tokio::spawn(run_custom_command(spec, outbox.clone()));
            }
            Err(e) => {
                warn!(error = %e, "invalid custom command payload");
                let reply = Reply::error(ErrorCode::InvalidRequest, format!("invalid custom command: {e}"));
                let outbox = outbox.clone();
                tokio::spawn(async move { send_reply(&outbox, &reply).await });
            }
        }
        Flow::Continue
    }
}

/// Run `spec` to completion, streaming its output and finally its exit code.
pub async fn run_custom_command(spec: CustomCommandSpec, outbox: Outbox) {
    let name = if spec.name.is_empty() {
        spec.cmd.clone()
    } else {
        spec.name.clone()
    };

    let mut command = tokio::process::Command::new(&spec.cmd);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // A non-empty env is the whole environment, not an overlay.
    if !spec.env.is_empty() {
        command.env_clear().envs(&spec.env);
    }
    if let Some(dir) = &spec.workdir {
        command.current_dir(dir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(%name, error = %e, "failed to start custom command");
            let reply = Reply::error(ErrorCode::ActionFailed, format!("failed to start {name}: {e}"));
            send_reply(&outbox, &reply).await;
            return;
        }
    };
    info!(%name, pid = ?child.id(), "custom command started");

    let stdout = tokio::spawn(pump(child.stdout.take(), OutputStream::Stdout, name.clone(), outbox.clone()));
    let stderr = tokio::spawn(pump(child.stderr.take(), OutputStream::Stderr, name.clone(), outbox.clone()));

    let exit_code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(%name, error = %e, "failed to wait for custom command");
            None
        }
    };
    let _ = stdout.await;
    let _ = stderr.await;
    info!(%name, ?exit_code, "custom command finished");

    send_output(
        &outbox,
        OutputChunk {
            name,
            stream: OutputStream::Exit,
            data: Vec::new(),
            exit_code,
        },
    )
    .await;
}

async fn pump<R>(reader: Option<R>, stream: OutputStream, name: String, outbox: Outbox)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; OUTPUT_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    name: name.clone(),
                    stream,
                    data: buf[..n].to_vec(),
                    exit_code: None,
                };
                if !send_output(&outbox, chunk).await {
                    break;
                }
            }
            Err(e) => {
                debug!(%name, ?stream, error = %e, "output read failed");
                break;
            }
        }
    }
}

/// Returns false once the connection is gone.
async fn send_output(outbox: &Outbox, chunk: OutputChunk) -> bool {
    match Command::output(&chunk) {
        Ok(cmd) => outbox.send(cmd).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "cannot encode output");
            true
        }
    }
}

async fn send_reply(outbox: &Outbox, reply: &Reply) {
    match Command::response(reply) {
        Ok(cmd) => {
            if outbox.send(cmd).await.is_err() {
                debug!("connection closed before reply was sent");
            }
        }
        Err(e) => warn!(error = %e, "cannot encode reply"),
    }
}

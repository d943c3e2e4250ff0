use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use warden_protocol::{ClientId, Command};

use crate::account;
use crate::error::WardenError;

/// Outbound queue depth for each connected agent.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unknown,
    Connected,
    Disconnected,
}

struct SessionState {
    status: SessionStatus,
    /// Dropped exactly once, on the transition to `Disconnected`.
    outbound: Option<mpsc::Sender<Command>>,
}

/// One registered agent connection.
pub struct Session {
    id: ClientId,
    username: String,
    state: Mutex<SessionState>,
    /// Taken by the connection's send loop.
    receiver: Mutex<Option<mpsc::Receiver<Command>>>,
}

impl Session {
    fn new(username: &str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            state: Mutex::new(SessionState {
                status: SessionStatus::Unknown,
                outbound: Some(tx),
            }),
            receiver: Mutex::new(Some(rx)),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn status(&self) -> SessionStatus {
        self.state().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Connected
    }

    /// Move `Unknown -> Connected`. Returns false if the session was already past `Unknown`.
    pub fn connect(&self) -> bool {
        let mut state = self.state();
        if state.status != SessionStatus::Unknown {
            return false;
        }
        state.status = SessionStatus::Connected;
        true
    }

    /// Take the receiving end of the outbound queue. Only the first call gets it.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<Command>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Queue a command without waiting. A full queue drops the command.
    pub fn try_enqueue(&self, cmd: Command) -> Result<(), WardenError> {
        let state = self.state();
        if state.status != SessionStatus::Connected {
            return Err(WardenError::NotConnected(self.username.clone()));
        }
        let Some(tx) = state.outbound.as_ref() else {
            return Err(WardenError::NotConnected(self.username.clone()));
        };
        match tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                warn!(
                    username = %self.username,
                    command = ?cmd.kind(),
                    "outbound queue full, dropping command"
                );
                Err(WardenError::QueueFull(self.username.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(WardenError::NotConnected(self.username.clone()))
            }
        }
    }

    /// Number of commands queued but not yet picked up by the send loop.
    pub fn pending(&self) -> usize {
        self.state()
            .outbound
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    fn mark_disconnected(&self) -> Option<mpsc::Sender<Command>> {
        let mut state = self.state();
        if state.status == SessionStatus::Disconnected {
            return None;
        }
        state.status = SessionStatus::Disconnected;
        state.outbound.take()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("status", &self.status())
            .finish()
    }
}

#[derive(Default)]
struct Indexes {
    by_id: HashMap<ClientId, Arc<Session>>,
    by_username: HashMap<String, Arc<Session>>,
}

/// Concurrent index of live agent sessions, keyed by client id and by username.
///
/// Both maps sit behind one lock so they are always updated together.
pub struct Registry {
    indexes: RwLock<Indexes>,
    queue_capacity: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            indexes: RwLock::new(Indexes::default()),
            queue_capacity,
        }
    }

    /// Admit a new agent for `username` in `Unknown` status.
    pub async fn register(&self, username: &str) -> Result<Arc<Session>, WardenError> {
        let mut idx = self.indexes.write().await;
        if let Some(existing) = idx.by_username.get(username) {
            if existing.status() != SessionStatus::Disconnected {
                debug!(username, client_id = %existing.id(), "duplicate registration");
                return Err(WardenError::DuplicateUser(username.to_string()));
            }
        }

        let session = Arc::new(Session::new(username, self.queue_capacity));
        idx.by_id.insert(session.id.clone(), Arc::clone(&session));
        idx.by_username
            .insert(session.username.clone(), Arc::clone(&session));
        info!(username, client_id = %session.id, "agent registered");
        Ok(session)
    }

    /// Mark a registered session as having an established command stream.
    pub fn connect(&self, session: &Session) -> bool {
        session.connect()
    }

    /// Tear a session down. Safe to call repeatedly; only the first call acts.
    ///
    /// Returns true if this call performed the teardown.
    pub async fn close(&self, session: &Session) -> bool {
        let Some(tx) = session.mark_disconnected() else {
            return false;
        };

        {
            let mut idx = self.indexes.write().await;
            idx.by_id.remove(&session.id);
            if idx
                .by_username
                .get(&session.username)
                .is_some_and(|s| s.id == session.id)
            {
                idx.by_username.remove(&session.username);
            }
        }

        match tx.try_send(Command::exit()) {
            Ok(()) => debug!(username = %session.username, "queued exit for closing session"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(username = %session.username, "outbound queue full, exit not queued")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
        drop(tx);

        info!(username = %session.username, client_id = %session.id, "agent session closed");
        true
    }

    pub async fn lookup(&self, username: &str) -> Option<Arc<Session>> {
        self.indexes.read().await.by_username.get(username).cloned()
    }

    /// Like [`Registry::lookup`], but also matches a bare name against a
    /// domain-qualified registration and the reverse, so `alice` finds an
    /// agent registered as `CORP\alice`. Qualified names on both sides must
    /// agree on the domain. An ambiguous bare name matches nothing.
    pub async fn find_account(&self, account: &str) -> Option<Arc<Session>> {
        let idx = self.indexes.read().await;
        if let Some(session) = idx.by_username.get(account) {
            return Some(Arc::clone(session));
        }
        let mut candidates = idx
            .by_username
            .values()
            .filter(|s| account::same_account(&s.username, account));
        let found = candidates.next()?;
        if candidates.next().is_some() {
            warn!(account, "account name matches several agents");
            return None;
        }
        Some(Arc::clone(found))
    }

    pub async fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.indexes.read().await.by_id.get(client_id).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<Session>> {
        self.indexes.read().await.by_id.values().cloned().collect()
    }

    pub async fn usernames(&self) -> Vec<String> {
        self.indexes.read().await.by_username.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.indexes.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// True if at least one agent has completed its handshake.
    pub async fn has_clients(&self) -> bool {
        self.indexes
            .read()
            .await
            .by_id
            .values()
            .any(|s| s.is_connected())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

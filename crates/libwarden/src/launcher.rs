use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use crate::blocker::Blocker;
use crate::error::WardenError;
use crate::host::{LaunchSpec, SessionHost};
use crate::registry::Registry;

/// Starts one agent per active session that has none registered, then waits
/// briefly for the new agents to check in.
pub struct AgentLauncher {
    registry: Arc<Registry>,
    host: Arc<dyn SessionHost>,
    spec: LaunchSpec,
    timeout: Duration,
    waiting: Mutex<Vec<Arc<Blocker>>>,
}

impl AgentLauncher {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(registry: Arc<Registry>, host: Arc<dyn SessionHost>, spec: LaunchSpec) -> Self {
        Self {
            registry,
            host,
            spec,
            timeout: Self::DEFAULT_TIMEOUT,
            waiting: Mutex::new(Vec::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn waiting(&self) -> MutexGuard<'_, Vec<Arc<Blocker>>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Usernames that already have an agent. Sessions are matched against
    /// these with [`crate::account::same_account`].
    pub async fn excluded_usernames(&self) -> HashSet<String> {
        self.registry.usernames().await.into_iter().collect()
    }

    /// Launch agents for every active session not yet registered.
    ///
    /// Returns the number of processes started. When that is non-zero the
    /// call blocks until an agent registers or the launch timeout elapses.
    pub async fn launch_missing(&self) -> Result<usize, WardenError> {
        let excluded = self.excluded_usernames().await;

        // Armed before spawning so a fast agent cannot register unseen.
        let blocker = Arc::new(Blocker::new(self.timeout));
        self.waiting().push(Arc::clone(&blocker));

        let host = Arc::clone(&self.host);
        let spec = self.spec.clone();
        let spawned = tokio::task::spawn_blocking(move || {
            host.spawn_per_user_process(&spec, &excluded)
        })
        .await
        .map_err(|e| WardenError::LaunchFailed(e.to_string()))
        .and_then(|r| r.map_err(|e| WardenError::LaunchFailed(e.to_string())));

        let started = match spawned {
            Ok(n) => n,
            Err(e) => {
                self.forget(&blocker);
                return Err(e);
            }
        };

        if started > 0 {
            info!(started, exe = %self.spec.exe.display(), "launched session agents");
            let outcome = blocker.wait().await;
            debug!(?outcome, "done waiting for agents");
        }
        self.forget(&blocker);
        Ok(started)
    }

    /// Make sure an agent for `username` is registered, launching if needed.
    pub async fn ensure_agent_for(&self, username: &str) -> Result<(), WardenError> {
        if self.is_registered(username).await {
            return Ok(());
        }
        self.launch_missing().await?;
        if self.is_registered(username).await {
            Ok(())
        } else {
            Err(WardenError::NotConnected(username.to_string()))
        }
    }

    async fn is_registered(&self, username: &str) -> bool {
        if let Some(session) = self.registry.find_account(username).await {
            return session.is_connected();
        }
        false
    }

    /// Called by the server when an agent completes its handshake.
    pub fn agent_registered(&self) {
        for blocker in self.waiting().drain(..) {
            blocker.cancel();
        }
    }

    fn forget(&self, blocker: &Arc<Blocker>) {
        self.waiting().retain(|b| !Arc::ptr_eq(b, blocker));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::SessionInfo;
    use std::io;
    use std::path::PathBuf;
    use tokio::time::Instant;

    struct FakeHost {
        users: Vec<String>,
        spawned: Mutex<Vec<String>>,
    }

    impl FakeHost {
        fn new(users: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                users: users.iter().map(|u| u.to_string()).collect(),
                spawned: Mutex::new(Vec::new()),
            })
        }

        fn spawned(&self) -> Vec<String> {
            self.spawned.lock().unwrap().clone()
        }
    }

    impl SessionHost for FakeHost {
        fn list_active_sessions(&self) -> io::Result<Vec<SessionInfo>> {
            Ok(self
                .users
                .iter()
                .enumerate()
                .map(|(i, u)| SessionInfo {
                    session_id: i as u32,
                    username: u.clone(),
                })
                .collect())
        }

        fn spawn_in_session(&self, session: &SessionInfo, _spec: &LaunchSpec) -> io::Result<()> {
            self.spawned.lock().unwrap().push(session.username.clone());
            Ok(())
        }
    }

    struct BrokenHost;

    impl SessionHost for BrokenHost {
        fn list_active_sessions(&self) -> io::Result<Vec<SessionInfo>> {
            Err(io::Error::other("WTSEnumerateSessions failed"))
        }

        fn spawn_in_session(&self, _: &SessionInfo, _: &LaunchSpec) -> io::Result<()> {
            Ok(())
        }
    }

    fn spec() -> LaunchSpec {
        LaunchSpec {
            exe: PathBuf::from("warden-agent"),
            args: vec![],
            workdir: PathBuf::from("."),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spawns_only_for_unregistered_sessions() -> anyhow::Result<()> {
        let registry = Arc::new(Registry::new());
        let alice = registry.register("alice").await?;
        registry.connect(&alice);
        let host = FakeHost::new(&["alice", "bob"]);
        let launcher = AgentLauncher::new(Arc::clone(&registry), host.clone(), spec());

        let started = launcher.launch_missing().await?;
        assert_eq!(started, 1);
        assert_eq!(host.spawned(), vec!["bob".to_string()]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn short_form_registration_excludes_domain_session() -> anyhow::Result<()> {
        let registry = Arc::new(Registry::new());
        registry.register(r"CORP\alice").await?;
        let host = FakeHost::new(&["alice"]);
        let launcher = AgentLauncher::new(Arc::clone(&registry), host.clone(), spec());

        assert_eq!(launcher.launch_missing().await?, 0);
        assert!(host.spawned().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn same_short_name_in_other_domain_still_gets_an_agent() -> anyhow::Result<()> {
        let registry = Arc::new(Registry::new());
        registry.register(r"CORP\alice").await?;
        let host = FakeHost::new(&[r"OTHER\alice"]);
        let launcher = AgentLauncher::new(Arc::clone(&registry), host.clone(), spec());

        assert_eq!(launcher.launch_missing().await?, 1);
        assert_eq!(host.spawned(), vec![r"OTHER\alice".to_string()]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_to_start_returns_without_waiting() -> anyhow::Result<()> {
        let registry = Arc::new(Registry::new());
        let launcher = AgentLauncher::new(registry, FakeHost::new(&[]), spec());
        let start = Instant::now();
        assert_eq!(launcher.launch_missing().await?, 0);
        assert!(start.elapsed() < Duration::from_secs(1));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_full_timeout_when_nobody_registers() -> anyhow::Result<()> {
        let registry = Arc::new(Registry::new());
        let launcher = AgentLauncher::new(registry, FakeHost::new(&["bob"]), spec())
            .with_timeout(Duration::from_secs(5));
        let start = Instant::now();
        launcher.launch_missing().await?;
        assert!(start.elapsed() >= Duration::from_secs(5));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn registration_cuts_the_wait_short() -> anyhow::Result<()> {
        let registry = Arc::new(Registry::new());
        let launcher = Arc::new(AgentLauncher::new(
            Arc::clone(&registry),
            FakeHost::new(&["bob"]),
            spec(),
        ));

        let task = {
            let launcher = Arc::clone(&launcher);
            tokio::spawn(async move { launcher.ensure_agent_for("bob").await })
        };

        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let bob = registry.register("bob").await?;
        registry.connect(&bob);
        launcher.agent_registered();

        task.await??;
        assert!(start.elapsed() < Duration::from_secs(5));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_reports_not_connected_after_timeout() {
        let registry = Arc::new(Registry::new());
        let launcher = AgentLauncher::new(registry, FakeHost::new(&["bob"]), spec())
            .with_timeout(Duration::from_millis(500));
        let err = launcher.ensure_agent_for("bob").await.unwrap_err();
        assert!(matches!(err, WardenError::NotConnected(ref u) if u == "bob"));
    }

    #[tokio::test]
    async fn host_failure_surfaces_as_launch_failed() {
        let registry = Arc::new(Registry::new());
        let launcher = AgentLauncher::new(registry, Arc::new(BrokenHost), spec());
        assert!(matches!(
            launcher.launch_missing().await,
            Err(WardenError::LaunchFailed(_))
        ));
        assert!(launcher.waiting().is_empty());
    }
}

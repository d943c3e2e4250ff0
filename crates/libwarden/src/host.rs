//! OS capabilities the control plane depends on.
//!
//! Session enumeration, per-user process creation and screen locking are
//! platform services; the control plane only sees these traits. The local
//! implementations cover the single-user case and are what the binaries use
//! unless something richer is plugged in.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use crate::account;

/// An interactive logon session on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: u32,
    pub username: String,
}

/// What to start inside each user session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub exe: PathBuf,
    pub args: Vec<String>,
    pub workdir: PathBuf,
}

pub trait SessionHost: Send + Sync {
    fn list_active_sessions(&self) -> io::Result<Vec<SessionInfo>>;

    fn spawn_in_session(&self, session: &SessionInfo, spec: &LaunchSpec) -> io::Result<()>;

    /// Start `spec` in every active session whose user is not in `excluded`.
    ///
    /// Returns how many processes were started. A failure in one session does
    /// not stop the others; the call only fails if nothing could be started
    /// and at least one attempt errored.
    fn spawn_per_user_process(
        &self,
        spec: &LaunchSpec,
        excluded: &HashSet<String>,
    ) -> io::Result<usize> {
        let mut started = 0;
        let mut last_err = None;
        for session in self.list_active_sessions()? {
            let skip = excluded
                .iter()
                .any(|name| account::same_account(name, &session.username));
            if skip {
                debug!(username = %session.username, "agent already registered, skipping");
                continue;
            }
            match self.spawn_in_session(&session, spec) {
                Ok(()) => {
                    debug!(username = %session.username, session_id = session.session_id, "agent started");
                    started += 1;
                }
                Err(e) => {
                    warn!(username = %session.username, error = %e, "failed to start agent");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if started == 0 => Err(e),
            _ => Ok(started),
        }
    }
}

pub trait ScreenLocker: Send + Sync {
    fn lock_current_session(&self) -> io::Result<()>;
}

/// Treats the account running this process as the only interactive session.
pub struct LocalSessionHost {
    username: Option<String>,
}

impl LocalSessionHost {
    pub fn new() -> Self {
        Self {
            username: account::current_username(),
        }
    }
}

impl Default for LocalSessionHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHost for LocalSessionHost {
    fn list_active_sessions(&self) -> io::Result<Vec<SessionInfo>> {
        Ok(self
            .username
            .iter()
            .map(|username| SessionInfo {
                session_id: 0,
                username: username.clone(),
            })
            .collect())
    }

    fn spawn_in_session(&self, session: &SessionInfo, spec: &LaunchSpec) -> io::Result<()> {
        let mut child = Command::new(&spec.exe)
            .args(&spec.args)
            .current_dir(&spec.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        // The agent outlives this call; reap it whenever it exits.
        let username = session.username.clone();
        std::thread::Builder::new()
            .name("agent-reaper".to_string())
            .spawn(move || match child.wait() {
                Ok(status) => debug!(%username, %status, "agent process exited"),
                Err(e) => warn!(%username, error = %e, "failed to wait for agent process"),
            })?;
        Ok(())
    }
}

/// Locks the screen by running an external program.
#[derive(Debug, Clone)]
pub struct CommandScreenLocker {
    program: String,
    args: Vec<String>,
}

impl CommandScreenLocker {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parse a whitespace-separated command line such as `loginctl lock-session`.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

impl Default for CommandScreenLocker {
    fn default() -> Self {
        if cfg!(windows) {
            Self::new("rundll32.exe", vec!["user32.dll,LockWorkStation".to_string()])
        } else {
            Self::new("loginctl", vec!["lock-session".to_string()])
        }
    }
}

impl ScreenLocker for CommandScreenLocker {
    fn lock_current_session(&self) -> io::Result<()> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "{} exited with {status}",
                self.program
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeHost {
        sessions: Vec<SessionInfo>,
        fail_for: Option<String>,
        spawned: Mutex<Vec<String>>,
    }

    impl SessionHost for FakeHost {
        fn list_active_sessions(&self) -> io::Result<Vec<SessionInfo>> {
            Ok(self.sessions.clone())
        }

        fn spawn_in_session(&self, session: &SessionInfo, _spec: &LaunchSpec) -> io::Result<()> {
            if self.fail_for.as_deref() == Some(session.username.as_str()) {
                return Err(io::Error::other("access denied"));
            }
            self.spawned.lock().unwrap().push(session.username.clone());
            Ok(())
        }
    }

    fn host(users: &[&str], fail_for: Option<&str>) -> FakeHost {
        FakeHost {
            sessions: users
                .iter()
                .enumerate()
                .map(|(i, u)| SessionInfo {
                    session_id: i as u32 + 1,
                    username: u.to_string(),
                })
                .collect(),
            fail_for: fail_for.map(str::to_string),
            spawned: Mutex::new(Vec::new()),
        }
    }

    fn spec() -> LaunchSpec {
        LaunchSpec {
            exe: PathBuf::from("warden-agent"),
            args: vec![],
            workdir: PathBuf::from("."),
        }
    }

    #[test]
    fn skips_excluded_users_including_short_forms() {
        let host = host(&[r"CORP\alice", "bob", r"CORP\carol"], None);
        let excluded: HashSet<String> = ["alice".to_string(), r"CORP\carol".to_string()].into();
        let started = host.spawn_per_user_process(&spec(), &excluded).unwrap();
        assert_eq!(started, 1);
        assert_eq!(*host.spawned.lock().unwrap(), vec!["bob".to_string()]);
    }

    #[test]
    fn other_domain_with_same_short_name_is_not_excluded() {
        let host = host(&[r"OTHER\alice"], None);
        let excluded: HashSet<String> = [r"CORP\alice".to_string()].into();
        let started = host.spawn_per_user_process(&spec(), &excluded).unwrap();
        assert_eq!(started, 1);
    }

    #[test]
    fn partial_failure_still_counts_successes() {
        let host = host(&["alice", "bob"], Some("alice"));
        let started = host
            .spawn_per_user_process(&spec(), &HashSet::new())
            .unwrap();
        assert_eq!(started, 1);
    }

    #[test]
    fn total_failure_is_an_error() {
        let host = host(&["alice"], Some("alice"));
        assert!(host.spawn_per_user_process(&spec(), &HashSet::new()).is_err());
    }

    #[test]
    fn lock_command_line_parsing() {
        let locker = CommandScreenLocker::from_command_line("loginctl lock-session 3").unwrap();
        assert_eq!(locker.program, "loginctl");
        assert_eq!(locker.args, vec!["lock-session", "3"]);
        assert!(CommandScreenLocker::from_command_line("   ").is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn exited_agent_process_is_reaped() {
        use std::time::{Duration, Instant};

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("agent.pid");
        let spec = LaunchSpec {
            exe: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), format!("echo $$ > {}", pid_file.display())],
            workdir: dir.path().to_path_buf(),
        };
        let session = SessionInfo {
            session_id: 0,
            username: "tester".into(),
        };
        LocalSessionHost { username: None }
            .spawn_in_session(&session, &spec)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let pid = loop {
            if let Some(pid) = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
            {
                break pid;
            }
            assert!(Instant::now() < deadline, "agent never started");
            std::thread::sleep(Duration::from_millis(10));
        };

        // A zombie keeps its /proc entry until someone waits on it.
        let proc_entry = PathBuf::from(format!("/proc/{pid}"));
        while proc_entry.exists() {
            assert!(Instant::now() < deadline, "exited agent was never reaped");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[cfg(unix)]
    #[test]
    fn failing_lock_command_reports_error() {
        assert!(CommandScreenLocker::new("true", vec![]).lock_current_session().is_ok());
        assert!(CommandScreenLocker::new("false", vec![]).lock_current_session().is_err());
    }
}

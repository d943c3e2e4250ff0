use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use libwarden::{AgentLauncher, DEFAULT_QUEUE_CAPACITY, LaunchSpec};
use warden_protocol::{CustomCommandSpec, paths};

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub queue_capacity: usize,
    pub write_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub launch_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub agent_exe: Option<PathBuf>,
    pub agent_args: Vec<String>,
    pub agent_workdir: Option<PathBuf>,
    /// Named commands agents may be asked to run, as `[[commands]]` tables.
    pub commands: Vec<CustomCommandSpec>,
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        // Try to load from config file, fall back to defaults
        let config_path = paths::config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for command in &self.commands {
            if command.name.trim().is_empty() {
                bail!("command {:?} has no name", command.cmd);
            }
            if command.cmd.trim().is_empty() {
                bail!("command {} has no program", command.name);
            }
            if !seen.insert(command.name.as_str()) {
                bail!("command {} is defined twice", command.name);
            }
        }
        Ok(())
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Resolve what the launcher starts in each user session.
    pub fn launch_spec(&self) -> anyhow::Result<LaunchSpec> {
        let exe = match &self.agent_exe {
            Some(exe) => exe.clone(),
            None => {
                let current = std::env::current_exe().context("cannot get executable path")?;
                current.with_file_name(paths::agent_exe_name())
            }
        };
        let workdir = match &self.agent_workdir {
            Some(dir) => dir.clone(),
            None => exe
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        let mut args = self.agent_args.clone();
        if !args.iter().any(|a| a == "--addr") {
            args.push("--addr".to_string());
            args.push(self.listen_addr.clone());
        }
        Ok(LaunchSpec { exe, args, workdir })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: paths::DEFAULT_LISTEN_ADDR.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            write_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            idle_timeout_secs: 90,
            launch_timeout_ms: AgentLauncher::DEFAULT_TIMEOUT.as_millis() as u64,
            shutdown_grace_ms: 2_000,
            agent_exe: None,
            agent_args: Vec::new(),
            agent_workdir: None,
            commands: Vec::new(),
        }
    }
}

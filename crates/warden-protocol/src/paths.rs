use std::path::PathBuf;

/// Loopback address the master listens on unless configured otherwise.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:2095";

/// Returns the config/data directory path for warden.
pub fn dirs_path() -> PathBuf {
    if let Ok(dir) = std::env::var("WARDEN_HOME") {
        PathBuf::from(dir)
    } else if let Ok(program_data) = std::env::var("ProgramData") {
        PathBuf::from(program_data).join("warden")
    } else if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("warden")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("warden")
    } else {
        std::env::temp_dir().join("warden")
    }
}

/// Returns the config file path for the warden server.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("WARDEN_CONFIG") {
        return PathBuf::from(path);
    }
    dirs_path().join("server.toml")
}

/// File name of the agent executable on this platform.
pub fn agent_exe_name() -> &'static str {
    if cfg!(windows) {
        "warden-agent.exe"
    } else {
        "warden-agent"
    }
}

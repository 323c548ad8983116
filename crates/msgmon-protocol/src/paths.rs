use std::path::PathBuf;

/// Returns the default socket path for the msgmon server.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("msgmon.sock")
    } else {
        // SAFETY: getuid() is always safe to call and has no preconditions
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/msgmon-{uid}.sock"))
    }
}

/// Returns the config/data directory path for msgmon.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("msgmon")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("msgmon")
    } else {
        PathBuf::from("/tmp/msgmon")
    }
}

/// Returns the default PID file path for the msgmon server.
pub fn pid_file_path() -> PathBuf {
    dirs_path().join("msgmon.pid")
}

/// Returns the config file path for the msgmon server.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}

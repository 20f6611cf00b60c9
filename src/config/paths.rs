//! Per-user filesystem paths for the daemon.
//!
//! Runtime artifacts (socket, state file, PID file) live in the temp
//! directory keyed by user name so multiple users on one machine never
//! collide. The cache gets a proper per-user cache directory.

use std::path::PathBuf;

/// Directory for the socket, state file and PID file.
/// `SPEAKD_RUNTIME_DIR` overrides; defaults to the system temp dir.
pub fn runtime_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("SPEAKD_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }
    std::env::temp_dir()
}

fn user_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

/// Unix socket the daemon listens on. `SPEAKD_SOCK` overrides.
pub fn socket_path() -> PathBuf {
    if let Some(p) = std::env::var_os("SPEAKD_SOCK") {
        return PathBuf::from(p);
    }
    runtime_dir().join(format!("speakd-{}.sock", user_name()))
}

/// JSON state file rewritten on every queue transition.
pub fn state_path() -> PathBuf {
    runtime_dir().join(format!("speakd-{}.state.json", user_name()))
}

/// PID file written next to the socket for lifecycle tooling.
pub fn pid_path() -> PathBuf {
    runtime_dir().join(format!("speakd-{}.pid", user_name()))
}

/// Root of the two-tier audio cache. `SPEAKD_CACHE_DIR` overrides;
/// defaults to the platform cache directory.
pub fn cache_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("SPEAKD_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("speakd")
}

/// Directory for the rolling daemon log file.
pub fn log_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("speakd")
        .join("logs")
}

/// Optional caller profile overrides (voice + gain per caller).
pub fn callers_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("speakd")
        .join("callers.json")
}

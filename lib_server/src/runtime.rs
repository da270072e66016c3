//! Runtime configuration resolved from the environment.
//!
//! Everything else is programmatic; the environment only decides where the
//! framework keeps its runtime files and how patient a stop is. Binaries
//! load `.env` files with `dotenvy` before touching this.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::ConfigError;

/// Environment variable overriding the runtime directory.
pub const RUNTIME_DIR_ENV: &str = "SERVER_RUNTIME_DIR";
/// Environment variable overriding the log file path.
pub const LOG_FILE_ENV: &str = "SERVER_LOG_FILE";
/// Environment variable overriding the stop timeout (seconds).
pub const STOP_TIMEOUT_ENV: &str = "SERVER_STOP_TIMEOUT";

const DEFAULT_STOP_TIMEOUT_SECS: u64 = 2;

/// Paths and limits one master/worker family runs with. The pid, lock and
/// status files are derived from a hash of the start binary path, so two
/// different applications never collide in a shared runtime directory.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub runtime_dir: PathBuf,
    pub pid_file: PathBuf,
    pub lock_file: PathBuf,
    pub status_file: PathBuf,
    pub log_file: PathBuf,
    pub stop_timeout: Duration,
}

impl RuntimeConfig {
    pub fn resolve() -> Result<Self, ConfigError> {
        let start_file = env::current_exe().unwrap_or_else(|_| PathBuf::from("server"));
        let mut hasher = Sha256::new();
        hasher.update(start_file.to_string_lossy().as_bytes());
        let digest = hex::encode(hasher.finalize());
        let tag = &digest[..16];

        let runtime_dir = env::var_os(RUNTIME_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::state_dir().map(|dir| dir.join("lib_server")))
            .unwrap_or_else(|| env::temp_dir().join("lib_server"));
        std::fs::create_dir_all(&runtime_dir).map_err(|source| ConfigError::RuntimeDir {
            path: runtime_dir.display().to_string(),
            source,
        })?;

        let log_file = env::var_os(LOG_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| runtime_dir.join("server.log"));

        let stop_timeout = env::var(STOP_TIMEOUT_ENV)
            .ok()
            .and_then(|value| value.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS));

        Ok(Self {
            pid_file: runtime_dir.join(format!("{tag}.pid")),
            lock_file: runtime_dir.join(format!("{tag}.pid.lock")),
            status_file: runtime_dir.join(format!("{tag}.status")),
            runtime_dir,
            log_file,
            stop_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_creates_the_runtime_dir_and_derives_paths() {
        let tmp = tempfile::tempdir().unwrap();
        env::set_var(RUNTIME_DIR_ENV, tmp.path().join("nested"));
        let config = RuntimeConfig::resolve().unwrap();
        env::remove_var(RUNTIME_DIR_ENV);

        assert!(config.runtime_dir.is_dir());
        assert!(config.pid_file.to_string_lossy().ends_with(".pid"));
        assert!(config.status_file.to_string_lossy().ends_with(".status"));
        assert_eq!(config.stop_timeout, Duration::from_secs(2));
        // The tag is stable for the same binary.
        let again = {
            env::set_var(RUNTIME_DIR_ENV, tmp.path().join("nested"));
            let c = RuntimeConfig::resolve().unwrap();
            env::remove_var(RUNTIME_DIR_ENV);
            c
        };
        assert_eq!(config.pid_file, again.pid_file);
    }
}

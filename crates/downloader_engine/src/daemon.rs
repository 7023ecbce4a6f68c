use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};

use engine_logging::{engine_debug, engine_error, engine_info, engine_warn};
use rand::Rng;
use sysinfo::System;
use thiserror::Error;

use crate::config::{DaemonConfig, EngineConfig};
use crate::install::{install_daemon, InstallError};
use crate::persist::{ensure_output_dir, PersistError};

const SECRET_PREFIX: &str = "dl_";
const SECRET_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("daemon executable {0} not found and no download location is configured")]
    MissingBinary(PathBuf),
    #[error("could not install daemon: {0}")]
    Install(#[from] InstallError),
    #[error("could not start daemon: {0}")]
    Spawn(#[source] io::Error),
    #[error(transparent)]
    OutputDir(#[from] PersistError),
}

/// What the RPC client needs to reach the daemon, and what the daemon is launched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConnection {
    pub secret: String,
    pub port: u16,
    pub executable: PathBuf,
    pub output_dir: PathBuf,
    pub max_concurrent: u32,
}

impl DaemonConnection {
    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}/jsonrpc", self.port)
    }
}

/// Lifecycle of the download daemon as seen by the orchestrator.
#[async_trait::async_trait]
pub trait DaemonControl: Send + Sync {
    /// Makes sure one daemon is listening. No-op while already running.
    async fn start(&self) -> Result<(), SupervisorError>;
    /// Force-kills the owned daemon, if any.
    fn stop(&self);
    fn is_running(&self) -> bool;
}

/// Random per-session RPC secret: `dl_` and eight lowercase alphanumerics.
pub fn generate_secret() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(SECRET_LEN)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect();
    format!("{SECRET_PREFIX}{suffix}")
}

/// Command-line flags the daemon is started with.
pub fn daemon_args(connection: &DaemonConnection) -> Vec<String> {
    vec![
        "--enable-rpc".to_string(),
        format!("--rpc-listen-port={}", connection.port),
        format!("--rpc-secret={}", connection.secret),
        format!("--dir={}", connection.output_dir.display()),
        format!("--max-concurrent-downloads={}", connection.max_concurrent),
        "--auto-file-renaming=true".to_string(),
        "--allow-overwrite=false".to_string(),
        "--console-log-level=warn".to_string(),
        "--quiet=true".to_string(),
    ]
}

/// Kills every process named `binary` except `keep`. Returns how many were killed.
pub fn sweep_orphans(binary: &str, keep: Option<u32>) -> usize {
    let system = System::new_all();
    let mut killed = 0;
    for (pid, process) in system.processes() {
        if keep == Some(pid.as_u32()) {
            continue;
        }
        if process.name().eq_ignore_ascii_case(binary) && process.kill() {
            engine_debug!("killed stale {binary} (pid {pid})");
            killed += 1;
        }
    }
    killed
}

/// Owns the daemon process for the lifetime of the host.
pub struct DaemonSupervisor {
    connection: DaemonConnection,
    config: DaemonConfig,
    child: Mutex<Option<Child>>,
    start_lock: tokio::sync::Mutex<()>,
}

impl DaemonSupervisor {
    pub fn new(config: &EngineConfig) -> Self {
        let connection = DaemonConnection {
            secret: generate_secret(),
            port: config.daemon.port,
            executable: config.daemon.executable.clone(),
            output_dir: config.output_dir.clone(),
            max_concurrent: config.daemon.max_concurrent,
        };
        Self {
            connection,
            config: config.daemon.clone(),
            child: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn connection(&self) -> &DaemonConnection {
        &self.connection
    }

    fn owned_pid(&self) -> Option<u32> {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Child::id)
    }

    fn spawn(&self) -> Result<Child, SupervisorError> {
        let mut command = Command::new(&self.connection.executable);
        command
            .args(daemon_args(&self.connection))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }
        command.spawn().map_err(SupervisorError::Spawn)
    }
}

#[async_trait::async_trait]
impl DaemonControl for DaemonSupervisor {
    async fn start(&self) -> Result<(), SupervisorError> {
        let _serialized = self.start_lock.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let binary = self.config.binary_name();
        let swept = sweep_orphans(&binary, self.owned_pid());
        if swept > 0 {
            engine_warn!("killed {swept} orphaned {binary} process(es)");
        }
        tokio::time::sleep(self.config.orphan_grace()).await;

        if !self.connection.executable.exists() {
            if self.config.archive_url.is_none() {
                engine_error!("{} not found", self.connection.executable.display());
                return Err(SupervisorError::MissingBinary(
                    self.connection.executable.clone(),
                ));
            }
            if let Err(err) = install_daemon(&self.config).await {
                engine_error!("daemon auto-fetch failed: {err}");
                return Err(err.into());
            }
        }

        ensure_output_dir(&self.connection.output_dir)?;
        let child = self.spawn()?;
        engine_info!(
            "daemon started on port {} (pid {})",
            self.connection.port,
            child.id()
        );
        *self.child.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);

        tokio::time::sleep(self.config.settle()).await;
        Ok(())
    }

    fn stop(&self) {
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut child) = child {
            if let Err(err) = child.kill() {
                engine_warn!("could not kill daemon: {err}");
            }
            let _ = child.wait();
            engine_info!("daemon stopped");
        }
    }

    fn is_running(&self) -> bool {
        let mut guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(child) = guard.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                engine_warn!("daemon exited on its own ({status})");
                *guard = None;
                false
            }
            Err(err) => {
                engine_warn!("could not query daemon process: {err}");
                false
            }
        }
    }
}

impl Drop for DaemonSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_has_prefix_and_lowercase_suffix() {
        let secret = generate_secret();
        let suffix = secret.strip_prefix("dl_").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}

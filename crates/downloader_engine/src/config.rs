use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// File name of the history store inside the output directory.
pub const HISTORY_FILE: &str = "download_history.ron";

const DAEMON_BINARY: &str = if cfg!(windows) { "aria2c.exe" } else { "aria2c" };
const SUBPROCESS_BINARY: &str = if cfg!(windows) { "yt-dlp.exe" } else { "yt-dlp" };
const DAEMON_ARCHIVE_URL: &str =
    "https://github.com/aria2/aria2/releases/download/release-1.37.0/aria2-1.37.0-win-64bit-build1.zip";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub output_dir: PathBuf,
    /// History store location; inside the output directory when unset.
    pub history_path: Option<PathBuf>,
    /// Attempts per daemon submission, also passed to both engines as their own retry count.
    pub retry_count: u32,
    pub submit_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub daemon: DaemonConfig,
    pub subprocess: SubprocessConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_with_output(PathBuf::from("downloads"))
    }
}

impl EngineConfig {
    pub fn default_with_output(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            history_path: None,
            retry_count: 3,
            submit_backoff_ms: 1000,
            poll_interval_ms: 500,
            daemon: DaemonConfig::default(),
            subprocess: SubprocessConfig::default(),
        }
    }

    pub fn history_path(&self) -> PathBuf {
        self.history_path
            .clone()
            .unwrap_or_else(|| self.output_dir.join(HISTORY_FILE))
    }

    pub fn submit_backoff(&self) -> Duration {
        Duration::from_millis(self.submit_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Submission attempts; never less than one.
    pub fn submit_attempts(&self) -> u32 {
        self.retry_count.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub executable: PathBuf,
    pub port: u16,
    pub max_concurrent: u32,
    /// Where to fetch the daemon from when the executable is missing.
    pub archive_url: Option<String>,
    pub fetch_timeout_ms: u64,
    pub max_archive_bytes: u64,
    pub orphan_grace_ms: u64,
    pub settle_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            executable: Path::new("bin").join(DAEMON_BINARY),
            port: 6800,
            max_concurrent: 3,
            archive_url: cfg!(windows).then(|| DAEMON_ARCHIVE_URL.to_string()),
            fetch_timeout_ms: 60_000,
            max_archive_bytes: 64 * 1024 * 1024,
            orphan_grace_ms: 200,
            settle_ms: 300,
            request_timeout_ms: 5_000,
        }
    }
}

impl DaemonConfig {
    /// Executable file name, used to find orphaned daemons and inside the archive.
    pub fn binary_name(&self) -> String {
        self.executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| DAEMON_BINARY.to_string())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_millis(self.orphan_grace_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubprocessConfig {
    pub executable: PathBuf,
    pub embed_metadata: bool,
    /// Extra command-line flags, split like a shell would.
    pub extra_flags: String,
    pub default_format: String,
    pub default_quality: String,
    /// Upper bound on a media info or search query; the query is killed on expiry.
    pub query_timeout_ms: u64,
    /// How many hits a media search lists.
    pub search_results: u32,
}

impl SubprocessConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(SUBPROCESS_BINARY),
            embed_metadata: true,
            extra_flags: String::new(),
            default_format: "flac".to_string(),
            default_quality: "0".to_string(),
            query_timeout_ms: 30_000,
            search_results: 15,
        }
    }
}

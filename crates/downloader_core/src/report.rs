use crate::entry::{basename, normalize_separators, JobEntry, JobStatus, TransitionError};

/// State of one job as reported by the download daemon's status query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonReport {
    /// Raw daemon state: `active`, `waiting`, `paused`, `error`, `complete`, `removed`.
    pub state: String,
    pub total_length: u64,
    pub completed_length: u64,
    pub download_speed: u64,
    pub error_message: String,
    /// Paths of the files the job writes, in daemon order.
    pub files: Vec<String>,
}

impl DaemonReport {
    /// Percent complete; 0 while the total size is unknown.
    pub fn progress(&self) -> f64 {
        if self.total_length == 0 {
            return 0.0;
        }
        self.completed_length as f64 / self.total_length as f64 * 100.0
    }

    /// Local status the daemon state maps to.
    pub fn mapped_status(&self) -> JobStatus {
        match self.state.as_str() {
            "complete" => JobStatus::Complete,
            "error" => JobStatus::Error,
            "paused" => JobStatus::Paused,
            _ => JobStatus::Active,
        }
    }
}

/// Folds a daemon status report into an RPC entry.
///
/// Returns the entry's new status. Terminal entries are left untouched.
pub fn apply_daemon_report(
    entry: &mut JobEntry,
    report: &DaemonReport,
) -> Result<JobStatus, TransitionError> {
    if entry.is_terminal() {
        return Ok(entry.status());
    }

    entry.set_progress(report.progress());
    entry.speed = report.download_speed;
    entry.total_size = report.total_length;

    if let Some(first) = report.files.first().filter(|f| !f.is_empty()) {
        entry.output_path = normalize_separators(first);
        if let Some(name) = basename(first) {
            entry.title = name.to_string();
        }
    }

    match report.mapped_status() {
        JobStatus::Complete => entry.complete(None)?,
        JobStatus::Error => {
            let message = if report.error_message.is_empty() {
                "download failed".to_string()
            } else {
                report.error_message.clone()
            };
            entry.fail(message)?;
        }
        JobStatus::Paused => {
            entry.advance(JobStatus::Paused)?;
            entry.speed = 0;
        }
        other => entry.advance(other)?,
    }
    Ok(entry.status())
}

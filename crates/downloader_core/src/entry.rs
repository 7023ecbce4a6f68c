use std::fmt;

/// Opaque job handle. Daemon-assigned for RPC jobs, locally minted otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id for the `n`-th subprocess job of this session.
    pub fn subprocess(n: u64) -> Self {
        Self(format!("proc_{n}"))
    }

    /// Id for the `n`-th entry restored from history.
    pub fn history(n: u64) -> Self {
        Self(format!("history_{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    /// Transfer delegated to the RPC-controlled daemon.
    Rpc,
    /// Transfer performed by one child process per job.
    Subprocess,
}

impl Engine {
    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Rpc => "rpc",
            Engine::Subprocess => "subprocess",
        }
    }

    /// Parses a persisted engine name. Accepts the legacy `aria2`/`ytdlp` spellings.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "rpc" | "aria2" => Some(Engine::Rpc),
            "subprocess" | "ytdlp" => Some(Engine::Subprocess),
            _ => None,
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Queued,
    Active,
    Paused,
    Complete,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "queued" => Some(JobStatus::Queued),
            "active" => Some(JobStatus::Active),
            "paused" => Some(JobStatus::Paused),
            "complete" => Some(JobStatus::Complete),
            "error" => Some(JobStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    /// Single-step edges of the job state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Active)
                | (Active, Paused)
                | (Active, Complete)
                | (Paused, Active)
                | (Queued, Error)
                | (Active, Error)
                | (Paused, Error)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job {id}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// One user-visible download.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEntry {
    pub id: JobId,
    pub source_id: String,
    pub url: String,
    pub title: String,
    pub output_path: String,
    pub error_message: String,
    pub speed: u64,
    pub total_size: u64,
    pub created_at: i64,
    status: JobStatus,
    engine: Engine,
    progress: f64,
}

impl JobEntry {
    /// A freshly submitted job. RPC jobs start queued, subprocess jobs start active.
    pub fn submitted(
        id: JobId,
        engine: Engine,
        source_id: impl Into<String>,
        url: impl Into<String>,
        title: impl Into<String>,
        created_at: i64,
    ) -> Self {
        let status = match engine {
            Engine::Rpc => JobStatus::Queued,
            Engine::Subprocess => JobStatus::Active,
        };
        let url = url.into();
        let title = title.into();
        Self {
            id,
            source_id: source_id.into(),
            title: if title.is_empty() { url.clone() } else { title },
            url,
            output_path: String::new(),
            error_message: String::new(),
            speed: 0,
            total_size: 0,
            created_at,
            status,
            engine,
            progress: 0.0,
        }
    }

    /// Rebuilds a terminal entry from persisted history.
    ///
    /// Returns `None` when `status` is not terminal: only finished jobs are restorable.
    #[allow(clippy::too_many_arguments)]
    pub fn restored(
        id: JobId,
        engine: Engine,
        status: JobStatus,
        source_id: String,
        url: String,
        title: String,
        output_path: String,
        error_message: String,
        created_at: i64,
    ) -> Option<Self> {
        if !status.is_terminal() {
            return None;
        }
        Some(Self {
            id,
            source_id,
            url,
            title,
            output_path,
            error_message,
            speed: 0,
            total_size: 0,
            created_at,
            status,
            engine,
            progress: if status == JobStatus::Complete { 100.0 } else { 0.0 },
        })
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Sets progress, clamped to `[0, 100]`. NaN counts as 0.
    pub fn set_progress(&mut self, percent: f64) {
        self.progress = if percent.is_nan() {
            0.0
        } else {
            percent.clamp(0.0, 100.0)
        };
    }

    /// Moves the entry to `next`.
    ///
    /// Staying in the current non-terminal state is a no-op. A target that is
    /// only reachable through `Active` (queued -> complete, paused -> complete,
    /// queued -> paused) passes through `Active` so every step is a DAG edge.
    pub fn advance(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if self.status == next && !next.is_terminal() {
            return Ok(());
        }
        if self.status.can_transition_to(next) {
            self.status = next;
            return Ok(());
        }
        if self.status.can_transition_to(JobStatus::Active)
            && JobStatus::Active.can_transition_to(next)
        {
            self.status = next;
            return Ok(());
        }
        Err(TransitionError {
            id: self.id.clone(),
            from: self.status,
            to: next,
        })
    }

    /// Moves the entry to `Error` with `message`, clearing the transfer rate.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.advance(JobStatus::Error)?;
        self.error_message = message.into();
        self.speed = 0;
        Ok(())
    }

    /// Moves the entry to `Complete` with the given final file.
    ///
    /// The display title becomes the file's basename when a path is known.
    pub fn complete(&mut self, output_path: Option<String>) -> Result<(), TransitionError> {
        self.advance(JobStatus::Complete)?;
        self.speed = 0;
        if let Some(path) = output_path.filter(|p| !p.is_empty()) {
            self.output_path = path;
        }
        if let Some(name) = basename(&self.output_path) {
            self.title = name.to_string();
        }
        Ok(())
    }
}

/// Last path component, splitting on either separator.
pub fn basename(path: &str) -> Option<&str> {
    path.rsplit(['/', '\\']).next().filter(|name| !name.is_empty())
}

/// Rewrites foreign path separators to the platform's own.
pub fn normalize_separators(path: &str) -> String {
    if std::path::MAIN_SEPARATOR == '\\' {
        path.replace('/', "\\")
    } else {
        path.to_string()
    }
}

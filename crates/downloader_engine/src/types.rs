use std::sync::mpsc;

use downloader_core::{Engine, JobEntry, JobId, JobStatus, TransitionError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Fresh copy of an entry after a poll tick or a user action.
    EntryUpdated(JobEntry),
    /// A job reached `Complete` with a known file.
    DownloadFinished { id: JobId, output_path: String },
    /// The entry was dropped from the queue.
    EntryRemoved(JobId),
}

/// Receives engine events. Called from the poll thread; implementations
/// hand events over to whichever thread owns the UI.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

pub struct ChannelEventSink {
    tx: mpsc::Sender<EngineEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: mpsc::Sender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end for the host's drain loop.
    pub fn channel() -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self::new(tx), rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("{message}")]
    Protocol { code: Option<i64>, message: String },
    #[error("malformed response: {0}")]
    Parse(String),
    #[error("empty result")]
    EmptyResult,
}

impl RpcError {
    /// The daemon could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RpcError::Transport(_) | RpcError::HttpStatus(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("download daemon is not running")]
    DaemonUnavailable,
    #[error("daemon did not accept {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: RpcError,
    },
    #[error("could not start download of {url}: {message}")]
    Runner { url: String, message: String },
    #[error("job id {0} is already tracked")]
    Duplicate(JobId),
}

/// Outcome of one `submit` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitReport {
    pub accepted: Vec<JobId>,
    pub failures: Vec<SubmitError>,
}

impl SubmitReport {
    pub fn is_complete_failure(&self) -> bool {
        self.accepted.is_empty() && !self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("no tracked job {0}")]
    UnknownJob(JobId),
    #[error("job {id} runs on the {engine} engine, which does not support this")]
    Unsupported { id: JobId, engine: Engine },
    #[error("job {id} is {status}")]
    InvalidState { id: JobId, status: JobStatus },
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

//! Downloader core: job entries, the status state machine and the pure
//! parsing rules shared by both download engines.
mod descriptor;
mod entry;
mod preset;
mod queue;
mod report;
mod source;
mod transcript;

pub use descriptor::DownloadDescriptor;
pub use entry::{
    basename, normalize_separators, Engine, JobEntry, JobId, JobStatus, TransitionError,
};
pub use preset::AudioPreset;
pub use queue::{JobQueue, QueueError};
pub use report::{apply_daemon_report, DaemonReport};
pub use source::{
    DirectUrlSource, MediaSource, MediaTarget, ResolveError, SourceRegistry, SourceResolver,
};
pub use transcript::{parse_percent, parse_rate, ExitOutcome, TranscriptScanner};

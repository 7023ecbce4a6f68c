//! Downloader engine: daemon supervision, both download backends, the
//! orchestrator's poll loop and history persistence.
mod config;
mod daemon;
mod install;
mod media;
mod orchestrator;
mod persist;
mod response;
mod rpc;
mod runner;
mod store;
mod types;

pub use config::{DaemonConfig, EngineConfig, SubprocessConfig, HISTORY_FILE};
pub use daemon::{
    daemon_args, generate_secret, sweep_orphans, DaemonConnection, DaemonControl,
    DaemonSupervisor, SupervisorError,
};
pub use install::{extract_entry, install_daemon, InstallError};
pub use media::{
    parse_hits, run_bounded, MediaHit, MediaLookupSource, QueryError, QueryOutput,
};
pub use orchestrator::{
    Orchestrator, OrchestratorError, CANCELLED_MESSAGE, INTERRUPTED_MESSAGE, NO_RESPONSE_MESSAGE,
};
pub use persist::{ensure_output_dir, AtomicFileWriter, PersistError};
pub use response::{parse_ack, parse_job_id, parse_status};
pub use rpc::{DaemonRpc, RpcClient};
pub use runner::{build_args, split_flags, JobRunner, RunnerError, SubprocessHandle};
pub use store::{parse_legacy, HistoryStore, PersistedRecord, StoreError, LEGACY_HISTORY_FILE};
pub use types::{
    ActionError, ChannelEventSink, EngineEvent, EventSink, RpcError, SubmitError, SubmitReport,
};

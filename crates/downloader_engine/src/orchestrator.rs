//! The unified job queue and its poll loop.
//!
//! All job state lives behind one async mutex owned by a dedicated
//! single-worker runtime. The poll loop runs on that worker; user actions
//! block the calling thread on the same runtime, so every state change is
//! serialized against the poll loop.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use downloader_core::{
    apply_daemon_report, normalize_separators, DaemonReport, DownloadDescriptor, Engine, ExitOutcome, JobEntry,
    JobId, JobQueue, JobStatus,
};
use engine_logging::{
    engine_debug, engine_error, engine_info, engine_trace, engine_warn, poll_tick, set_poll_tick,
};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::daemon::{DaemonControl, DaemonSupervisor, SupervisorError};
use crate::rpc::{DaemonRpc, RpcClient};
use crate::runner::{JobRunner, SubprocessHandle};
use crate::store::HistoryStore;
use crate::types::{ActionError, EngineEvent, EventSink, RpcError, SubmitError, SubmitReport};

pub const NO_RESPONSE_MESSAGE: &str = "No response from download daemon";
pub const CANCELLED_MESSAGE: &str = "Cancelled";
pub const INTERRUPTED_MESSAGE: &str = "Interrupted (host shut down)";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("could not start engine runtime: {0}")]
    Runtime(#[from] io::Error),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

struct QueueState {
    queue: JobQueue,
    processes: HashMap<JobId, SubprocessHandle>,
}

struct Shared {
    state: AsyncMutex<QueueState>,
    rpc: Arc<dyn DaemonRpc>,
    daemon: Arc<dyn DaemonControl>,
    runner: JobRunner,
    store: HistoryStore,
    sink: Arc<dyn EventSink>,
    config: EngineConfig,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
    runtime: tokio::runtime::Runtime,
}

impl Orchestrator {
    /// Orchestrator driving a real daemon and the stock RPC client.
    pub fn new(config: EngineConfig, sink: Arc<dyn EventSink>) -> Result<Self, OrchestratorError> {
        let supervisor = DaemonSupervisor::new(&config);
        let rpc = RpcClient::new(supervisor.connection(), config.daemon.request_timeout())?
            .with_max_tries(config.retry_count);
        Self::with_backends(config, Arc::new(rpc), Arc::new(supervisor), sink)
    }

    /// Orchestrator over caller-supplied daemon backends.
    ///
    /// Restores history and starts the poll loop before returning.
    pub fn with_backends(
        config: EngineConfig,
        rpc: Arc<dyn DaemonRpc>,
        daemon: Arc<dyn DaemonControl>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, OrchestratorError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("downloader-poll")
            .enable_all()
            .build()?;

        let store = HistoryStore::new(config.history_path());
        let queue = JobQueue::from_history(store.load());

        let shared = Arc::new(Shared {
            state: AsyncMutex::new(QueueState {
                queue,
                processes: HashMap::new(),
            }),
            rpc,
            daemon,
            runner: JobRunner::new(&config),
            store,
            sink,
            config,
        });

        let cancel = CancellationToken::new();
        let poll_task = runtime.spawn(poll_loop(shared.clone(), cancel.clone()));

        Ok(Self {
            shared,
            cancel,
            poll_task: Mutex::new(Some(poll_task)),
            shut_down: AtomicBool::new(false),
            runtime,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Starts the download daemon if it is not running yet.
    pub fn start_daemon(&self) -> Result<(), SupervisorError> {
        self.runtime.block_on(self.shared.daemon.start())
    }

    pub fn daemon_running(&self) -> bool {
        self.shared.daemon.is_running()
    }

    /// Hands `descriptors` to their engines. Items that fail are reported, not tracked.
    pub fn submit(&self, source_id: &str, descriptors: Vec<DownloadDescriptor>) -> SubmitReport {
        self.runtime
            .block_on(self.shared.submit(source_id, descriptors))
    }

    pub fn pause(&self, id: &JobId) -> Result<(), ActionError> {
        self.runtime.block_on(self.shared.pause(id))
    }

    pub fn resume(&self, id: &JobId) -> Result<(), ActionError> {
        self.runtime.block_on(self.shared.resume(id))
    }

    pub fn cancel(&self, id: &JobId) -> Result<(), ActionError> {
        self.runtime.block_on(self.shared.cancel(id))
    }

    /// Stops the job if it is still running and forgets it.
    pub fn remove(&self, id: &JobId) -> Result<(), ActionError> {
        self.runtime.block_on(self.shared.remove(id))
    }

    /// Forgets every finished job; returns how many were dropped.
    pub fn clear_finished(&self) -> usize {
        self.runtime.block_on(self.shared.clear_finished())
    }

    /// Copy of every tracked entry, in submission order.
    pub fn snapshot(&self) -> Vec<JobEntry> {
        self.shared.state.blocking_lock().queue.entries().to_vec()
    }

    pub fn has_live_jobs(&self) -> bool {
        self.shared.state.blocking_lock().queue.has_live()
    }

    /// Stops polling, terminates every running job and the daemon, and
    /// records the interrupted jobs. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        engine_info!("Shutting down download engine");
        self.cancel.cancel();
        let task = self
            .poll_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.runtime.block_on(async {
            if let Some(task) = task {
                if let Err(err) = task.await {
                    engine_warn!("poll loop ended abnormally: {err}");
                }
            }
            self.shared.shutdown().await;
        });
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn poll_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tick += 1;
                set_poll_tick(tick);
                shared.poll_once().await;
            }
        }
    }
    engine_debug!("poll loop stopped after {tick} ticks");
}

impl Shared {
    fn emit_all(&self, events: Vec<EngineEvent>) {
        for event in events {
            self.sink.emit(event);
        }
    }

    fn persist(&self, queue: &JobQueue) {
        match self.store.save(queue.entries()) {
            Ok(count) => engine_debug!("history saved ({count} records)"),
            Err(err) => engine_error!("Failed to save history to {:?}: {err}", self.store.path()),
        }
    }

    async fn poll_once(&self) {
        let mut events = Vec::new();
        let daemon_up = self.daemon.is_running();

        let mut guard = self.state.lock().await;
        let QueueState { queue, processes } = &mut *guard;
        let live: Vec<(JobId, Engine)> = queue
            .live_mut()
            .map(|entry| (entry.id.clone(), entry.engine()))
            .collect();
        engine_trace!("tick {}: {} live entries", poll_tick(), live.len());

        let mut finished_any = false;
        for (id, engine) in live {
            match engine {
                Engine::Rpc => {
                    let result = if daemon_up {
                        self.rpc.tell_status(&id).await
                    } else {
                        Err(RpcError::Transport("download daemon is not running".to_string()))
                    };
                    let Some(entry) = queue.get_mut(&id) else {
                        continue;
                    };
                    apply_status_result(entry, result);
                }
                Engine::Subprocess => {
                    let Some(entry) = queue.get_mut(&id) else {
                        continue;
                    };
                    if let Some(outcome) = poll_process(entry, processes.get_mut(&id)) {
                        processes.remove(&id);
                        apply_exit(entry, outcome);
                    }
                }
            }

            let Some(entry) = queue.get(&id) else {
                continue;
            };
            if entry.is_terminal() {
                finished_any = true;
                engine_debug!(
                    "tick {}: {id} finished as {}",
                    poll_tick(),
                    entry.status()
                );
                // Listeners treat the terminal update as the last event for the job.
                if entry.status() == JobStatus::Complete && !entry.output_path.is_empty() {
                    events.push(EngineEvent::DownloadFinished {
                        id: id.clone(),
                        output_path: entry.output_path.clone(),
                    });
                }
            }
            events.push(EngineEvent::EntryUpdated(entry.clone()));
        }

        if finished_any {
            self.persist(queue);
        }
        drop(guard);
        self.emit_all(events);
    }

    async fn submit(&self, source_id: &str, descriptors: Vec<DownloadDescriptor>) -> SubmitReport {
        let mut report = SubmitReport::default();
        let mut events = Vec::new();

        for descriptor in descriptors {
            let created_at = chrono::Utc::now().timestamp();
            match descriptor.engine {
                Engine::Rpc => {
                    let id = match self.add_with_retry(&descriptor).await {
                        Ok(id) => id,
                        Err(err) => {
                            report.failures.push(err);
                            continue;
                        }
                    };
                    let entry = JobEntry::submitted(
                        id.clone(),
                        Engine::Rpc,
                        source_id,
                        descriptor.url.as_str(),
                        descriptor.display_title(),
                        created_at,
                    );
                    let mut state = self.state.lock().await;
                    match state.queue.insert(entry.clone()) {
                        Ok(()) => {
                            engine_info!("Queued {} as {id}", descriptor.url);
                            events.push(EngineEvent::EntryUpdated(entry));
                            report.accepted.push(id);
                        }
                        Err(_) => report.failures.push(SubmitError::Duplicate(id)),
                    }
                }
                Engine::Subprocess => {
                    let (id, mut handle) = match self.runner.start(&descriptor) {
                        Ok(started) => started,
                        Err(err) => {
                            engine_error!("Could not start {}: {err}", descriptor.url);
                            report.failures.push(SubmitError::Runner {
                                url: descriptor.url.clone(),
                                message: err.to_string(),
                            });
                            continue;
                        }
                    };
                    let entry = JobEntry::submitted(
                        id.clone(),
                        Engine::Subprocess,
                        source_id,
                        descriptor.url.as_str(),
                        descriptor.display_title(),
                        created_at,
                    );
                    let mut state = self.state.lock().await;
                    match state.queue.insert(entry.clone()) {
                        Ok(()) => {
                            engine_info!("Started {} as {id}", descriptor.url);
                            state.processes.insert(id.clone(), handle);
                            events.push(EngineEvent::EntryUpdated(entry));
                            report.accepted.push(id);
                        }
                        Err(_) => {
                            handle.kill();
                            report.failures.push(SubmitError::Duplicate(id));
                        }
                    }
                }
            }
        }

        self.emit_all(events);
        report
    }

    async fn add_with_retry(&self, descriptor: &DownloadDescriptor) -> Result<JobId, SubmitError> {
        if !self.daemon.is_running() {
            engine_warn!("Cannot queue {}: download daemon is not running", descriptor.url);
            return Err(SubmitError::DaemonUnavailable);
        }

        let attempts = self.config.submit_attempts();
        let mut last = RpcError::EmptyResult;
        for attempt in 1..=attempts {
            match self.rpc.add_uri(descriptor).await {
                Ok(id) if !id.as_str().is_empty() => return Ok(id),
                Ok(_) => last = RpcError::EmptyResult,
                Err(err) => last = err,
            }
            engine_warn!(
                "Add attempt {attempt}/{attempts} for {} failed: {last}",
                descriptor.url
            );
            if attempt < attempts {
                tokio::time::sleep(self.config.submit_backoff()).await;
            }
        }

        engine_error!("Giving up on {} after {attempts} attempts", descriptor.url);
        Err(SubmitError::Exhausted {
            url: descriptor.url.clone(),
            attempts,
            last,
        })
    }

    async fn pause(&self, id: &JobId) -> Result<(), ActionError> {
        let mut state = self.state.lock().await;
        let entry = rpc_entry(&state.queue, id)?;
        if !matches!(entry.status(), JobStatus::Queued | JobStatus::Active) {
            return Err(ActionError::InvalidState {
                id: id.clone(),
                status: entry.status(),
            });
        }

        self.rpc.pause(id).await?;
        let entry = state
            .queue
            .get_mut(id)
            .ok_or_else(|| ActionError::UnknownJob(id.clone()))?;
        entry.advance(JobStatus::Paused)?;
        entry.speed = 0;
        let updated = entry.clone();
        drop(state);
        self.sink.emit(EngineEvent::EntryUpdated(updated));
        Ok(())
    }

    async fn resume(&self, id: &JobId) -> Result<(), ActionError> {
        let mut state = self.state.lock().await;
        let entry = rpc_entry(&state.queue, id)?;
        if entry.status() != JobStatus::Paused {
            return Err(ActionError::InvalidState {
                id: id.clone(),
                status: entry.status(),
            });
        }

        self.rpc.unpause(id).await?;
        let entry = state
            .queue
            .get_mut(id)
            .ok_or_else(|| ActionError::UnknownJob(id.clone()))?;
        entry.advance(JobStatus::Active)?;
        let updated = entry.clone();
        drop(state);
        self.sink.emit(EngineEvent::EntryUpdated(updated));
        Ok(())
    }

    async fn cancel(&self, id: &JobId) -> Result<(), ActionError> {
        let mut state = self.state.lock().await;
        let entry = state
            .queue
            .get(id)
            .ok_or_else(|| ActionError::UnknownJob(id.clone()))?;
        if entry.is_terminal() {
            return Err(ActionError::InvalidState {
                id: id.clone(),
                status: entry.status(),
            });
        }
        let engine = entry.engine();

        self.stop_backend(&mut state, id, engine).await;
        let entry = state
            .queue
            .get_mut(id)
            .ok_or_else(|| ActionError::UnknownJob(id.clone()))?;
        entry.fail(CANCELLED_MESSAGE)?;
        let updated = entry.clone();
        self.persist(&state.queue);
        drop(state);

        engine_info!("Cancelled {id}");
        self.sink.emit(EngineEvent::EntryUpdated(updated));
        Ok(())
    }

    async fn remove(&self, id: &JobId) -> Result<(), ActionError> {
        let mut state = self.state.lock().await;
        let entry = state
            .queue
            .get(id)
            .ok_or_else(|| ActionError::UnknownJob(id.clone()))?;
        if !entry.is_terminal() {
            let engine = entry.engine();
            self.stop_backend(&mut state, id, engine).await;
        }
        state.queue.remove(id);
        self.persist(&state.queue);
        drop(state);

        self.sink.emit(EngineEvent::EntryRemoved(id.clone()));
        Ok(())
    }

    async fn clear_finished(&self) -> usize {
        let mut state = self.state.lock().await;
        let finished: Vec<JobId> = state
            .queue
            .terminal_entries()
            .into_iter()
            .map(|entry| entry.id)
            .collect();
        let cleared = state.queue.clear_finished();
        if cleared > 0 {
            self.persist(&state.queue);
        }
        drop(state);

        self.emit_all(finished.into_iter().map(EngineEvent::EntryRemoved).collect());
        cleared
    }

    /// Stops whatever is transferring `id`; the entry itself is left alone.
    async fn stop_backend(&self, state: &mut QueueState, id: &JobId, engine: Engine) {
        match engine {
            Engine::Rpc => {
                if let Err(err) = self.rpc.remove(id).await {
                    engine_warn!("Daemon did not remove {id}: {err}");
                }
            }
            Engine::Subprocess => {
                if let Some(mut handle) = state.processes.remove(id) {
                    handle.kill();
                }
            }
        }
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().await;

        for (id, mut handle) in state.processes.drain() {
            engine_debug!("Killing {id} (pid {})", handle.pid());
            handle.kill();
        }

        if self.daemon.is_running() {
            let live_rpc: Vec<JobId> = state
                .queue
                .live_mut()
                .filter(|entry| entry.engine() == Engine::Rpc)
                .map(|entry| entry.id.clone())
                .collect();
            for id in live_rpc {
                if let Err(err) = self.rpc.remove(&id).await {
                    engine_warn!("Daemon did not remove {id}: {err}");
                }
            }
        }

        let mut events = Vec::new();
        match state.queue.interrupt_live(INTERRUPTED_MESSAGE) {
            Ok(ids) => {
                if !ids.is_empty() {
                    engine_info!("Interrupted {} unfinished jobs", ids.len());
                }
                events.extend(
                    ids.iter()
                        .filter_map(|id| state.queue.get(id))
                        .map(|entry| EngineEvent::EntryUpdated(entry.clone())),
                );
            }
            Err(err) => engine_error!("Could not interrupt jobs: {err}"),
        }
        self.persist(&state.queue);
        drop(state);

        self.emit_all(events);
        self.daemon.stop();
    }
}

fn rpc_entry<'a>(queue: &'a JobQueue, id: &JobId) -> Result<&'a JobEntry, ActionError> {
    let entry = queue
        .get(id)
        .ok_or_else(|| ActionError::UnknownJob(id.clone()))?;
    if entry.engine() != Engine::Rpc {
        return Err(ActionError::Unsupported {
            id: id.clone(),
            engine: entry.engine(),
        });
    }
    Ok(entry)
}

fn apply_status_result(entry: &mut JobEntry, result: Result<DaemonReport, RpcError>) {
    let outcome = match result {
        Ok(report) => apply_daemon_report(entry, &report).map(|_| ()),
        Err(err) if err.is_unreachable() => {
            engine_warn!("{}: {err}", entry.id);
            entry.fail(NO_RESPONSE_MESSAGE)
        }
        Err(RpcError::Protocol { message, .. }) => entry.fail(message),
        Err(err) => {
            engine_debug!("{}: skipping unreadable status: {err}", entry.id);
            Ok(())
        }
    };
    if let Err(err) = outcome {
        engine_warn!("{err}");
    }
}

/// Drains a subprocess job's output into its entry; returns the outcome once it exited.
fn poll_process(entry: &mut JobEntry, handle: Option<&mut SubprocessHandle>) -> Option<ExitOutcome> {
    let Some(handle) = handle else {
        return Some(ExitOutcome::Failed {
            message: "download process is no longer tracked".to_string(),
        });
    };
    let outcome = handle.poll();
    let scanner = handle.scanner();
    if let Some(progress) = scanner.progress() {
        entry.set_progress(progress);
    }
    if let Some(speed) = scanner.speed() {
        entry.speed = speed;
    }
    outcome
}

fn apply_exit(entry: &mut JobEntry, outcome: ExitOutcome) {
    let result = match outcome {
        ExitOutcome::Completed { output_path } => {
            entry.set_progress(100.0);
            entry.complete(output_path.map(|path| normalize_separators(&path)))
        }
        ExitOutcome::Failed { message } => entry.fail(message),
    };
    if let Err(err) = result {
        engine_warn!("{err}");
    }
}

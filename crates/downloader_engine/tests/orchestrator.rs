use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use downloader_core::{DaemonReport, DownloadDescriptor, Engine, JobEntry, JobId, JobStatus};
use downloader_engine::{
    ActionError, DaemonControl, DaemonRpc, EngineConfig, EngineEvent, EventSink, HistoryStore,
    Orchestrator, RpcError, SubmitError, SupervisorError, CANCELLED_MESSAGE, INTERRUPTED_MESSAGE,
    NO_RESPONSE_MESSAGE,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

/// In-memory daemon: replies come from per-id scripts, or from the state
/// that pause/unpause/remove calls leave behind.
#[derive(Default)]
struct ScriptedRpc {
    add_replies: Mutex<VecDeque<Result<JobId, RpcError>>>,
    status_scripts: Mutex<HashMap<JobId, VecDeque<Result<DaemonReport, RpcError>>>>,
    daemon_states: Mutex<HashMap<JobId, &'static str>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRpc {
    fn reply_to_add(&self, reply: Result<JobId, RpcError>) {
        self.add_replies.lock().unwrap().push_back(reply);
    }

    fn script_status(&self, id: &str, replies: Vec<Result<DaemonReport, RpcError>>) {
        self.status_scripts
            .lock()
            .unwrap()
            .insert(JobId::new(id), replies.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn set_state(&self, id: &JobId, state: &'static str) {
        self.daemon_states.lock().unwrap().insert(id.clone(), state);
    }
}

#[async_trait::async_trait]
impl DaemonRpc for ScriptedRpc {
    async fn add_uri(&self, descriptor: &DownloadDescriptor) -> Result<JobId, RpcError> {
        self.record(format!("addUri {}", descriptor.url));
        self.add_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(RpcError::EmptyResult))
    }

    async fn tell_status(&self, id: &JobId) -> Result<DaemonReport, RpcError> {
        if let Some(script) = self.status_scripts.lock().unwrap().get_mut(id) {
            let reply = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            };
            if let Some(reply) = reply {
                return reply;
            }
        }
        let state = self
            .daemon_states
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or("active");
        Ok(report(state, 1000, 100))
    }

    async fn pause(&self, id: &JobId) -> Result<(), RpcError> {
        self.record(format!("pause {id}"));
        self.set_state(id, "paused");
        Ok(())
    }

    async fn unpause(&self, id: &JobId) -> Result<(), RpcError> {
        self.record(format!("unpause {id}"));
        self.set_state(id, "active");
        Ok(())
    }

    async fn remove(&self, id: &JobId) -> Result<(), RpcError> {
        self.record(format!("remove {id}"));
        self.set_state(id, "removed");
        Ok(())
    }
}

struct FakeDaemon {
    running: AtomicBool,
    stops: AtomicUsize,
}

impl FakeDaemon {
    fn new(running: bool) -> Self {
        Self {
            running: AtomicBool::new(running),
            stops: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl DaemonControl for FakeDaemon {
    async fn start(&self) -> Result<(), SupervisorError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CollectingSink {
    fn finished(&self) -> Vec<(JobId, String)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                EngineEvent::DownloadFinished { id, output_path } => {
                    Some((id.clone(), output_path.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

struct Harness {
    orchestrator: Orchestrator,
    rpc: Arc<ScriptedRpc>,
    daemon: Arc<FakeDaemon>,
    sink: Arc<CollectingSink>,
    _temp: TempDir,
}

impl Harness {
    fn start(daemon_running: bool) -> Self {
        Self::start_with(daemon_running, |_| {}, |_| {})
    }

    fn start_with(
        daemon_running: bool,
        seed: impl FnOnce(&Path),
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        engine_logging::initialize_for_tests();
        let temp = TempDir::new().unwrap();
        seed(temp.path());
        let mut config = EngineConfig::default_with_output(temp.path());
        config.submit_backoff_ms = 5;
        config.poll_interval_ms = 20;
        tweak(&mut config);

        let rpc = Arc::new(ScriptedRpc::default());
        let daemon = Arc::new(FakeDaemon::new(daemon_running));
        let sink = Arc::new(CollectingSink::default());
        let orchestrator =
            Orchestrator::with_backends(config, rpc.clone(), daemon.clone(), sink.clone()).unwrap();
        Self {
            orchestrator,
            rpc,
            daemon,
            sink,
            _temp: temp,
        }
    }

    fn entry(&self, id: &JobId) -> Option<JobEntry> {
        self.orchestrator
            .snapshot()
            .into_iter()
            .find(|entry| &entry.id == id)
    }

    fn wait_for(&self, id: &JobId, what: impl Fn(&JobEntry) -> bool) -> JobEntry {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(entry) = self.entry(id).filter(|e| what(e)) {
                return entry;
            }
            assert!(Instant::now() < deadline, "timed out waiting on {id}: {:?}", self.entry(id));
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn history(&self) -> Vec<JobEntry> {
        HistoryStore::new(self.orchestrator.config().history_path()).load()
    }
}

fn report(state: &str, total: u64, completed: u64) -> DaemonReport {
    DaemonReport {
        state: state.to_string(),
        total_length: total,
        completed_length: completed,
        download_speed: 2048,
        error_message: String::new(),
        files: Vec::new(),
    }
}

fn direct(url: &str) -> DownloadDescriptor {
    DownloadDescriptor::new(url, Engine::Rpc)
}

#[test]
fn empty_job_id_on_every_attempt_creates_no_entry() {
    let harness = Harness::start(true);
    for _ in 0..3 {
        harness.rpc.reply_to_add(Ok(JobId::new("")));
    }

    let report = harness
        .orchestrator
        .submit("direct_url", vec![direct("https://example.com/a.flac")]);

    assert!(report.accepted.is_empty());
    assert_eq!(
        report.failures,
        vec![SubmitError::Exhausted {
            url: "https://example.com/a.flac".to_string(),
            attempts: 3,
            last: RpcError::EmptyResult,
        }]
    );
    assert_eq!(harness.rpc.calls().len(), 3);
    assert!(harness.orchestrator.snapshot().is_empty());
}

#[test]
fn add_succeeds_on_a_later_attempt() {
    let harness = Harness::start(true);
    harness
        .rpc
        .reply_to_add(Err(RpcError::Transport("connection refused".into())));
    harness.rpc.reply_to_add(Ok(JobId::new("gid-2")));

    let report = harness
        .orchestrator
        .submit("direct_url", vec![direct("https://example.com/b.flac")]);

    assert_eq!(report.accepted, vec![JobId::new("gid-2")]);
    assert_eq!(harness.rpc.calls().len(), 2);
}

#[test]
fn rpc_submission_needs_a_running_daemon() {
    let harness = Harness::start(false);

    let report = harness
        .orchestrator
        .submit("direct_url", vec![direct("https://example.com/a.flac")]);

    assert_eq!(report.failures, vec![SubmitError::DaemonUnavailable]);
    assert!(report.is_complete_failure());
    assert!(harness.rpc.calls().is_empty());

    harness.orchestrator.start_daemon().unwrap();
    assert!(harness.orchestrator.daemon_running());
}

#[test]
fn rpc_job_runs_to_completion_and_is_persisted() {
    let harness = Harness::start(true);
    harness.rpc.reply_to_add(Ok(JobId::new("gid1")));
    let mut done = report("complete", 1000, 1000);
    done.files = vec!["/downloads/a.flac".to_string()];
    harness.rpc.script_status(
        "gid1",
        vec![Ok(report("waiting", 0, 0)), Ok(report("active", 1000, 500)), Ok(done)],
    );

    let report = harness
        .orchestrator
        .submit("direct_url", vec![direct("https://example.com/a.flac").with_filename("a.flac")]);
    let id = JobId::new("gid1");
    assert_eq!(report.accepted, vec![id.clone()]);

    let entry = harness.wait_for(&id, |e| e.is_terminal());
    assert_eq!(entry.status(), JobStatus::Complete);
    assert_eq!(entry.progress(), 100.0);
    assert_eq!(entry.speed, 0);
    assert_eq!(entry.title, "a.flac");
    assert!(entry.output_path.ends_with("a.flac"));

    thread::sleep(Duration::from_millis(100));
    assert_eq!(harness.sink.finished(), vec![(id.clone(), entry.output_path.clone())]);
    let last_two: Vec<bool> = {
        let events = harness.sink.events.lock().unwrap();
        events
            .iter()
            .rev()
            .take(2)
            .map(|event| matches!(event, EngineEvent::EntryUpdated(e) if e.id == id && e.is_terminal()))
            .collect()
    };
    assert_eq!(last_two, vec![true, false], "finished event precedes the terminal update");

    let history = harness.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].url, "https://example.com/a.flac");
}

#[test]
fn unreachable_daemon_fails_the_entry() {
    let harness = Harness::start(true);
    harness.rpc.reply_to_add(Ok(JobId::new("gid1")));
    harness.rpc.script_status(
        "gid1",
        vec![Err(RpcError::Transport("connection refused".into()))],
    );

    harness
        .orchestrator
        .submit("direct_url", vec![direct("https://example.com/a.flac")]);

    let entry = harness.wait_for(&JobId::new("gid1"), |e| e.is_terminal());
    assert_eq!(entry.status(), JobStatus::Error);
    assert_eq!(entry.error_message, NO_RESPONSE_MESSAGE);
}

#[test]
fn daemon_exiting_on_its_own_fails_live_rpc_entries() {
    let harness = Harness::start(true);
    harness.rpc.reply_to_add(Ok(JobId::new("gid1")));

    harness
        .orchestrator
        .submit("direct_url", vec![direct("https://example.com/a.flac")]);
    harness.daemon.running.store(false, Ordering::SeqCst);

    let entry = harness.wait_for(&JobId::new("gid1"), |e| e.is_terminal());
    assert_eq!(entry.status(), JobStatus::Error);
    assert_eq!(entry.error_message, NO_RESPONSE_MESSAGE);
    assert!(!harness.orchestrator.has_live_jobs());
    assert_eq!(harness.history().len(), 1);
}

#[test]
fn daemon_error_report_carries_its_message() {
    let harness = Harness::start(true);
    harness.rpc.reply_to_add(Ok(JobId::new("gid1")));
    let mut failed = report("error", 0, 0);
    failed.error_message = "Resource not found".to_string();
    harness.rpc.script_status("gid1", vec![Ok(failed)]);

    harness
        .orchestrator
        .submit("direct_url", vec![direct("https://example.com/a.flac")]);

    let entry = harness.wait_for(&JobId::new("gid1"), |e| e.is_terminal());
    assert_eq!(entry.error_message, "Resource not found");
    assert!(harness.sink.finished().is_empty());
}

#[test]
fn unreadable_status_leaves_entry_untouched() {
    let harness = Harness::start(true);
    harness.rpc.reply_to_add(Ok(JobId::new("gid1")));
    harness
        .rpc
        .script_status("gid1", vec![Err(RpcError::Parse("garbage".into()))]);

    harness
        .orchestrator
        .submit("direct_url", vec![direct("https://example.com/a.flac")]);
    thread::sleep(Duration::from_millis(150));

    let entry = harness.entry(&JobId::new("gid1")).unwrap();
    assert_eq!(entry.status(), JobStatus::Queued);
}

#[test]
fn pause_resume_and_cancel_drive_the_daemon() {
    let harness = Harness::start(true);
    harness.rpc.reply_to_add(Ok(JobId::new("gid1")));
    harness
        .orchestrator
        .submit("direct_url", vec![direct("https://example.com/a.flac")]);
    let id = JobId::new("gid1");
    harness.wait_for(&id, |e| e.status() == JobStatus::Active);

    harness.orchestrator.pause(&id).unwrap();
    let paused = harness.entry(&id).unwrap();
    assert_eq!(paused.status(), JobStatus::Paused);
    assert_eq!(paused.speed, 0);
    assert_eq!(
        harness.orchestrator.pause(&id),
        Err(ActionError::InvalidState {
            id: id.clone(),
            status: JobStatus::Paused
        })
    );

    harness.orchestrator.resume(&id).unwrap();
    assert_eq!(harness.entry(&id).unwrap().status(), JobStatus::Active);

    harness.orchestrator.cancel(&id).unwrap();
    let cancelled = harness.entry(&id).unwrap();
    assert_eq!(cancelled.status(), JobStatus::Error);
    assert_eq!(cancelled.error_message, CANCELLED_MESSAGE);
    assert!(harness.orchestrator.cancel(&id).is_err());

    let calls = harness.rpc.calls();
    assert_eq!(
        calls[1..],
        ["pause gid1", "unpause gid1", "remove gid1"].map(String::from)
    );
    assert_eq!(harness.history().len(), 1);
}

#[test]
fn actions_on_unknown_jobs_fail() {
    let harness = Harness::start(true);
    let ghost = JobId::new("ghost");
    assert_eq!(
        harness.orchestrator.pause(&ghost),
        Err(ActionError::UnknownJob(ghost.clone()))
    );
    assert_eq!(
        harness.orchestrator.remove(&ghost),
        Err(ActionError::UnknownJob(ghost))
    );
}

#[test]
fn history_is_restored_and_can_be_cleared() {
    let harness = Harness::start_with(
        true,
        |dir| {
            let store = HistoryStore::new(dir.join(downloader_engine::HISTORY_FILE));
            let mut entry = JobEntry::submitted(
                JobId::new("old"),
                Engine::Rpc,
                "direct_url",
                "https://example.com/old.mp3",
                "",
                0,
            );
            entry.complete(Some("/music/old.mp3".into())).unwrap();
            store.save(&[entry]).unwrap();
        },
        |_| {},
    );

    let snapshot = harness.orchestrator.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, JobId::history(1));
    assert_eq!(snapshot[0].title, "old.mp3");
    assert!(!harness.orchestrator.has_live_jobs());

    assert_eq!(harness.orchestrator.clear_finished(), 1);
    assert!(harness.orchestrator.snapshot().is_empty());
    assert!(harness.history().is_empty());
}

#[test]
fn removing_a_live_job_stops_it() {
    let harness = Harness::start(true);
    harness.rpc.reply_to_add(Ok(JobId::new("gid1")));
    harness
        .orchestrator
        .submit("direct_url", vec![direct("https://example.com/a.flac")]);

    harness.orchestrator.remove(&JobId::new("gid1")).unwrap();
    assert!(harness.orchestrator.snapshot().is_empty());
    assert!(harness.rpc.calls().contains(&"remove gid1".to_string()));
}

#[cfg(unix)]
mod subprocess {
    use super::*;
    use pretty_assertions::assert_eq;

    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn start_with_script(body: &'static str) -> Harness {
        Harness::start_with(
            true,
            |_| {},
            |config| {
                let bin = config.output_dir.join("bin");
                fs::create_dir_all(&bin).unwrap();
                config.subprocess.executable = script(&bin, "fake-extractor", body);
            },
        )
    }

    fn media() -> DownloadDescriptor {
        DownloadDescriptor::new("https://video.example.com/watch?v=1", Engine::Subprocess)
    }

    #[test]
    fn extraction_destination_completes_the_job_once() {
        let harness = start_with_script(
            "echo '[download] Destination: /x/song.webm'\n\
             echo '[download]  50.0% of 1.00MiB at 1.00MiB/s ETA 00:01'\n\
             echo '[ExtractAudio] Destination: /x/song.flac'\n\
             exit 0",
        );

        let report = harness.orchestrator.submit("media", vec![media()]);
        let id = report.accepted[0].clone();
        assert_eq!(id, JobId::new("proc_1"));

        let entry = harness.wait_for(&id, |e| e.is_terminal());
        assert_eq!(entry.status(), JobStatus::Complete);
        assert_eq!(entry.output_path, "/x/song.flac");
        assert_eq!(entry.title, "song.flac");
        assert_eq!(entry.progress(), 100.0);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(
            harness.sink.finished(),
            vec![(id, "/x/song.flac".to_string())]
        );
    }

    #[test]
    fn failing_process_reports_its_last_error_line() {
        let harness = start_with_script(
            "echo 'ERROR: [youtube] 1: Video unavailable' >&2\n\
             exit 1",
        );

        let id = harness.orchestrator.submit("media", vec![media()]).accepted[0].clone();
        let entry = harness.wait_for(&id, |e| e.is_terminal());
        assert_eq!(entry.status(), JobStatus::Error);
        assert_eq!(entry.error_message, "ERROR: [youtube] 1: Video unavailable");
    }

    #[test]
    fn stdout_and_stderr_are_read_in_print_order() {
        let harness = start_with_script(
            "echo 'ERROR: early failure on stderr' >&2\n\
             echo 'ERROR: late failure on stdout'\n\
             echo 'ERROR: final failure on stderr' >&2\n\
             exit 1",
        );

        let id = harness.orchestrator.submit("media", vec![media()]).accepted[0].clone();
        let entry = harness.wait_for(&id, |e| e.is_terminal());
        assert_eq!(entry.error_message, "ERROR: final failure on stderr");
    }

    #[test]
    fn subprocess_jobs_cannot_be_paused() {
        let harness = start_with_script("exec sleep 30");
        let id = harness.orchestrator.submit("media", vec![media()]).accepted[0].clone();

        assert_eq!(
            harness.orchestrator.pause(&id),
            Err(ActionError::Unsupported {
                id: id.clone(),
                engine: Engine::Subprocess
            })
        );
        harness.orchestrator.cancel(&id).unwrap();
        assert_eq!(harness.entry(&id).unwrap().error_message, CANCELLED_MESSAGE);
    }

    #[test]
    fn shutdown_interrupts_live_jobs_on_both_engines() {
        let harness = start_with_script("exec sleep 30");
        harness.rpc.reply_to_add(Ok(JobId::new("gid1")));

        let report = harness.orchestrator.submit(
            "mixed",
            vec![direct("https://example.com/a.flac"), media()],
        );
        assert_eq!(report.accepted.len(), 2);
        harness.wait_for(&JobId::new("gid1"), |e| e.status() == JobStatus::Active);

        let started = Instant::now();
        harness.orchestrator.shutdown();
        assert!(started.elapsed() < Duration::from_secs(10));

        for entry in harness.orchestrator.snapshot() {
            assert_eq!(entry.status(), JobStatus::Error, "{}", entry.id);
            assert_eq!(entry.error_message, INTERRUPTED_MESSAGE);
        }
        assert!(harness.rpc.calls().contains(&"remove gid1".to_string()));
        assert_eq!(harness.daemon.stops.load(Ordering::SeqCst), 1);

        let history = harness.history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.error_message == INTERRUPTED_MESSAGE));

        harness.orchestrator.shutdown();
        assert_eq!(harness.daemon.stops.load(Ordering::SeqCst), 1);
    }
}

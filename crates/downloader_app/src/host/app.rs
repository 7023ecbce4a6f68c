use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use downloader_core::{
    AudioPreset, DirectUrlSource, DownloadDescriptor, Engine, JobEntry, JobId, JobStatus,
    SourceRegistry,
};
use downloader_engine::{
    ChannelEventSink, EngineEvent, HistoryStore, MediaLookupSource, Orchestrator,
};
use engine_logging::{engine_error, engine_info, engine_warn};

use super::playlist::Playlist;
use super::settings::AppSettings;
use crate::Cli;

const DRAIN_INTERVAL: Duration = Duration::from_millis(200);

pub fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = AppSettings::load(cli.config.as_deref());
    if cli.history {
        print_history(&settings);
        return Ok(());
    }

    let preset_key = cli.preset.as_deref().unwrap_or(&settings.preset);
    let preset = AudioPreset::find(preset_key).with_context(|| {
        let keys: Vec<&str> = AudioPreset::all().iter().map(|p| p.key).collect();
        format!("unknown preset {preset_key:?}, expected one of {}", keys.join(", "))
    })?;

    let mut registry = SourceRegistry::with_builtin(*preset);
    registry.register(Box::new(DirectUrlSource::with_headers(
        settings.request_headers.clone(),
    )));
    registry.register(Box::new(MediaLookupSource::new(
        *preset,
        &settings.engine.subprocess,
    )));
    let source_id = cli.source.clone().unwrap_or_else(|| settings.source.clone());
    if registry.get(&source_id).is_none() {
        bail!(
            "unknown source {source_id:?}, expected one of {}",
            registry.ids().join(", ")
        );
    }

    let descriptors = resolve_inputs(&registry, &source_id, &cli.inputs);
    if descriptors.is_empty() {
        bail!("nothing to download");
    }

    let (sink, events) = ChannelEventSink::channel();
    let orchestrator = Orchestrator::new(settings.engine.clone(), Arc::new(sink))
        .context("could not start the download engine")?;

    if descriptors.iter().any(|d| d.engine == Engine::Rpc) {
        if let Err(err) = orchestrator.start_daemon() {
            engine_error!("Download daemon unavailable: {err}");
            eprintln!("Download daemon unavailable: {err}");
            eprintln!(
                "Place the daemon at {} or set engine.daemon.archive_url in the settings file.",
                settings.engine.daemon.executable.display()
            );
        }
    }

    let report = orchestrator.submit(&source_id, descriptors);
    for failure in &report.failures {
        eprintln!("Not started: {failure}");
    }
    if report.accepted.is_empty() {
        orchestrator.shutdown();
        bail!("no downloads were started");
    }

    let playlist = settings
        .auto_playlist
        .then(|| Playlist::new(&settings.engine.output_dir, &settings.playlist_name));
    let mut session = Session::new(report.accepted, playlist);
    session.drain(&events);

    orchestrator.shutdown();
    while let Ok(event) = events.try_recv() {
        session.handle(event);
    }
    session.print_summary();
    Ok(())
}

fn resolve_inputs(
    registry: &SourceRegistry,
    source_id: &str,
    inputs: &[String],
) -> Vec<DownloadDescriptor> {
    let mut descriptors = Vec::new();
    for input in inputs {
        match registry.resolve(source_id, input) {
            Ok(items) => {
                engine_info!("{input} resolved to {} item(s)", items.len());
                descriptors.extend(items);
            }
            Err(err) => {
                engine_warn!("Could not resolve {input}: {err}");
                eprintln!("Skipping {input}: {err}");
            }
        }
    }
    descriptors
}

fn print_history(settings: &AppSettings) {
    let entries = HistoryStore::new(settings.engine.history_path()).load();
    if entries.is_empty() {
        println!("No downloads recorded.");
        return;
    }
    for entry in entries {
        let when = chrono::DateTime::from_timestamp(entry.created_at, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let detail = if entry.status() == JobStatus::Complete {
            entry.output_path.as_str()
        } else {
            entry.error_message.as_str()
        };
        println!("{when:<16}  {:<8}  {}  {detail}", entry.status(), entry.title);
    }
}

/// Main-thread view of the jobs started by this invocation.
struct Session {
    pending: HashSet<JobId>,
    last_line: HashMap<JobId, String>,
    playlist: Option<Playlist>,
    completed: usize,
    failed: usize,
}

impl Session {
    fn new(accepted: Vec<JobId>, playlist: Option<Playlist>) -> Self {
        Self {
            pending: accepted.into_iter().collect(),
            last_line: HashMap::new(),
            playlist,
            completed: 0,
            failed: 0,
        }
    }

    /// Handles engine events until every job of this session has finished.
    fn drain(&mut self, events: &Receiver<EngineEvent>) {
        while !self.pending.is_empty() {
            match events.recv_timeout(DRAIN_INTERVAL) {
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::EntryUpdated(entry) => self.show(&entry),
            EngineEvent::DownloadFinished { id, output_path } => {
                println!("Finished {id}: {output_path}");
                let Some(playlist) = &self.playlist else {
                    return;
                };
                match playlist.add_completed(&output_path) {
                    Ok(true) => engine_info!("Added {output_path} to {:?}", playlist.path()),
                    Ok(false) => {}
                    Err(err) => engine_warn!("Could not update playlist {:?}: {err}", playlist.path()),
                }
            }
            EngineEvent::EntryRemoved(id) => {
                self.pending.remove(&id);
            }
        }
    }

    fn show(&mut self, entry: &JobEntry) {
        if !self.pending.contains(&entry.id) {
            return;
        }
        let line = format!(
            "{:<8} {:>5.1}% {:>11}  {}",
            entry.status(),
            entry.progress(),
            format_rate(entry.speed),
            entry.title
        );
        if self.last_line.get(&entry.id) != Some(&line) {
            println!("[{}] {line}", entry.id);
            self.last_line.insert(entry.id.clone(), line);
        }

        match entry.status() {
            JobStatus::Complete => self.completed += 1,
            JobStatus::Error => {
                self.failed += 1;
                eprintln!("[{}] {}", entry.id, entry.error_message);
            }
            _ => return,
        }
        self.pending.remove(&entry.id);
    }

    fn print_summary(&self) {
        println!("{} finished, {} failed", self.completed, self.failed);
        if self.completed > 0 {
            if let Some(playlist) = &self.playlist {
                println!("Playlist: {}", playlist.path().display());
            }
        }
    }
}

fn format_rate(bytes_per_sec: u64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KiB/s", "MiB/s", "GiB/s"];
    let mut value = bytes_per_sec as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes_per_sec} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

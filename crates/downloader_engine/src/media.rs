//! Media lookups through the extractor: page info and searches, each run with
//! a bounded wait and killed once it expires.

use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::{Duration, Instant};

use downloader_core::{
    AudioPreset, DownloadDescriptor, ExitOutcome, MediaSource, MediaTarget, ResolveError,
    SourceResolver, TranscriptScanner,
};
use engine_logging::{engine_debug, engine_info, engine_warn};
use serde::Deserialize;
use thiserror::Error;

use crate::config::SubprocessConfig;
use crate::runner::spawn_merged;

const QUERY_TICK: Duration = Duration::from_millis(50);
const QUERY_DRAIN_LIMIT: Duration = Duration::from_millis(500);
const WATCH_URL: &str = "https://www.youtube.com/watch?v=";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("query did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("could not query process: {0}")]
    Wait(#[source] io::Error),
}

/// Everything a finished query printed, plus how it exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutput {
    pub exit_code: Option<i32>,
    pub transcript: String,
}

impl QueryOutput {
    /// The failure reason when the query exited unsuccessfully.
    pub fn failure(&self) -> Option<String> {
        match TranscriptScanner::scan(&self.transcript).classify_exit(self.exit_code) {
            ExitOutcome::Failed { message } => Some(message),
            ExitOutcome::Completed { .. } => None,
        }
    }
}

/// Runs `command` to completion and returns its merged output.
///
/// A command still running after `limit` is killed.
pub fn run_bounded(command: Command, limit: Duration) -> Result<QueryOutput, QueryError> {
    let program = command.get_program().to_string_lossy().into_owned();
    let (mut child, output) = spawn_merged(command).map_err(|source| QueryError::Spawn {
        program: program.clone(),
        source,
    })?;

    let deadline = Instant::now() + limit;
    let mut transcript = String::new();
    let mut open = true;
    loop {
        if Instant::now() >= deadline {
            engine_warn!("{program} (pid {}) timed out after {limit:?}", child.id());
            let _ = child.kill();
            let _ = child.wait();
            return Err(QueryError::TimedOut(limit));
        }

        if open {
            match output.recv_timeout(QUERY_TICK) {
                Ok(chunk) => transcript.push_str(&chunk),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => open = false,
            }
        } else {
            thread::sleep(QUERY_TICK);
        }

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                let drain_until = Instant::now() + QUERY_DRAIN_LIMIT;
                while let Ok(chunk) =
                    output.recv_timeout(drain_until.saturating_duration_since(Instant::now()))
                {
                    transcript.push_str(&chunk);
                }
                return Ok(QueryOutput {
                    exit_code: status.code(),
                    transcript,
                });
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(QueryError::Wait(err));
            }
        }
    }
}

/// One item listed by an info or search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHit {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct HitRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    webpage_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

impl HitRecord {
    fn into_hit(self) -> Option<MediaHit> {
        let id = non_empty(self.id)?;
        let title = non_empty(self.title).unwrap_or_else(|| id.clone());
        let artist = non_empty(self.channel)
            .or_else(|| non_empty(self.uploader))
            .unwrap_or_default();
        let url = non_empty(self.webpage_url)
            .or(self.url)
            .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
            .unwrap_or_else(|| format!("{WATCH_URL}{id}"));
        Some(MediaHit {
            id,
            title,
            artist,
            url,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Reads the one-JSON-object-per-line output of a `-j` query. Other lines are ignored.
pub fn parse_hits(transcript: &str) -> Vec<MediaHit> {
    transcript
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| match serde_json::from_str::<HitRecord>(line) {
            Ok(record) => record.into_hit(),
            Err(err) => {
                engine_debug!("skipping unreadable media record: {err}");
                None
            }
        })
        .collect()
}

/// The `media` source, resolving pages and searches to the items they list.
pub struct MediaLookupSource {
    media: MediaSource,
    executable: PathBuf,
    timeout: Duration,
    search_results: u32,
}

impl MediaLookupSource {
    pub fn new(preset: AudioPreset, config: &SubprocessConfig) -> Self {
        Self {
            media: MediaSource::new(preset),
            executable: config.executable.clone(),
            timeout: config.query_timeout(),
            search_results: config.search_results.max(1),
        }
    }

    pub fn query_args(&self, target: &MediaTarget) -> Vec<String> {
        let mut args = match target {
            MediaTarget::Page(url) => vec![url.clone()],
            MediaTarget::Search(query) => vec![format!("ytsearch{}:{query}", self.search_results)],
        };
        args.extend(
            ["--flat-playlist", "-j", "--no-download", "--no-warnings"]
                .into_iter()
                .map(String::from),
        );
        args
    }
}

impl SourceResolver for MediaLookupSource {
    fn id(&self) -> &str {
        MediaSource::ID
    }

    fn resolve(&self, input: &str) -> Result<Vec<DownloadDescriptor>, ResolveError> {
        let target = MediaTarget::classify(input)?;
        let mut command = Command::new(&self.executable);
        command.args(self.query_args(&target));

        let output =
            run_bounded(command, self.timeout).map_err(|err| ResolveError::Lookup(err.to_string()))?;
        let hits = parse_hits(&output.transcript);
        if hits.is_empty() {
            return Err(match output.failure() {
                Some(message) => ResolveError::Lookup(message),
                None => ResolveError::NoResults(input.trim().to_string()),
            });
        }

        engine_info!("{} media item(s) for {:?}", hits.len(), input.trim());
        Ok(hits
            .iter()
            .map(|hit| self.media.item(&hit.url, &hit.title, &hit.artist))
            .collect())
    }
}

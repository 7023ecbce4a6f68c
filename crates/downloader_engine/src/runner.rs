use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use downloader_core::{DownloadDescriptor, ExitOutcome, JobId, TranscriptScanner};
use engine_logging::{engine_debug, engine_warn};
use thiserror::Error;

use crate::config::{EngineConfig, SubprocessConfig};
use crate::persist::{ensure_output_dir, PersistError};

const EXIT_DRAIN_LIMIT: Duration = Duration::from_millis(500);
const THUMBNAIL_CONTAINERS: [&str; 12] = [
    "mp3", "mka", "mkv", "ogg", "opus", "flac", "vorbis", "m4a", "mp4", "m4v", "mov", "alac",
];

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    OutputDir(#[from] PersistError),
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Starts one extraction process per job.
pub struct JobRunner {
    config: SubprocessConfig,
    retry_count: u32,
    output_dir: PathBuf,
    next_id: AtomicU64,
}

impl JobRunner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            config: config.subprocess.clone(),
            retry_count: config.retry_count,
            output_dir: config.output_dir.clone(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Spawns the process for `descriptor` and returns without waiting for it.
    pub fn start(
        &self,
        descriptor: &DownloadDescriptor,
    ) -> Result<(JobId, SubprocessHandle), RunnerError> {
        ensure_output_dir(&self.output_dir)?;
        let args = build_args(&self.config, self.retry_count, &self.output_dir, descriptor);

        let mut command = Command::new(&self.config.executable);
        command.args(&args);
        let (child, output) = spawn_merged(command).map_err(|source| RunnerError::Spawn {
            program: self.config.executable.display().to_string(),
            source,
        })?;

        let id = JobId::subprocess(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        engine_debug!("{id}: started pid {} for {}", child.id(), descriptor.url);
        Ok((id, SubprocessHandle::new(child, output)))
    }
}

/// Spawns `command` with stdout and stderr writing into one pipe, so lines
/// arrive in the order the process printed them.
pub(crate) fn spawn_merged(mut command: Command) -> io::Result<(Child, mpsc::Receiver<String>)> {
    let (reader, writer) = io::pipe()?;
    command
        .stdin(Stdio::null())
        .stdout(writer.try_clone()?)
        .stderr(writer);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    let child = command.spawn()?;
    // The parent's copies of the write end must close for the reader to see EOF.
    drop(command);

    let (tx, output) = mpsc::channel();
    spawn_reader(reader, tx);
    Ok((child, output))
}

/// A running extraction process and what has been read from its output so far.
///
/// Dropping the handle kills a process that is still running.
pub struct SubprocessHandle {
    child: Child,
    output: mpsc::Receiver<String>,
    scanner: TranscriptScanner,
    finished: bool,
}

impl SubprocessHandle {
    fn new(child: Child, output: mpsc::Receiver<String>) -> Self {
        Self {
            child,
            output,
            scanner: TranscriptScanner::new(),
            finished: false,
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn scanner(&self) -> &TranscriptScanner {
        &self.scanner
    }

    /// Feeds buffered output to the scanner and checks for exit without blocking.
    ///
    /// Returns the outcome once the process has exited.
    pub fn poll(&mut self) -> Option<ExitOutcome> {
        if self.finished {
            return None;
        }
        while let Ok(chunk) = self.output.try_recv() {
            self.scanner.feed(&chunk);
        }

        match self.child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => {
                self.finished = true;
                self.drain_after_exit();
                Some(self.scanner.classify_exit(status.code()))
            }
            Err(err) => {
                engine_warn!("could not query pid {}: {err}", self.child.id());
                self.kill();
                Some(ExitOutcome::Failed {
                    message: format!("could not query process: {err}"),
                })
            }
        }
    }

    /// Force-terminates the process. No-op once it has exited.
    pub fn kill(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(err) = self.child.kill() {
            engine_debug!("kill pid {}: {err}", self.child.id());
        }
        let _ = self.child.wait();
    }

    fn drain_after_exit(&mut self) {
        let deadline = Instant::now() + EXIT_DRAIN_LIMIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.output.recv_timeout(remaining) {
                Ok(chunk) => self.scanner.feed(&chunk),
                Err(_) => break,
            }
        }
        self.scanner.finish();
    }
}

impl Drop for SubprocessHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

fn spawn_reader<R: Read + Send + 'static>(stream: R, tx: mpsc::Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Splits user-supplied flags like a shell; unbalanced quotes fall back to whitespace.
pub fn split_flags(flags: &str) -> Vec<String> {
    shlex::split(flags)
        .unwrap_or_else(|| flags.split_whitespace().map(str::to_string).collect())
}

fn embeds_thumbnail(format: &str) -> bool {
    THUMBNAIL_CONTAINERS
        .iter()
        .any(|container| container.eq_ignore_ascii_case(format))
}

/// Command line for one extraction job.
pub fn build_args(
    config: &SubprocessConfig,
    retry_count: u32,
    output_dir: &Path,
    descriptor: &DownloadDescriptor,
) -> Vec<String> {
    let format = if descriptor.audio_format.is_empty() {
        config.default_format.as_str()
    } else {
        descriptor.audio_format.as_str()
    };
    let quality = if descriptor.audio_quality.is_empty() {
        config.default_quality.as_str()
    } else {
        descriptor.audio_quality.as_str()
    };

    let mut args: Vec<String> = vec![
        "-x".into(),
        "--audio-format".into(),
        format.into(),
        "--audio-quality".into(),
        quality.into(),
    ];

    if config.embed_metadata && !format.eq_ignore_ascii_case("wav") {
        args.push("--embed-metadata".into());
        if embeds_thumbnail(format) {
            args.push("--embed-thumbnail".into());
        }
    }

    args.extend(split_flags(&config.extra_flags));

    if retry_count > 0 {
        let n = retry_count.to_string();
        for flag in ["--retries", "--file-access-retries", "--fragment-retries"] {
            args.push(flag.into());
            args.push(n.clone());
        }
    }

    args.extend(
        ["--newline", "--no-warnings", "--no-playlist", "-o"]
            .into_iter()
            .map(String::from),
    );
    args.push(output_dir.join("%(title)s.%(ext)s").display().to_string());
    args.push(descriptor.url.clone());
    args
}

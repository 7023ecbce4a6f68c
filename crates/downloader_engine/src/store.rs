use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use downloader_core::{Engine, JobEntry, JobId, JobStatus};
use engine_logging::{engine_error, engine_info, engine_warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persist::{AtomicFileWriter, PersistError};

/// Flat-text history written by earlier releases, migrated once on load.
pub const LEGACY_HISTORY_FILE: &str = "download_history.txt";
const FORMAT_VERSION: u32 = 1;
const LEGACY_MIN_FIELDS: usize = 6;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not encode history: {0}")]
    Encode(#[from] ron::Error),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// One finished job as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub title: String,
    pub status: String,
    pub output_path: String,
    pub source_id: String,
    pub url: String,
    pub engine: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub created_at: i64,
}

impl PersistedRecord {
    fn from_entry(entry: &JobEntry) -> Self {
        Self {
            title: entry.title.clone(),
            status: entry.status().as_str().to_string(),
            output_path: entry.output_path.clone(),
            source_id: entry.source_id.clone(),
            url: entry.url.clone(),
            engine: entry.engine().as_str().to_string(),
            error_message: entry.error_message.clone(),
            created_at: entry.created_at,
        }
    }

    /// Whether the record names a finished job on a known engine.
    fn is_restorable(&self) -> bool {
        JobStatus::parse(&self.status).is_some_and(|status| status.is_terminal())
            && Engine::parse(&self.engine).is_some()
    }

    fn into_entry(self, id: JobId) -> Option<JobEntry> {
        let status = JobStatus::parse(&self.status)?;
        let engine = Engine::parse(&self.engine)?;
        JobEntry::restored(
            id,
            engine,
            status,
            self.source_id,
            self.url,
            self.title,
            self.output_path,
            self.error_message,
            self.created_at,
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryFile {
    version: u32,
    records: Vec<PersistedRecord>,
}

/// Durable record of finished jobs.
pub struct HistoryStore {
    path: PathBuf,
    legacy_path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let legacy_path = path.with_file_name(LEGACY_HISTORY_FILE);
        Self { path, legacy_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the stored set with the terminal entries of `entries`.
    ///
    /// Returns how many records were written.
    pub fn save(&self, entries: &[JobEntry]) -> Result<usize, StoreError> {
        let records: Vec<PersistedRecord> = entries
            .iter()
            .filter(|e| e.is_terminal())
            .map(PersistedRecord::from_entry)
            .collect();
        self.write_records(records)
    }

    /// Restores finished jobs. Never fails: unreadable history is logged and skipped.
    ///
    /// A legacy flat-text history next to the store is merged in, saved, then deleted.
    pub fn load(&self) -> Vec<JobEntry> {
        let mut records = self.read_records();

        if self.legacy_path.exists() {
            records.extend(self.migrate_legacy());
        }

        let entries: Vec<JobEntry> = records
            .into_iter()
            .filter_map(|record| {
                let title = record.title.clone();
                let entry = record.into_entry(JobId::new(""));
                if entry.is_none() {
                    engine_warn!("Dropping unrestorable history record {title:?}");
                }
                entry
            })
            .enumerate()
            .map(|(n, mut entry)| {
                entry.id = JobId::history(n as u64 + 1);
                entry
            })
            .collect();

        if !entries.is_empty() {
            engine_info!("Restored {} history entries from {:?}", entries.len(), self.path);
        }
        entries
    }

    fn read_records(&self) -> Vec<PersistedRecord> {
        let content = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                engine_warn!("Failed to read history from {:?}: {}", self.path, err);
                return Vec::new();
            }
        };

        match ron::from_str::<HistoryFile>(&content) {
            Ok(file) => {
                if file.version > FORMAT_VERSION {
                    engine_warn!(
                        "History {:?} has newer format version {}",
                        self.path,
                        file.version
                    );
                }
                file.records
            }
            Err(err) => {
                engine_warn!("Failed to parse history from {:?}: {}", self.path, err);
                Vec::new()
            }
        }
    }

    fn write_records(&self, records: Vec<PersistedRecord>) -> Result<usize, StoreError> {
        let count = records.len();
        let file = HistoryFile {
            version: FORMAT_VERSION,
            records,
        };
        let content = ron::ser::to_string_pretty(&file, ron::ser::PrettyConfig::new())?;
        let (writer, filename) = AtomicFileWriter::for_target(&self.path)?;
        writer.write(&filename, content)?;
        Ok(count)
    }

    fn migrate_legacy(&self) -> Vec<PersistedRecord> {
        let content = match fs::read_to_string(&self.legacy_path) {
            Ok(text) => text,
            Err(err) => {
                engine_warn!("Failed to read legacy history {:?}: {}", self.legacy_path, err);
                return Vec::new();
            }
        };
        let (legacy, skipped): (Vec<_>, Vec<_>) = parse_legacy(&content)
            .into_iter()
            .partition(PersistedRecord::is_restorable);
        if !skipped.is_empty() {
            engine_warn!("Skipping {} unfinished legacy history rows", skipped.len());
        }

        let mut merged = self.read_records();
        merged.retain(PersistedRecord::is_restorable);
        merged.extend(legacy.iter().cloned());
        match self.write_records(merged) {
            Ok(_) => {
                if let Err(err) = fs::remove_file(&self.legacy_path) {
                    engine_warn!("Failed to delete legacy history {:?}: {}", self.legacy_path, err);
                }
                engine_info!(
                    "Migrated {} legacy history rows from {:?}",
                    legacy.len(),
                    self.legacy_path
                );
            }
            Err(err) => {
                engine_error!("Failed to save migrated history: {err}");
            }
        }
        legacy
    }
}

/// Parses the legacy tab-separated history.
///
/// Columns: title, status, output path, source id, url, engine, and an optional
/// error message. Rows with fewer than six columns are skipped.
pub fn parse_legacy(content: &str) -> Vec<PersistedRecord> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<String> = line.split('\t').map(unescape_legacy).collect();
            if fields.len() < LEGACY_MIN_FIELDS {
                engine_warn!("Skipping malformed legacy history row");
                return None;
            }
            let mut fields = fields.into_iter();
            let mut next = || fields.next().unwrap_or_default();
            Some(PersistedRecord {
                title: next(),
                status: next(),
                output_path: next(),
                source_id: next(),
                url: next(),
                engine: next(),
                error_message: next(),
                created_at: 0,
            })
        })
        .collect()
}

fn unescape_legacy(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

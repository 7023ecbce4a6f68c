use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const HEADER: &str = "#EXTM3U";

/// An extended M3U playlist that finished downloads are appended to.
pub struct Playlist {
    path: PathBuf,
}

impl Playlist {
    /// Playlist `{name}.m3u8` inside `dir`.
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(format!("{name}.m3u8")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `track` unless it is already listed. Returns whether it was added.
    pub fn add_completed(&self, track: &str) -> io::Result<bool> {
        let existing = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err),
        };
        if existing.lines().any(|line| line.trim() == track) {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if existing.is_empty() {
            writeln!(file, "{HEADER}")?;
        } else if !existing.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "{track}")?;
        Ok(true)
    }
}

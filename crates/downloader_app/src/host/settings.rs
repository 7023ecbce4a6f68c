use std::fs;
use std::io;
use std::path::Path;

use downloader_core::{AudioPreset, DirectUrlSource};
use downloader_engine::EngineConfig;
use engine_logging::{engine_info, engine_warn};
use serde::{Deserialize, Serialize};

/// User preferences, read from a RON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub engine: EngineConfig,
    /// Source used when none is given on the command line.
    pub source: String,
    /// Audio preset key for media sources.
    pub preset: String,
    pub playlist_name: String,
    pub auto_playlist: bool,
    /// Headers sent with every direct download, e.g. `Referer: https://...`.
    pub request_headers: Vec<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            source: DirectUrlSource::ID.to_string(),
            preset: AudioPreset::default_preset().key.to_string(),
            playlist_name: "Downloaded".to_string(),
            auto_playlist: true,
            request_headers: Vec::new(),
        }
    }
}

impl AppSettings {
    /// Reads settings from `path`; defaults when absent or unreadable.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        let content = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                engine_warn!("Settings file {:?} not found, using defaults", path);
                return Self::default();
            }
            Err(err) => {
                engine_warn!("Failed to read settings from {:?}: {}", path, err);
                return Self::default();
            }
        };
        match ron::from_str(&content) {
            Ok(settings) => {
                engine_info!("Loaded settings from {:?}", path);
                settings
            }
            Err(err) => {
                engine_warn!("Failed to parse settings from {:?}: {}", path, err);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AppSettings;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.ron");
        std::fs::write(
            &path,
            r#"(
    preset: "mp3-320",
    auto_playlist: false,
    request_headers: ["Referer: https://example.com/"],
    engine: (retry_count: 5, daemon: (port: 6900)),
)"#,
        )
        .unwrap();

        let settings = AppSettings::load(Some(&path));
        assert_eq!(settings.preset, "mp3-320");
        assert!(!settings.auto_playlist);
        assert_eq!(settings.request_headers, vec!["Referer: https://example.com/".to_string()]);
        assert_eq!(settings.playlist_name, "Downloaded");
        assert_eq!(settings.engine.retry_count, 5);
        assert_eq!(settings.engine.daemon.port, 6900);
        assert_eq!(settings.engine.daemon.max_concurrent, 3);
        assert_eq!(settings.engine.poll_interval_ms, 500);
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.ron");
        std::fs::write(&path, "(preset: ").unwrap();
        assert_eq!(AppSettings::load(Some(&path)), AppSettings::default());
        assert_eq!(
            AppSettings::load(Some(&temp.path().join("missing.ron"))),
            AppSettings::default()
        );
    }
}

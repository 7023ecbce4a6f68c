use crate::entry::Engine;

/// One downloadable item produced by a source resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadDescriptor {
    pub url: String,
    /// Suggested output file name. Only honoured when it carries an extension.
    pub filename: String,
    pub title: String,
    pub artist: String,
    pub engine: Engine,
    /// Target audio container for the subprocess engine; empty means the default.
    pub audio_format: String,
    /// Encoder quality for the subprocess engine; empty means the default.
    pub audio_quality: String,
    /// Extra request headers such as `Referer: https://...`.
    pub headers: Vec<String>,
}

impl DownloadDescriptor {
    pub fn new(url: impl Into<String>, engine: Engine) -> Self {
        Self {
            url: url.into(),
            filename: String::new(),
            title: String::new(),
            artist: String::new(),
            engine,
            audio_format: String::new(),
            audio_quality: String::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = artist.into();
        self
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.headers.push(header.into());
        self
    }

    pub fn with_audio(mut self, format: impl Into<String>, quality: impl Into<String>) -> Self {
        self.audio_format = format.into();
        self.audio_quality = quality.into();
        self
    }

    /// The filename to pass to the daemon, if the suggestion looks like a file.
    pub fn output_name(&self) -> Option<&str> {
        let name = self.filename.trim();
        (!name.is_empty() && name.contains('.')).then_some(name)
    }

    /// Title shown before the engine reports a file name.
    pub fn display_title(&self) -> &str {
        if !self.title.is_empty() {
            &self.title
        } else if !self.filename.is_empty() {
            &self.filename
        } else {
            &self.url
        }
    }
}

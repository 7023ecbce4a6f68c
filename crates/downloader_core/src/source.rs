use url::Url;

use crate::descriptor::DownloadDescriptor;
use crate::entry::Engine;
use crate::preset::AudioPreset;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("nothing to resolve")]
    EmptyInput,
    #[error("invalid url {input}: {reason}")]
    InvalidUrl { input: String, reason: String },
    #[error("unknown source {0}")]
    UnknownSource(String),
    #[error("lookup failed: {0}")]
    Lookup(String),
    #[error("no results for {0}")]
    NoResults(String),
}

/// Turns user input into downloadable items.
pub trait SourceResolver: Send + Sync {
    /// Stable identifier recorded on every job created from this source.
    fn id(&self) -> &str;

    fn resolve(&self, input: &str) -> Result<Vec<DownloadDescriptor>, ResolveError>;
}

#[derive(Default)]
pub struct SourceRegistry {
    sources: Vec<Box<dyn SourceResolver>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in sources; the media source uses `preset`.
    pub fn with_builtin(preset: AudioPreset) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(DirectUrlSource::default()));
        registry.register(Box::new(MediaSource::new(preset)));
        registry
    }

    /// Adds `source`, replacing any earlier source with the same id.
    pub fn register(&mut self, source: Box<dyn SourceResolver>) {
        self.sources.retain(|s| s.id() != source.id());
        self.sources.push(source);
    }

    pub fn get(&self, id: &str) -> Option<&dyn SourceResolver> {
        self.sources
            .iter()
            .find(|s| s.id() == id)
            .map(|s| s.as_ref())
    }

    pub fn ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.id()).collect()
    }

    pub fn resolve(&self, id: &str, input: &str) -> Result<Vec<DownloadDescriptor>, ResolveError> {
        self.get(id)
            .ok_or_else(|| ResolveError::UnknownSource(id.to_string()))?
            .resolve(input)
    }
}

/// A plain file URL, handed to the download daemon.
#[derive(Debug, Clone, Default)]
pub struct DirectUrlSource {
    headers: Vec<String>,
}

impl DirectUrlSource {
    pub const ID: &'static str = "direct_url";

    /// Source that sends `headers` (e.g. `Referer: ...`) with every download.
    pub fn with_headers(headers: Vec<String>) -> Self {
        Self { headers }
    }
}

impl SourceResolver for DirectUrlSource {
    fn id(&self) -> &str {
        Self::ID
    }

    fn resolve(&self, input: &str) -> Result<Vec<DownloadDescriptor>, ResolveError> {
        let url = parse_with_default_scheme(input)?;
        let filename = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .unwrap_or_default()
            .to_string();

        let descriptor = self.headers.iter().fold(
            DownloadDescriptor::new(url.as_str(), Engine::Rpc)
                .with_title(filename.clone())
                .with_filename(filename),
            |descriptor, header| descriptor.with_header(header.as_str()),
        );
        Ok(vec![descriptor])
    }
}

/// What a media input asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaTarget {
    /// A page address, normalized to a full URL.
    Page(String),
    /// Free text to search for.
    Search(String),
}

impl MediaTarget {
    pub fn classify(input: &str) -> Result<Self, ResolveError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ResolveError::EmptyInput);
        }
        if looks_like_address(trimmed) {
            Ok(Self::Page(parse_with_default_scheme(trimmed)?.to_string()))
        } else {
            Ok(Self::Search(trimmed.to_string()))
        }
    }
}

/// A media page or search query, handed to the subprocess engine for audio extraction.
///
/// Resolves without looking anything up: a search becomes a first-hit query
/// that the extractor runs itself.
#[derive(Debug, Clone, Copy)]
pub struct MediaSource {
    preset: AudioPreset,
}

impl MediaSource {
    pub const ID: &'static str = "media";

    pub fn new(preset: AudioPreset) -> Self {
        Self { preset }
    }

    /// Descriptor for one looked-up item; the title is prefixed with `artist` when known.
    pub fn item(&self, url: &str, title: &str, artist: &str) -> DownloadDescriptor {
        let title = if artist.is_empty() {
            title.to_string()
        } else {
            format!("{artist} - {title}")
        };
        DownloadDescriptor::new(url, Engine::Subprocess)
            .with_title(title)
            .with_artist(artist)
            .with_audio(self.preset.format, self.preset.quality)
    }
}

impl SourceResolver for MediaSource {
    fn id(&self) -> &str {
        Self::ID
    }

    fn resolve(&self, input: &str) -> Result<Vec<DownloadDescriptor>, ResolveError> {
        let target = match MediaTarget::classify(input)? {
            MediaTarget::Page(url) => url,
            MediaTarget::Search(query) => format!("ytsearch1:{query}"),
        };
        Ok(vec![self.item(&target, input.trim(), "")])
    }
}

fn looks_like_address(input: &str) -> bool {
    input.contains("://") || (!input.contains(char::is_whitespace) && input.contains('.'))
}

fn parse_with_default_scheme(input: &str) -> Result<Url, ResolveError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ResolveError::EmptyInput);
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let url = Url::parse(&candidate).map_err(|err| ResolveError::InvalidUrl {
        input: trimmed.to_string(),
        reason: err.to_string(),
    })?;
    if url.host_str().is_none() {
        return Err(ResolveError::InvalidUrl {
            input: trimmed.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_text_becomes_a_single_result_query() {
        let source = MediaSource::new(*AudioPreset::default_preset());
        let items = source.resolve("  some artist live  ").unwrap();
        assert_eq!(items[0].url, "ytsearch1:some artist live");
        assert_eq!(items[0].title, "some artist live");
    }

    #[test]
    fn bare_host_gets_https() {
        let url = parse_with_default_scheme("example.com/a").unwrap();
        assert_eq!(url.as_str(), "https://example.com/a");
    }
}

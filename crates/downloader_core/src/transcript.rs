//! Scraping of the subprocess engine's human-readable output.
//!
//! The engine has no structured progress protocol, so progress, transfer rate,
//! destination and failure reason are recovered from its line-oriented
//! transcript. Lines may end in `\n` or `\r`; a trailing partial line is kept
//! until more output arrives or [`TranscriptScanner::finish`] is called.

const DOWNLOAD_TAG: &str = "[download]";
const DOWNLOAD_DESTINATION: &str = "[download] Destination:";
const EXTRACT_DESTINATION: &str = "[ExtractAudio] Destination:";
const ERROR_MARKER: &str = "ERROR:";

const RATE_UNITS: [(&str, f64); 4] = [
    ("GiB/s", 1024.0 * 1024.0 * 1024.0),
    ("MiB/s", 1024.0 * 1024.0),
    ("KiB/s", 1024.0),
    ("B/s", 1.0),
];

/// How a finished subprocess job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Completed { output_path: Option<String> },
    Failed { message: String },
}

#[derive(Debug, Clone, Default)]
pub struct TranscriptScanner {
    pending: String,
    progress: Option<f64>,
    speed: Option<u64>,
    download_destination: Option<String>,
    extract_destination: Option<String>,
    last_error: Option<String>,
}

impl TranscriptScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans a complete transcript in one go.
    pub fn scan(transcript: &str) -> Self {
        let mut scanner = Self::new();
        scanner.feed(transcript);
        scanner.finish();
        scanner
    }

    /// Appends newly captured output and scans every line it completes.
    pub fn feed(&mut self, chunk: &str) {
        self.pending.push_str(chunk);
        while let Some(pos) = self.pending.find(['\n', '\r']) {
            let line: String = self.pending.drain(..=pos).collect();
            self.scan_line(&line);
        }
    }

    /// Scans the trailing partial line, if any. Call once the output is closed.
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.scan_line(&line);
        }
    }

    /// Most recent percentage seen on a download line.
    pub fn progress(&self) -> Option<f64> {
        self.progress
    }

    /// Most recent transfer rate, in bytes per second.
    pub fn speed(&self) -> Option<u64> {
        self.speed
    }

    /// Final file path: the audio-extraction destination when one was printed,
    /// since post-processing renames the downloaded file.
    pub fn destination(&self) -> Option<&str> {
        self.extract_destination
            .as_deref()
            .or(self.download_destination.as_deref())
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn classify_exit(&self, exit_code: Option<i32>) -> ExitOutcome {
        match exit_code {
            Some(0) => ExitOutcome::Completed {
                output_path: self.destination().map(str::to_string),
            },
            code => {
                let message = match (self.last_error(), code) {
                    (Some(line), _) => line.to_string(),
                    (None, Some(code)) => format!("process exited with code {code}"),
                    (None, None) => "process was terminated by a signal".to_string(),
                };
                ExitOutcome::Failed { message }
            }
        }
    }

    fn scan_line(&mut self, raw: &str) {
        let line = raw.trim();
        if line.is_empty() {
            return;
        }

        if let Some(path) = line.strip_prefix(EXTRACT_DESTINATION) {
            set_path(&mut self.extract_destination, path);
        } else if let Some(path) = line.strip_prefix(DOWNLOAD_DESTINATION) {
            set_path(&mut self.download_destination, path);
        } else if line.starts_with(DOWNLOAD_TAG) {
            if let Some(percent) = parse_percent(line) {
                self.progress = Some(percent);
            }
            if let Some((_, rate)) = line.split_once(" at ") {
                if let Some(speed) = parse_rate(rate) {
                    self.speed = Some(speed);
                }
            }
        } else if line.starts_with(ERROR_MARKER) {
            self.last_error = Some(line.to_string());
        }
    }
}

fn set_path(slot: &mut Option<String>, raw: &str) {
    let path = raw.trim();
    if !path.is_empty() {
        *slot = Some(path.to_string());
    }
}

/// Number immediately preceding the first `%` of `line`.
pub fn parse_percent(line: &str) -> Option<f64> {
    let end = line.find('%')?;
    let head = &line[..end];
    let figure = &head[head
        .trim_end_matches(|c: char| c.is_ascii_digit() || c == '.')
        .len()..];
    figure.parse().ok()
}

/// Converts a rate such as `1.5MiB/s` to bytes per second.
///
/// A recognised unit with an unreadable figure (`Unknown B/s`) reads as 0.
pub fn parse_rate(text: &str) -> Option<u64> {
    let mut tokens = text.split_whitespace();
    let first = tokens.next()?;

    for (suffix, scale) in RATE_UNITS {
        if let Some(figure) = first.strip_suffix(suffix) {
            let value: f64 = figure.parse().unwrap_or(0.0);
            return Some((value * scale) as u64);
        }
    }

    let unit = tokens.next()?;
    let scale = RATE_UNITS
        .iter()
        .find(|(suffix, _)| *suffix == unit)
        .map(|(_, scale)| *scale)?;
    let value: f64 = first.parse().unwrap_or(0.0);
    Some((value * scale) as u64)
}

#[cfg(test)]
mod tests {
    use super::{parse_percent, parse_rate};

    #[test]
    fn percent_is_read_backwards_from_sign() {
        assert_eq!(parse_percent("[download]  42.5% of 3.00MiB"), Some(42.5));
        assert_eq!(parse_percent("[download] 100% of 3.00MiB"), Some(100.0));
        assert_eq!(parse_percent("[download] Unknown% of ?"), None);
        assert_eq!(parse_percent("no sign here"), None);
    }

    #[test]
    fn rates_convert_to_bytes_per_second() {
        assert_eq!(parse_rate("512B/s ETA 00:10"), Some(512));
        assert_eq!(parse_rate("  2.00KiB/s"), Some(2048));
        assert_eq!(parse_rate("1.50MiB/s ETA 00:02"), Some(1_572_864));
        assert_eq!(parse_rate("1GiB/s"), Some(1_073_741_824));
        assert_eq!(parse_rate("Unknown B/s ETA Unknown"), Some(0));
        assert_eq!(parse_rate("fast"), None);
    }
}

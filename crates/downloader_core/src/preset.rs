/// An audio extraction target for the subprocess engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioPreset {
    pub key: &'static str,
    pub label: &'static str,
    pub format: &'static str,
    pub quality: &'static str,
}

const PRESETS: &[AudioPreset] = &[
    AudioPreset { key: "flac", label: "FLAC (lossless)", format: "flac", quality: "0" },
    AudioPreset { key: "wav", label: "WAV (uncompressed)", format: "wav", quality: "0" },
    AudioPreset { key: "mp3-320", label: "MP3 320 kbps", format: "mp3", quality: "0" },
    AudioPreset { key: "mp3-256", label: "MP3 256 kbps", format: "mp3", quality: "2" },
    AudioPreset { key: "mp3-192", label: "MP3 192 kbps", format: "mp3", quality: "3" },
    AudioPreset { key: "mp3-128", label: "MP3 128 kbps", format: "mp3", quality: "5" },
    AudioPreset { key: "mp3-96", label: "MP3 96 kbps", format: "mp3", quality: "7" },
    AudioPreset { key: "aac-256", label: "AAC 256 kbps", format: "m4a", quality: "0" },
    AudioPreset { key: "aac-128", label: "AAC 128 kbps", format: "m4a", quality: "5" },
    AudioPreset { key: "opus", label: "Opus", format: "opus", quality: "0" },
    AudioPreset { key: "vorbis", label: "Vorbis", format: "vorbis", quality: "0" },
];

impl AudioPreset {
    pub fn all() -> &'static [AudioPreset] {
        PRESETS
    }

    /// Case-insensitive lookup by key.
    pub fn find(key: &str) -> Option<&'static AudioPreset> {
        let key = key.trim();
        PRESETS.iter().find(|p| p.key.eq_ignore_ascii_case(key))
    }

    pub fn default_preset() -> &'static AudioPreset {
        &PRESETS[0]
    }
}

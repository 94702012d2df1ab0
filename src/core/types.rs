use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique identifier for a packaging job (UUIDv7 for time-sortability).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// The two content sources addressable over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceBackend {
    #[default]
    Local,
    Remote,
}

impl SourceBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceBackend::Local => "local",
            SourceBackend::Remote => "remote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(SourceBackend::Local),
            "remote" => Some(SourceBackend::Remote),
            _ => None,
        }
    }
}

impl fmt::Display for SourceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Object classes
// ---------------------------------------------------------------------------

/// Coarse classification of a served object, used for caching headers and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    Playlist,
    Segment,
    Video,
    Other,
}

impl ObjectClass {
    pub fn of(name: &str) -> Self {
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "m3u8" => ObjectClass::Playlist,
            "ts" => ObjectClass::Segment,
            "mp4" | "m4v" | "mov" | "mkv" | "webm" => ObjectClass::Video,
            _ => ObjectClass::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectClass::Playlist => "playlist",
            ObjectClass::Segment => "segment",
            ObjectClass::Video => "video",
            ObjectClass::Other => "other",
        }
    }
}

// ---------------------------------------------------------------------------
// Packaged stream model
// ---------------------------------------------------------------------------

/// One quality level of a packaged stream. Paths are object names relative to
/// the package backend root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRendition {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_bps: u64,
    pub audio_bitrate_bps: u64,
    pub media_playlist_path: String,
    pub segment_directory: String,
}

impl StreamRendition {
    /// Advertised peak bandwidth in bits per second.
    pub fn bandwidth_bps(&self) -> u64 {
        self.video_bitrate_bps + self.audio_bitrate_bps
    }
}

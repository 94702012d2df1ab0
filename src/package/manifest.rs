use crate::core::types::StreamRendition;

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// File name of the master playlist inside a stream directory.
pub const MASTER_PLAYLIST: &str = "master.m3u8";

/// File name of each rendition's media playlist.
pub const MEDIA_PLAYLIST: &str = "playlist.m3u8";

/// ffmpeg segment file pattern inside a rendition directory.
pub const SEGMENT_PATTERN: &str = "segment_%03d.ts";

/// VOD end marker.
pub const ENDLIST_TAG: &str = "#EXT-X-ENDLIST";

const STREAM_INF_TAG: &str = "#EXT-X-STREAM-INF:";

/// `<stream>/master.m3u8`
pub fn master_playlist_path(stream_name: &str) -> String {
    format!("{}/{}", stream_name, MASTER_PLAYLIST)
}

/// `<stream>/<rendition>`
pub fn rendition_prefix(stream_name: &str, rendition: &str) -> String {
    format!("{}/{}", stream_name, rendition)
}

/// `<stream>/<rendition>/playlist.m3u8`
pub fn media_playlist_path(stream_name: &str, rendition: &str) -> String {
    format!("{}/{}/{}", stream_name, rendition, MEDIA_PLAYLIST)
}

/// `<stream>/<rendition>/<segment>`
pub fn segment_path(stream_name: &str, rendition: &str, segment: &str) -> String {
    format!("{}/{}/{}", stream_name, rendition, segment)
}

/// `<stream>/`, the prefix every object of a stream lives under.
pub fn stream_prefix(stream_name: &str) -> String {
    format!("{}/", stream_name)
}

// ---------------------------------------------------------------------------
// Master playlist
// ---------------------------------------------------------------------------

/// Build the master playlist for `renditions`, in the given order.
///
/// ```m3u8
/// #EXTM3U
/// #EXT-X-VERSION:3
/// #EXT-X-STREAM-INF:BANDWIDTH=2628000,RESOLUTION=1280x720
/// 720p/playlist.m3u8
/// ```
///
/// Entry URIs are relative to the master playlist: the rendition's media
/// playlist path with the `<stream>/` prefix removed.
pub fn build_master(renditions: &[StreamRendition], stream_name: &str) -> String {
    let mut playlist = String::with_capacity(64 + renditions.len() * 96);
    playlist.push_str("#EXTM3U\n");
    playlist.push_str("#EXT-X-VERSION:3\n");

    let prefix = stream_prefix(stream_name);
    for rendition in renditions {
        playlist.push_str(&format!(
            "{}BANDWIDTH={},RESOLUTION={}x{}\n",
            STREAM_INF_TAG,
            rendition.bandwidth_bps(),
            rendition.width,
            rendition.height
        ));
        let uri = rendition
            .media_playlist_path
            .strip_prefix(&prefix)
            .unwrap_or(&rendition.media_playlist_path);
        playlist.push_str(uri);
        playlist.push('\n');
    }

    playlist
}

// ---------------------------------------------------------------------------
// Media playlist
// ---------------------------------------------------------------------------

/// Mark a media playlist as a complete VOD playlist. Idempotent: a playlist
/// already carrying `#EXT-X-ENDLIST` is returned unchanged.
pub fn finalize_media(playlist: &str) -> String {
    if playlist.lines().any(|line| line.trim() == ENDLIST_TAG) {
        return playlist.to_string();
    }
    let mut finalized = String::with_capacity(playlist.len() + ENDLIST_TAG.len() + 2);
    finalized.push_str(playlist);
    if !finalized.is_empty() && !finalized.ends_with('\n') {
        finalized.push('\n');
    }
    finalized.push_str(ENDLIST_TAG);
    finalized.push('\n');
    finalized
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// One `#EXT-X-STREAM-INF` entry read back from a master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantEntry {
    /// First path component of the URI, e.g. `720p`.
    pub rendition: String,
    pub uri: String,
    pub bandwidth_bps: u64,
    pub width: u32,
    pub height: u32,
}

/// Read the variant entries of a master playlist, in order. Entries without a
/// BANDWIDTH attribute or a URI line are skipped.
pub fn parse_master(playlist: &str) -> Vec<VariantEntry> {
    let mut entries = Vec::new();
    let mut pending: Option<(u64, u32, u32)> = None;

    for line in playlist.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if let Some(attrs) = line.strip_prefix(STREAM_INF_TAG) {
            pending = parse_stream_inf(attrs);
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        if let Some((bandwidth_bps, width, height)) = pending.take() {
            let rendition = line.split('/').next().unwrap_or(line).to_string();
            entries.push(VariantEntry {
                rendition,
                uri: line.to_string(),
                bandwidth_bps,
                width,
                height,
            });
        }
    }

    entries
}

fn parse_stream_inf(attrs: &str) -> Option<(u64, u32, u32)> {
    let mut bandwidth = None;
    let mut resolution = (0, 0);
    for attr in attrs.split(',') {
        let Some((key, value)) = attr.split_once('=') else {
            continue;
        };
        match key.trim() {
            "BANDWIDTH" => bandwidth = value.trim().parse().ok(),
            "RESOLUTION" => {
                if let Some((w, h)) = value.trim().split_once('x') {
                    resolution = (w.parse().unwrap_or(0), h.parse().unwrap_or(0));
                }
            }
            _ => {}
        }
    }
    bandwidth.map(|b| (b, resolution.0, resolution.1))
}

/// Number of media segments listed in a media playlist.
pub fn count_segments(playlist: &str) -> usize {
    playlist
        .lines()
        .filter(|line| line.trim_start().starts_with("#EXTINF:"))
        .count()
}

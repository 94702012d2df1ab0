use serde::{Deserialize, Serialize};

use crate::core::config::RenditionProfile;
use crate::core::types::StreamRendition;
use crate::package::manifest::{media_playlist_path, rendition_prefix};

// ---------------------------------------------------------------------------
// Rendition encoding parameters
// ---------------------------------------------------------------------------

/// Encoding parameters for one rendition, bitrates in bits per second.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenditionSpec {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_bps: u64,
    pub audio_bitrate_bps: u64,
}

impl RenditionSpec {
    pub fn from_profile(profile: &RenditionProfile) -> Self {
        Self {
            name: profile.name.clone(),
            width: profile.width,
            height: profile.height,
            video_bitrate_bps: u64::from(profile.video_bitrate_kbps) * 1000,
            audio_bitrate_bps: u64::from(profile.audio_bitrate_kbps) * 1000,
        }
    }

    /// The rendition as it will be laid out under `stream_name`.
    pub fn to_rendition(&self, stream_name: &str) -> StreamRendition {
        StreamRendition {
            name: self.name.clone(),
            width: self.width,
            height: self.height,
            video_bitrate_bps: self.video_bitrate_bps,
            audio_bitrate_bps: self.audio_bitrate_bps,
            media_playlist_path: media_playlist_path(stream_name, &self.name),
            segment_directory: rendition_prefix(stream_name, &self.name),
        }
    }

    pub fn bandwidth_bps(&self) -> u64 {
        bandwidth(self.video_bitrate_bps, self.audio_bitrate_bps)
    }
}

/// Convert a configured ladder into encoding parameters, preserving order.
pub fn specs_from_ladder(ladder: &[RenditionProfile]) -> Vec<RenditionSpec> {
    ladder.iter().map(RenditionSpec::from_profile).collect()
}

/// Advertised BANDWIDTH for a rendition: video + audio, no overhead factor.
pub fn bandwidth(video_bitrate_bps: u64, audio_bitrate_bps: u64) -> u64 {
    video_bitrate_bps + audio_bitrate_bps
}

/// Format a bitrate the way ffmpeg rate options expect it (`2500k`, or plain bps
/// when not a whole number of kilobits).
pub fn rate_arg(bps: u64) -> String {
    if bps % 1000 == 0 {
        format!("{}k", bps / 1000)
    } else {
        bps.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::default_ladder;

    #[test]
    fn test_default_ladder_bandwidths() {
        let specs = specs_from_ladder(&default_ladder());
        let bandwidths: Vec<u64> = specs.iter().map(|s| s.bandwidth_bps()).collect();
        assert_eq!(bandwidths, vec![2_628_000, 1_096_000, 664_000]);
    }

    #[test]
    fn test_profile_conversion_keeps_order() {
        let names: Vec<String> = specs_from_ladder(&default_ladder())
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["720p", "480p", "360p"]);
    }

    #[test]
    fn test_rendition_layout() {
        let spec = RenditionSpec::from_profile(&default_ladder()[0]);
        let rendition = spec.to_rendition("intro_1");
        assert_eq!(rendition.media_playlist_path, "intro_1/720p/playlist.m3u8");
        assert_eq!(rendition.segment_directory, "intro_1/720p");
        assert_eq!(rendition.bandwidth_bps(), 2_628_000);
    }

    #[test]
    fn test_rate_arg() {
        assert_eq!(rate_arg(2_500_000), "2500k");
        assert_eq!(rate_arg(128_000), "128k");
        assert_eq!(rate_arg(1_500), "1500");
        assert_eq!(rate_arg(1_234_567), "1234567");
    }
}

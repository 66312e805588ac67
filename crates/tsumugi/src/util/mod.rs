pub mod http;
pub mod path;
pub mod range;
pub mod reorder;

use std::time::Duration;

use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Hls,
    Dash,
}

/// Decide whether a manifest is HLS or DASH.
///
/// Checks the URL extension first, then the `Content-Type`, then sniffs the body.
pub fn detect_manifest_format(
    url: &url::Url,
    content_type: Option<&str>,
    body: &str,
) -> Option<ManifestFormat> {
    // 1. check extension
    let path = url.path().to_lowercase();
    if path.ends_with(".m3u8") || path.ends_with(".m3u") {
        return Some(ManifestFormat::Hls);
    } else if path.ends_with(".mpd") {
        return Some(ManifestFormat::Dash);
    }

    // 2. check content type
    let content_type = content_type.map(|c| c.split(';').next().unwrap_or(c).trim());
    match content_type {
        Some("application/x-mpegurl" | "application/vnd.apple.mpegurl" | "audio/mpegurl") => {
            return Some(ManifestFormat::Hls)
        }
        Some("application/dash+xml") => return Some(ManifestFormat::Dash),
        _ => {}
    }

    // 3. check content
    let body = body.trim_start_matches('\u{feff}').trim_start();
    if body.starts_with("#EXTM3U") {
        Some(ManifestFormat::Hls)
    } else if body.contains("<MPD") {
        Some(ManifestFormat::Dash)
    } else {
        None
    }
}

pub(crate) fn deserialize_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

pub(crate) fn deserialize_secs<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

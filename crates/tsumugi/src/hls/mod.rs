//! HLS playlist parsing.
//!
//! Master playlists are reduced to [`HlsVariant`] candidates so only the
//! selected media playlists are ever downloaded. Media playlists become
//! [`Representation`]s, with their AES key fetched eagerly.

pub mod key;

use std::{collections::HashMap, time::Duration};

use m3u8_rs::{AlternativeMediaType, KeyMethod, MediaPlaylist, Playlist};
use url::Url;

pub use key::fetch_key;
use key::parse_iv;

use crate::{
    error::{TsumugiError, TsumugiResult},
    model::{
        EncryptionContext, EncryptionMethod, InitSegment, Representation, SegmentRef, StreamKind,
    },
    select::{select_audio, select_video, Selectable, Selection, SelectionPolicy},
    util::{http::HttpClient, range::ByteRange},
};

/// Prefix of a PSSH embedded in a `SAMPLE-AES-CTR` key URI.
const PSSH_DATA_PREFIX: &str = "data:text/plain;base64,";

/// A media playlist reference found in a master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct HlsVariant {
    pub id: String,
    pub kind: StreamKind,
    pub url: Url,
    pub bandwidth: u64,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub codec: Option<String>,
    pub language: Option<String>,
    /// `AUDIO` group of a video variant, `GROUP-ID` of an audio rendition.
    pub audio_group: Option<String>,
}

impl HlsVariant {
    /// Describes a media playlist loaded without a master playlist.
    pub fn standalone(url: Url) -> Self {
        Self {
            id: "video".to_string(),
            kind: StreamKind::Video,
            url,
            bandwidth: 0,
            width: None,
            height: None,
            codec: None,
            language: None,
            audio_group: None,
        }
    }
}

impl Selectable for HlsVariant {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn width(&self) -> Option<u64> {
        self.width
    }

    fn height(&self) -> Option<u64> {
        self.height
    }

    fn bandwidth(&self) -> u64 {
        self.bandwidth
    }

    fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MasterPlaylist {
    pub videos: Vec<HlsVariant>,
    pub audios: Vec<HlsVariant>,
}

impl MasterPlaylist {
    /// Audio renditions usable with `video`. When the variant names an audio
    /// group that has renditions, only that group is returned.
    pub fn audio_for(&self, video: &HlsVariant) -> Vec<&HlsVariant> {
        let grouped: Vec<&HlsVariant> = self
            .audios
            .iter()
            .filter(|a| a.audio_group.is_some() && a.audio_group == video.audio_group)
            .collect();

        if grouped.is_empty() {
            self.audios.iter().collect()
        } else {
            grouped
        }
    }
}

/// Result of [`load_playlist`]: the selection plus the media playlist texts
/// it was built from.
#[derive(Debug, Clone)]
pub struct LoadedPlaylist {
    pub selection: Selection,
    pub media_playlists: Vec<(StreamKind, String)>,
}

pub fn parse_master_playlist(text: &str, url: &Url) -> TsumugiResult<MasterPlaylist> {
    let playlist = m3u8_rs::parse_master_playlist_res(text.as_bytes())
        .map_err(|_| TsumugiError::M3u8ParseError(url.to_string()))?;

    let mut videos = Vec::new();
    for (index, variant) in playlist
        .variants
        .iter()
        .filter(|v| !v.is_i_frame)
        .enumerate()
    {
        videos.push(HlsVariant {
            id: format!("video-{index}"),
            kind: StreamKind::Video,
            url: url.join(&variant.uri)?,
            bandwidth: variant.bandwidth,
            width: variant.resolution.as_ref().map(|r| r.width),
            height: variant.resolution.as_ref().map(|r| r.height),
            codec: variant.codecs.clone(),
            language: None,
            audio_group: variant.audio.clone(),
        });
    }

    let mut audios = Vec::new();
    for media in &playlist.alternatives {
        if !matches!(media.media_type, AlternativeMediaType::Audio) {
            continue;
        }
        // renditions without a URI are muxed into the variant stream
        let Some(uri) = &media.uri else {
            continue;
        };

        audios.push(HlsVariant {
            id: format!("audio-{}-{}", media.group_id, media.name),
            kind: StreamKind::Audio,
            url: url.join(uri)?,
            bandwidth: 0,
            width: None,
            height: None,
            codec: None,
            language: media.language.clone(),
            audio_group: Some(media.group_id.clone()),
        });
    }

    tracing::debug!(
        "Master playlist has {} variant(s) and {} audio rendition(s)",
        videos.len(),
        audios.len()
    );
    Ok(MasterPlaylist { videos, audios })
}

/// Parse a media playlist into a [`Representation`] described by `variant`.
///
/// Relative URIs are resolved against `variant.url`. Keys referenced by
/// `EXT-X-KEY` are fetched before this returns; a failed key fetch fails the
/// whole parse.
pub async fn parse_media_playlist(
    client: &HttpClient,
    text: &str,
    variant: &HlsVariant,
) -> TsumugiResult<Representation> {
    let playlist = m3u8_rs::parse_media_playlist_res(text.as_bytes())
        .map_err(|_| TsumugiError::M3u8ParseError(variant.url.to_string()))?;
    build_representation(client, playlist, variant).await
}

async fn build_representation(
    client: &HttpClient,
    playlist: MediaPlaylist,
    variant: &HlsVariant,
) -> TsumugiResult<Representation> {
    let playlist_url = &variant.url;
    let mut keys: HashMap<Url, [u8; 16]> = HashMap::new();
    let mut active = EncryptionContext::None;
    let mut encryption: Option<EncryptionContext> = None;
    let mut init: Option<InitSegment> = None;
    // end of the previous sub-range, per URI
    let mut range_ends: HashMap<Url, u64> = HashMap::new();
    let mut total_duration = 0f64;
    let mut segments = Vec::with_capacity(playlist.segments.len());

    for (index, segment) in playlist.segments.iter().enumerate() {
        if let Some(key) = &segment.key {
            active = resolve_key(client, key, playlist_url, &mut keys).await?;
        }
        match &encryption {
            None => encryption = Some(active.clone()),
            Some(current) if *current != active => {
                return Err(TsumugiError::ManifestError(format!(
                    "key changes at segment {index}, key rotation is not supported"
                )));
            }
            _ => {}
        }

        if let Some(map) = &segment.map {
            let byte_range = match &map.byte_range {
                Some(range) => Some(sub_range(
                    range.offset.unwrap_or_default(),
                    range.length,
                    index,
                )?),
                None => None,
            };
            let map_init = InitSegment {
                url: playlist_url.join(&map.uri)?,
                byte_range,
            };
            match &init {
                None => init = Some(map_init),
                Some(current) if *current != map_init => {
                    tracing::warn!("Ignoring EXT-X-MAP change at segment {index}.");
                }
                _ => {}
            }
        }

        let url = playlist_url.join(&segment.uri)?;
        let byte_range = match &segment.byte_range {
            Some(range) => {
                let offset = range
                    .offset
                    .unwrap_or_else(|| range_ends.get(&url).copied().unwrap_or_default());
                range_ends.insert(url.clone(), offset + range.length);
                Some(sub_range(offset, range.length, index)?)
            }
            None => None,
        };

        total_duration += segment.duration as f64;
        segments.push(SegmentRef {
            index,
            sequence: playlist.media_sequence + index as u64,
            url,
            byte_range,
            duration: Some(segment.duration as f64),
        });
    }

    tracing::debug!(
        "Parsed {} segment(s) from {playlist_url}, duration {total_duration:.2}s",
        segments.len()
    );

    Ok(Representation {
        id: variant.id.clone(),
        kind: variant.kind,
        codec: variant.codec.clone(),
        bandwidth: variant.bandwidth,
        width: variant.width,
        height: variant.height,
        language: variant.language.clone(),
        init,
        segments,
        encryption: encryption.unwrap_or_default(),
        duration: Some(Duration::from_secs_f64(total_duration)),
    })
}

async fn resolve_key(
    client: &HttpClient,
    key: &m3u8_rs::Key,
    playlist_url: &Url,
    cache: &mut HashMap<Url, [u8; 16]>,
) -> TsumugiResult<EncryptionContext> {
    let method = match &key.method {
        KeyMethod::None => return Ok(EncryptionContext::None),
        KeyMethod::AES128 => EncryptionMethod::Cbc,
        KeyMethod::Other(name)
            if matches!(name.as_str(), "SAMPLE-AES-CENC" | "SAMPLE-AES-CTR") =>
        {
            let pssh = key
                .uri
                .as_deref()
                .and_then(|uri| uri.strip_prefix(PSSH_DATA_PREFIX))
                .unwrap_or_default()
                .to_string();
            return Ok(EncryptionContext::Cenc {
                pssh,
                license_url: None,
            });
        }
        KeyMethod::Other(name) => EncryptionMethod::from_hls_method(name).ok_or_else(|| {
            TsumugiError::ManifestError(format!("unsupported key method: {name}"))
        })?,
        KeyMethod::SampleAES => {
            return Err(TsumugiError::ManifestError(
                "SAMPLE-AES is not supported".to_string(),
            ))
        }
    };
    if method == EncryptionMethod::None {
        return Ok(EncryptionContext::None);
    }

    let uri = key.uri.as_deref().ok_or_else(|| {
        TsumugiError::ManifestError("EXT-X-KEY is missing its URI".to_string())
    })?;
    let key_url = playlist_url.join(uri)?;
    let key_bytes = match cache.get(&key_url) {
        Some(key_bytes) => *key_bytes,
        None => {
            let key_bytes = fetch_key(client, key_url.clone()).await.map_err(|e| {
                TsumugiError::ManifestError(format!("failed to fetch key {key_url}: {e}"))
            })?;
            cache.insert(key_url, key_bytes);
            key_bytes
        }
    };

    Ok(EncryptionContext::Aes {
        method,
        key: key_bytes,
        iv: key.iv.as_deref().map(parse_iv).transpose()?,
    })
}

async fn load_media_playlist(
    client: &HttpClient,
    variant: &HlsVariant,
) -> TsumugiResult<(Representation, String)> {
    let (_, _, text) = client
        .fetch_text(variant.url.clone())
        .await
        .map_err(TsumugiError::manifest)?;
    let representation = parse_media_playlist(client, &text, variant).await?;
    Ok((representation, text))
}

fn sub_range(offset: u64, length: u64, index: usize) -> TsumugiResult<ByteRange> {
    if length == 0 {
        return Err(TsumugiError::ManifestError(format!(
            "empty byte range at segment {index}"
        )));
    }
    Ok(ByteRange::new(offset, Some(length)))
}

/// Fetch the playlist at `url` and resolve it into a [`Selection`].
///
/// For a master playlist the variant and audio rendition are chosen by
/// `policy` first, and only their media playlists are fetched.
pub async fn load_playlist(
    client: &HttpClient,
    url: Url,
    policy: &SelectionPolicy,
) -> TsumugiResult<LoadedPlaylist> {
    tracing::info!("Start fetching M3U8 file.");
    let (url, _, text) = client.fetch_text(url).await.map_err(TsumugiError::manifest)?;
    tracing::info!("M3U8 file fetched.");

    load_playlist_text(client, url, &text, policy).await
}

/// Same as [`load_playlist`] for an already fetched top-level playlist.
pub async fn load_playlist_text(
    client: &HttpClient,
    url: Url,
    text: &str,
    policy: &SelectionPolicy,
) -> TsumugiResult<LoadedPlaylist> {
    let parsed = m3u8_rs::parse_playlist_res(text.as_bytes())
        .map_err(|_| TsumugiError::M3u8ParseError(url.to_string()))?;

    match parsed {
        Playlist::MediaPlaylist(playlist) => {
            let variant = HlsVariant::standalone(url);
            let video = build_representation(client, playlist, &variant).await?;
            tracing::info!("Selected video: {video}");
            Ok(LoadedPlaylist {
                selection: Selection { video, audio: None },
                media_playlists: vec![(StreamKind::Video, text.to_string())],
            })
        }
        Playlist::MasterPlaylist(_) => {
            tracing::info!("Master playlist input detected.");
            let master = parse_master_playlist(text, &url)?;
            let video = select_video(&master.videos, &policy.resolution)
                .ok_or(TsumugiError::NoRepresentationFound)?;
            let audios = master.audio_for(video);
            let audio = select_audio(&audios, &policy.languages).copied();

            let (video, video_text) = load_media_playlist(client, video).await?;
            tracing::info!("Selected video: {video}");
            let mut media_playlists = vec![(StreamKind::Video, video_text)];

            let audio = match audio {
                Some(audio) => {
                    let (audio, audio_text) = load_media_playlist(client, audio).await?;
                    tracing::info!("Selected audio: {audio}");
                    media_playlists.push((StreamKind::Audio, audio_text));
                    Some(audio)
                }
                None => None,
            };

            Ok(LoadedPlaylist {
                selection: Selection { video, audio },
                media_playlists,
            })
        }
    }
}

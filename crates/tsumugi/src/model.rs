use std::{fmt, time::Duration};

use url::Url;

use crate::util::range::ByteRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum StreamKind {
    #[default]
    Video,
    Audio,
}

impl StreamKind {
    pub fn from_mime_type(mime_type: Option<&str>) -> Option<Self> {
        let mime_type = mime_type.unwrap_or("video");

        if mime_type.starts_with("video") {
            Some(Self::Video)
        } else if mime_type.starts_with("audio") {
            Some(Self::Audio)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One media segment of a [`Representation`].
///
/// `index` is zero-based and contiguous inside a representation. It is the only
/// thing that decides where the payload lands in the output.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRef {
    pub index: usize,
    /// Media sequence for HLS, `$Number$` for DASH.
    pub sequence: u64,
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    /// Segment duration in seconds, when the manifest declares it.
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitSegment {
    pub url: Url,
    pub byte_range: Option<ByteRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMethod {
    None,
    Cbc,
    Ctr,
    Ecb,
}

impl EncryptionMethod {
    /// Maps an `EXT-X-KEY` `METHOD` value. Unknown methods return `None`.
    pub fn from_hls_method(method: &str) -> Option<Self> {
        Some(match method.to_ascii_uppercase().as_str() {
            "NONE" => Self::None,
            "AES" | "AES-128" | "AES-128-CBC" => Self::Cbc,
            "AES-128-CTR" | "AES-CTR" => Self::Ctr,
            "AES-128-ECB" | "AES-ECB" => Self::Ecb,
            _ => return None,
        })
    }
}

#[derive(Clone, PartialEq, Default)]
pub enum EncryptionContext {
    #[default]
    None,
    /// Whole-segment AES, the key is fetched while the playlist is parsed.
    Aes {
        method: EncryptionMethod,
        key: [u8; 16],
        /// `None` means the IV is derived from the segment sequence.
        iv: Option<[u8; 16]>,
    },
    /// Common encryption, keys are resolved through a CDM before decrypting.
    Cenc {
        pssh: String,
        license_url: Option<String>,
    },
}

impl EncryptionContext {
    pub fn is_encrypted(&self) -> bool {
        !matches!(
            self,
            Self::None
                | Self::Aes {
                    method: EncryptionMethod::None,
                    ..
                }
        )
    }
}

// keys never end up in logs
impl fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Aes { method, iv, .. } => f
                .debug_struct("Aes")
                .field("method", method)
                .field("key", &"<redacted>")
                .field("iv", &iv.map(hex::encode))
                .finish(),
            Self::Cenc { pssh, license_url } => f
                .debug_struct("Cenc")
                .field("pssh", pssh)
                .field("license_url", license_url)
                .finish(),
        }
    }
}

/// A selectable stream variant produced by a manifest parser.
///
/// Parsers build these once and never mutate them afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub id: String,
    pub kind: StreamKind,
    pub codec: Option<String>,
    pub bandwidth: u64,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub language: Option<String>,
    pub init: Option<InitSegment>,
    pub segments: Vec<SegmentRef>,
    pub encryption: EncryptionContext,
    pub duration: Option<Duration>,
}

impl Representation {
    /// Returns a copy of this representation pointing its CENC context to
    /// `license_url`. Other encryption kinds are returned unchanged.
    pub fn with_license_url(&self, license_url: Option<String>) -> Self {
        let mut representation = self.clone();
        if let EncryptionContext::Cenc {
            license_url: current,
            ..
        } = &mut representation.encryption
        {
            if license_url.is_some() {
                *current = license_url;
            }
        }
        representation
    }

    /// File extension used for the fetched elementary stream.
    pub fn extension(&self) -> &'static str {
        let fragmented = self.init.is_some()
            || matches!(self.encryption, EncryptionContext::Cenc { .. })
            || self
                .segments
                .first()
                .map(|s| {
                    let path = s.url.path();
                    path.ends_with(".m4s") || path.ends_with(".mp4") || path.ends_with(".m4a")
                })
                .unwrap_or_default();

        match (fragmented, self.kind) {
            (true, StreamKind::Video) => "mp4",
            (true, StreamKind::Audio) => "m4a",
            (false, _) => "ts",
        }
    }
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.id)?;
        if let (Some(width), Some(height)) = (self.width, self.height) {
            write!(f, " {width}x{height}")?;
        }
        if let Some(language) = &self.language {
            write!(f, " lang={language}")?;
        }
        if let Some(codec) = &self.codec {
            write!(f, " codec={codec}")?;
        }
        write!(f, " bandwidth={} segments={}", self.bandwidth, self.segments.len())
    }
}

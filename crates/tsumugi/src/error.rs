use thiserror::Error;

#[derive(Error, Debug)]
pub enum TsumugiError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("Manifest error: {0}")]
    ManifestError(String),

    #[error("Invalid m3u8 file: {0}")]
    M3u8ParseError(String),

    #[error("Invalid mpd file: {0}")]
    MpdParsing(String),

    #[error("No representation found")]
    NoRepresentationFound,

    #[error("Segment {index} failed after {attempts} attempt(s): {reason}")]
    SegmentFetchError {
        index: usize,
        attempts: u32,
        reason: String,
    },

    #[error("Init segment failed: {0}")]
    InitSegmentError(String),

    #[error("Segment {0} returned an empty payload")]
    EmptySegment(usize),

    #[error("Only {succeeded}/{total} segments were downloaded, missing: {missing:?}")]
    AggregateFetchError {
        succeeded: usize,
        total: usize,
        missing: Vec<usize>,
    },

    #[error("Decryption error: {0}")]
    DecryptionError(String),

    #[error("Invalid AES key: {0:?}")]
    InvalidAesKey(Vec<u8>),

    #[error("Invalid KID:KEY pair: {0}")]
    InvalidKeyPair(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Mux error: {0}")]
    MuxError(String),

    #[error("Download interrupted")]
    Interrupted,

    #[error("Stream halted after another stream failed")]
    Halted,

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    HexDecodeError(#[from] hex::FromHexError),

    #[error(transparent)]
    Base64DecodeError(#[from] base64::DecodeError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    MpdParseError(#[from] dash_mpd::DashMpdError),

    #[error(transparent)]
    MissingExecutable(#[from] which::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    JoinError(#[from] tokio::task::JoinError),
}

impl TsumugiError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// Wraps any error raised while loading a manifest, so callers see a
    /// single failure kind for the whole parse stage.
    pub(crate) fn manifest<E: std::fmt::Display>(error: E) -> Self {
        Self::ManifestError(error.to_string())
    }
}

pub type TsumugiResult<T> = Result<T, TsumugiError>;

//! Segmented HLS / MPEG-DASH acquisition and decryption engine.
//!
//! ```text
//!  manifest ──► hls / dash ──► select ──► SegmentScheduler ──► decrypt ──► Muxer
//!                                           │  ▲                 ▲
//!                                   workers ▼  │ ordered writer   │ KeyProvider
//! ```
//!
//! [`DownloadOrchestrator`] drives the whole pipeline and resolves every run
//! to a [`DownloadResult`].

pub mod dash;
pub mod decrypt;
pub mod download;
pub mod error;
pub mod hls;
pub mod interrupt;
pub mod key;
pub mod merge;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod select;
pub mod util;

pub use error::{TsumugiError, TsumugiResult};
pub use interrupt::{Interrupt, InterruptLevel};
pub use model::{
    EncryptionContext, EncryptionMethod, InitSegment, Representation, SegmentRef, StreamKind,
};
pub use orchestrator::{
    DownloadOrchestrator, DownloadRequest, DownloadResult, DownloadState, DrmOptions, EngineConfig,
};
pub use select::{ResolutionPolicy, SelectionPolicy};
pub use util::{http::HttpClient, range::ByteRange};

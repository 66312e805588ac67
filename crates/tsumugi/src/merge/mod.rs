//! External muxers combining the fetched elementary streams.

mod ffmpeg;
mod mkvmerge;

use std::{future::Future, path::Path, process::Output, time::Duration};

use serde::Deserialize;

pub use ffmpeg::FfmpegMuxer;
pub use mkvmerge::MkvMergeMuxer;

use crate::{
    error::{TsumugiError, TsumugiResult},
    model::Representation,
};

pub trait Muxer {
    /// Combine `video` and an optional `audio` stream into `output`. When the
    /// streams differ in duration the result is cut to the shorter one.
    /// `shortest` carries that duration when the manifest declared both, see
    /// [`shorter_duration`].
    fn mux(
        &self,
        video: &Path,
        audio: Option<&Path>,
        shortest: Option<Duration>,
        output: &Path,
    ) -> impl Future<Output = TsumugiResult<()>> + Send;
}

/// Duration of the shorter stream, if both are known and they differ.
pub fn shorter_duration(video: &Representation, audio: Option<&Representation>) -> Option<Duration> {
    let video = video.duration?;
    let audio = audio?.duration?;
    (video != audio).then(|| video.min(audio))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuxerKind {
    #[default]
    Auto,
    Ffmpeg,
    Mkvmerge,
}

/// Picks a muxer from `PATH` when invoked. `Auto` prefers ffmpeg and falls
/// back to mkvmerge.
#[derive(Debug, Clone, Default)]
pub struct AutoMuxer {
    kind: MuxerKind,
}

impl AutoMuxer {
    pub fn new(kind: MuxerKind) -> Self {
        Self { kind }
    }
}

impl Muxer for AutoMuxer {
    async fn mux(
        &self,
        video: &Path,
        audio: Option<&Path>,
        shortest: Option<Duration>,
        output: &Path,
    ) -> TsumugiResult<()> {
        match self.kind {
            MuxerKind::Ffmpeg => {
                FfmpegMuxer::locate()?
                    .mux(video, audio, shortest, output)
                    .await
            }
            MuxerKind::Mkvmerge => {
                MkvMergeMuxer::locate()?
                    .mux(video, audio, shortest, output)
                    .await
            }
            MuxerKind::Auto => match FfmpegMuxer::locate() {
                Ok(ffmpeg) => ffmpeg.mux(video, audio, shortest, output).await,
                Err(_) => {
                    tracing::debug!("ffmpeg not found, trying mkvmerge.");
                    MkvMergeMuxer::locate()
                        .map_err(|_| {
                            TsumugiError::MuxError("neither ffmpeg nor mkvmerge found".to_string())
                        })?
                        .mux(video, audio, shortest, output)
                        .await
                }
            },
        }
    }
}

pub(crate) fn locate(binary: &str) -> TsumugiResult<std::path::PathBuf> {
    which::which(binary).map_err(|e| TsumugiError::MuxError(format!("{binary} not found: {e}")))
}

/// Turn a finished muxer process into a result. `accepted` lists exit codes
/// that still mean success.
pub(crate) fn check_output(
    name: &str,
    result: Output,
    accepted: &[i32],
    output: &Path,
) -> TsumugiResult<()> {
    let accepted = result
        .status
        .code()
        .is_some_and(|code| code == 0 || accepted.contains(&code));
    if !accepted {
        return Err(TsumugiError::MuxError(format!(
            "{name} exited with {}: {}",
            result.status,
            String::from_utf8_lossy(&result.stderr).trim()
        )));
    }

    match std::fs::metadata(output) {
        Ok(metadata) if metadata.len() > 0 => Ok(()),
        _ => Err(TsumugiError::MuxError(format!(
            "{name} did not produce {}",
            output.display()
        ))),
    }
}

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::process::Command;

use super::{check_output, locate, Muxer};
use crate::error::TsumugiResult;

/// Remuxes with the ffmpeg CLI, copying streams without re-encoding.
#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    binary: PathBuf,
}

impl FfmpegMuxer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn locate() -> TsumugiResult<Self> {
        Ok(Self::new(locate("ffmpeg")?))
    }

    pub(crate) fn args(video: &Path, audio: Option<&Path>, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        for arg in ["-y", "-loglevel", "error", "-i"] {
            args.push(arg.into());
        }
        args.push(video.into());
        match audio {
            Some(audio) => {
                args.push("-i".into());
                args.push(audio.into());
                for arg in ["-map", "0:v?", "-map", "1:a", "-shortest"] {
                    args.push(arg.into());
                }
            }
            None => {
                args.push("-map".into());
                args.push("0".into());
            }
        }
        args.push("-c".into());
        args.push("copy".into());
        args.push(output.into());
        args
    }
}

impl Muxer for FfmpegMuxer {
    /// `-shortest` already cuts to the shorter stream.
    async fn mux(
        &self,
        video: &Path,
        audio: Option<&Path>,
        _shortest: Option<Duration>,
        output: &Path,
    ) -> TsumugiResult<()> {
        tracing::debug!("Merging with ffmpeg CLI...");
        let result = Command::new(&self.binary)
            .args(Self::args(video, audio, output))
            .output()
            .await?;
        check_output("ffmpeg", result, &[], output)
    }
}

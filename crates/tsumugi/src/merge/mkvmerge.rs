use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::process::Command;

use super::{check_output, locate, Muxer};
use crate::error::TsumugiResult;

/// mkvmerge exits with 1 when it only emitted warnings.
const WARNINGS_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone)]
pub struct MkvMergeMuxer {
    binary: PathBuf,
}

impl MkvMergeMuxer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn locate() -> TsumugiResult<Self> {
        Ok(Self::new(locate("mkvmerge")?))
    }

    pub(crate) fn args(
        video: &Path,
        audio: Option<&Path>,
        shortest: Option<Duration>,
        output: &Path,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-q".into(), "-o".into(), output.into()];
        if let (Some(_), Some(shortest)) = (audio, shortest) {
            args.push("--split".into());
            args.push(format!("parts:00:00:00.000-{}", timestamp(shortest)).into());
        }
        args.push(video.into());
        if let Some(audio) = audio {
            args.push(audio.into());
        }
        args
    }
}

/// `HH:MM:SS.mmm`
fn timestamp(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        secs / 3600,
        secs / 60 % 60,
        secs % 60,
        duration.subsec_millis()
    )
}

/// mkvmerge numbers its output once splitting is enabled, `out.mkv` becomes
/// `out-001.mkv`.
fn first_part(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match output.extension() {
        Some(ext) => format!("{stem}-001.{}", ext.to_string_lossy()),
        None => format!("{stem}-001"),
    };
    output.with_file_name(name)
}

impl Muxer for MkvMergeMuxer {
    async fn mux(
        &self,
        video: &Path,
        audio: Option<&Path>,
        shortest: Option<Duration>,
        output: &Path,
    ) -> TsumugiResult<()> {
        tracing::debug!("Merging with mkvmerge...");
        let result = Command::new(&self.binary)
            .args(Self::args(video, audio, shortest, output))
            .output()
            .await?;

        let part = first_part(output);
        if !output.exists() && part.exists() {
            tokio::fs::rename(&part, output).await?;
        }
        check_output("mkvmerge", result, &[WARNINGS_EXIT_CODE], output)
    }
}

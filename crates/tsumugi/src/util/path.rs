use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{error::TsumugiResult, model::StreamKind};

/// How intermediate files are laid out inside a [`WorkDir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkDirLayout {
    /// Everything in one folder, used for HLS.
    Flat,
    /// `encrypted/`, `decrypted/` and `optimize/` subfolders, used for DASH.
    Staged,
}

/// Per-download working directory holding fetched streams until they are muxed.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
    layout: WorkDirLayout,
}

impl WorkDir {
    const ENCRYPTED: &'static str = "encrypted";
    const DECRYPTED: &'static str = "decrypted";
    const OPTIMIZE: &'static str = "optimize";

    /// Picks a fresh directory name below `base`. Nothing is created yet.
    pub fn unique_in(base: impl AsRef<Path>, layout: WorkDirLayout) -> Self {
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let root = base
            .as_ref()
            .join(format!("tsumugi_{started_at}_{}", rand::random::<u16>()));
        Self { root, layout }
    }

    pub fn new(root: impl Into<PathBuf>, layout: WorkDirLayout) -> Self {
        Self {
            root: root.into(),
            layout,
        }
    }

    pub async fn create(&self) -> TsumugiResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        if self.layout == WorkDirLayout::Staged {
            for dir in [Self::ENCRYPTED, Self::DECRYPTED, Self::OPTIMIZE] {
                tokio::fs::create_dir_all(self.root.join(dir)).await?;
            }
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> WorkDirLayout {
        self.layout
    }

    /// Where the scheduler writes the assembled stream.
    pub fn fetch_path(&self, kind: StreamKind, ext: &str) -> PathBuf {
        let filename = format!("{kind}.{ext}");
        match self.layout {
            WorkDirLayout::Flat => self.root.join(filename),
            WorkDirLayout::Staged => self.root.join(Self::ENCRYPTED).join(filename),
        }
    }

    pub fn decrypted_path(&self, kind: StreamKind, ext: &str) -> PathBuf {
        match self.layout {
            WorkDirLayout::Flat => {
                let mut path = self.fetch_path(kind, ext);
                path.add_suffix("decrypted");
                path
            }
            WorkDirLayout::Staged => self
                .root
                .join(Self::DECRYPTED)
                .join(format!("{kind}.{ext}")),
        }
    }

    /// Where the muxer writes before the result is moved to `output`. Never
    /// the same path as a fetched stream.
    pub fn mux_path(&self, output: &Path) -> PathBuf {
        let filename = output
            .file_name()
            .map(OsStr::to_os_string)
            .unwrap_or_else(|| OsString::from("output.mkv"));
        match self.layout {
            WorkDirLayout::Flat => {
                let mut path = self.root.join(filename);
                path.add_suffix("muxed");
                path
            }
            WorkDirLayout::Staged => self.root.join(Self::OPTIMIZE).join(filename),
        }
    }

    /// Cached copy of a media playlist.
    pub fn playlist_path(&self, kind: StreamKind) -> PathBuf {
        self.root.join(format!("{kind}.m3u8"))
    }

    /// Empty stand-in for the index-0 fragment of a stream without an
    /// initialization segment.
    pub fn placeholder_path(&self, kind: StreamKind) -> PathBuf {
        self.root.join(format!("{kind}_0.ts"))
    }

    pub async fn remove(&self) -> TsumugiResult<()> {
        if tokio::fs::try_exists(&self.root).await? {
            tokio::fs::remove_dir_all(&self.root).await?;
        }
        Ok(())
    }
}

pub trait TsumugiPathExt {
    /// Add suffix to file name without changing extension.
    ///
    /// Note this function does not handle multiple suffixes.
    /// For example, `test.tar.gz` with `_suffix` will be `test.tar_suffix.gz`.
    fn add_suffix<T: AsRef<OsStr>>(&mut self, suffix: T);
}

impl TsumugiPathExt for PathBuf {
    fn add_suffix<T: AsRef<OsStr>>(&mut self, suffix: T) {
        let mut filename = OsString::new();

        // {file_stem}_{suffix}.{ext}
        if let Some(file_stem) = self.file_stem() {
            filename.push(file_stem);
        }
        filename.push("_");
        filename.push(suffix);

        if let Some(ext) = self.extension() {
            filename.push(".");
            filename.push(ext);
        }

        self.set_file_name(filename);
    }
}

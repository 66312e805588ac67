//! Top-level download state machine.
//!
//! `Init → ManifestParsed → Fetching → [Decrypting] → Finalizing → Done`, with
//! `Failed` and `Stopped` reachable from every stage. Whatever happens, a run
//! resolves to a single [`DownloadResult`].

use std::{
    collections::HashMap,
    fmt,
    num::NonZeroU32,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    dash,
    decrypt::{DecryptTool, ExternalDecryptor, SegmentDecryptor},
    download::{DownloadSession, RetryPolicy, RetrySummary, SchedulerReport, SegmentScheduler},
    error::{TsumugiError, TsumugiResult},
    hls,
    interrupt::Interrupt,
    key::{ContentDecryptionModule, ContentKey, KeyProvider, LicenseRequest},
    merge::{shorter_duration, AutoMuxer, Muxer, MuxerKind},
    model::{EncryptionContext, Representation},
    progress::{ByteCounter, ProgressEstimator, ProgressHandle},
    select::{select, Selection, SelectionPolicy},
    util::{
        deserialize_millis, deserialize_secs, detect_manifest_format,
        http::HttpClient,
        path::{WorkDir, WorkDirLayout},
        ManifestFormat,
    },
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub video_concurrency: NonZeroU32,
    pub audio_concurrency: NonZeroU32,
    pub retry: RetryPolicy,
    /// Parent of the per-download working directories.
    pub temp_dir: PathBuf,
    /// Keep the working directory after a successful run.
    pub keep_temp: bool,
    pub decrypt_tool: DecryptTool,
    pub decrypt_tool_path: Option<PathBuf>,
    /// Remove the encrypted intermediate once it has been decrypted.
    pub delete_encrypted: bool,
    pub muxer: MuxerKind,
    #[serde(rename = "progress_interval_ms", deserialize_with = "deserialize_millis")]
    pub progress_interval: Duration,
    #[serde(rename = "timeout_secs", deserialize_with = "deserialize_secs")]
    pub timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            video_concurrency: NonZeroU32::MIN.saturating_add(4),
            audio_concurrency: NonZeroU32::MIN.saturating_add(2),
            retry: RetryPolicy::default(),
            temp_dir: std::env::temp_dir(),
            keep_temp: false,
            decrypt_tool: DecryptTool::default(),
            decrypt_tool_path: None,
            delete_encrypted: true,
            muxer: MuxerKind::default(),
            progress_interval: ProgressEstimator::DEFAULT_INTERVAL,
            timeout: Duration::from_secs(30),
        }
    }
}

/// License exchange parameters and manually supplied keys.
#[derive(Debug, Clone, Default)]
pub struct DrmOptions {
    /// Overrides the license URL found in the manifest.
    pub license_url: Option<String>,
    pub headers: HashMap<String, String>,
    pub payload: Option<Value>,
    /// When present the license exchange is skipped.
    pub keys: Vec<ContentKey>,
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: Url,
    pub output: PathBuf,
    pub headers: HashMap<String, String>,
    pub cookies: Vec<String>,
    pub selection: SelectionPolicy,
    pub drm: DrmOptions,
}

impl DownloadRequest {
    pub fn new(url: Url, output: impl Into<PathBuf>) -> Self {
        Self {
            url,
            output: output.into(),
            headers: HashMap::new(),
            cookies: Vec::new(),
            selection: SelectionPolicy::default(),
            drm: DrmOptions::default(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn selection(mut self, selection: SelectionPolicy) -> Self {
        self.selection = selection;
        self
    }

    pub fn drm(mut self, drm: DrmOptions) -> Self {
        self.drm = drm;
        self
    }
}

/// Outcome of one run. `error` is set iff the run failed, `stopped` iff it
/// was cancelled. A stopped run keeps its partial output at `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadResult {
    pub path: Option<PathBuf>,
    pub error: Option<String>,
    pub stopped: bool,
}

impl DownloadResult {
    fn done(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            error: None,
            stopped: false,
        }
    }

    fn failed(error: &TsumugiError) -> Self {
        Self {
            path: None,
            error: Some(error.to_string()),
            stopped: false,
        }
    }

    fn stopped(path: Option<PathBuf>) -> Self {
        Self {
            path,
            error: None,
            stopped: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.stopped && self.path.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Init,
    ManifestParsed,
    Fetching,
    Decrypting,
    Finalizing,
    Done,
    Failed,
    Stopped,
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::ManifestParsed => "manifest parsed",
            Self::Fetching => "fetching",
            Self::Decrypting => "decrypting",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

enum Outcome {
    Completed(PathBuf),
    Stopped(Option<PathBuf>),
}

pub struct DownloadOrchestrator<M = AutoMuxer> {
    config: EngineConfig,
    muxer: M,
    interrupt: Interrupt,
    cdm: Option<Arc<dyn ContentDecryptionModule>>,
    state: Mutex<DownloadState>,
}

impl DownloadOrchestrator<AutoMuxer> {
    /// An orchestrator using the muxer named by `config`.
    pub fn new(config: EngineConfig) -> Self {
        Self::builder()
            .muxer(AutoMuxer::new(config.muxer))
            .config(config)
            .build()
    }

    pub fn builder() -> DownloadOrchestratorBuilder<AutoMuxer> {
        DownloadOrchestratorBuilder::new()
    }
}

impl<M> DownloadOrchestrator<M>
where
    M: Muxer + Send + Sync,
{
    pub fn state(&self) -> DownloadState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, next: DownloadState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!("State: {} -> {next}", *state);
        *state = next;
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Run one download to completion. Never fails, every error is folded
    /// into the returned [`DownloadResult`].
    pub async fn run(&self, request: DownloadRequest) -> DownloadResult {
        self.enter(DownloadState::Init);
        let summary = Mutex::new(RetrySummary::default());

        let result = tokio::select! {
            result = self.execute(&request, &summary) => result,
            _ = self.interrupt.aborted() => {
                tracing::warn!("Run abandoned in place.");
                Ok(Outcome::Stopped(None))
            }
        };

        let summary = *summary.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::info!("Retry summary: {summary}");

        match result {
            Ok(Outcome::Completed(path)) => {
                self.enter(DownloadState::Done);
                tracing::info!("Saved to {}", path.display());
                DownloadResult::done(path)
            }
            Ok(Outcome::Stopped(path)) => {
                self.enter(DownloadState::Stopped);
                if let Some(path) = &path {
                    tracing::info!("Stopped, partial output kept at {}", path.display());
                }
                DownloadResult::stopped(path)
            }
            Err(e) if e.is_interrupted() => {
                self.enter(DownloadState::Stopped);
                DownloadResult::stopped(None)
            }
            Err(e) => {
                self.enter(DownloadState::Failed);
                tracing::error!("Download failed: {e}");
                DownloadResult::failed(&e)
            }
        }
    }

    async fn execute(
        &self,
        request: &DownloadRequest,
        summary: &Mutex<RetrySummary>,
    ) -> TsumugiResult<Outcome> {
        let counter = ByteCounter::default();
        let client = self.http_client(request, counter.clone())?;

        let mut estimator = ProgressEstimator::new(counter, self.config.progress_interval);
        estimator.start();
        let result = self
            .execute_with(&client, &estimator.handle(), request, summary)
            .await;
        estimator.stop().await;

        result
    }

    fn http_client(&self, request: &DownloadRequest, counter: ByteCounter) -> TsumugiResult<HttpClient> {
        let builder = Client::builder()
            .default_headers(header_map(&request.headers)?)
            .timeout(self.config.timeout);
        let client = HttpClient::new(builder)?.with_counter(counter);
        if !request.cookies.is_empty() {
            client.add_cookies(request.cookies.clone(), request.url.clone())?;
        }
        Ok(client)
    }

    async fn execute_with(
        &self,
        client: &HttpClient,
        progress: &ProgressHandle,
        request: &DownloadRequest,
        summary: &Mutex<RetrySummary>,
    ) -> TsumugiResult<Outcome> {
        let (selection, workdir) = self.load_manifest(client, request).await?;
        self.enter(DownloadState::ManifestParsed);
        if self.interrupt.is_stopped() {
            return Ok(Outcome::Stopped(None));
        }

        self.enter(DownloadState::Fetching);
        // a fatal error in one stream halts the other
        let halt = self.interrupt.child_token();
        let video = self.fetch_stream(
            client,
            progress,
            &workdir,
            &selection.video,
            self.config.video_concurrency,
            &halt,
            summary,
        );
        let audio = async {
            match &selection.audio {
                Some(audio) => self
                    .fetch_stream(
                        client,
                        progress,
                        &workdir,
                        audio,
                        self.config.audio_concurrency,
                        &halt,
                        summary,
                    )
                    .await
                    .map(Some),
                None => Ok(None),
            }
        };
        let (video, audio) = match tokio::join!(video, audio) {
            (Ok(video), Ok(audio)) => (video, audio),
            (Err(TsumugiError::Halted), Err(e)) | (Err(e), _) | (_, Err(e)) => return Err(e),
        };

        if video.interrupted || audio.as_ref().is_some_and(|a| a.interrupted) {
            return Ok(Outcome::Stopped(Some(video.path)));
        }
        if self.interrupt.is_stopped() {
            return Ok(Outcome::Stopped(Some(video.path)));
        }

        let video_path = self
            .decrypt_stream(client, request, &workdir, &selection.video, video)
            .await?;
        let audio_path = match (&selection.audio, audio) {
            (Some(representation), Some(report)) => Some(
                self.decrypt_stream(client, request, &workdir, representation, report)
                    .await?,
            ),
            _ => None,
        };
        if self.interrupt.is_stopped() {
            return Ok(Outcome::Stopped(Some(video_path)));
        }

        self.enter(DownloadState::Finalizing);
        let shortest = shorter_duration(&selection.video, selection.audio.as_ref());
        self.finalize(
            &workdir,
            &video_path,
            audio_path.as_deref(),
            shortest,
            &request.output,
        )
        .await?;

        if self.config.keep_temp {
            tracing::info!("Temporary files kept at {}", workdir.root().display());
        } else if let Err(e) = workdir.remove().await {
            tracing::warn!("Failed to remove {}: {e}", workdir.root().display());
        }
        Ok(Outcome::Completed(request.output.clone()))
    }

    async fn load_manifest(
        &self,
        client: &HttpClient,
        request: &DownloadRequest,
    ) -> TsumugiResult<(Selection, WorkDir)> {
        tracing::info!("Fetching manifest {}", request.url);
        let (url, content_type, text) = client
            .fetch_text(request.url.clone())
            .await
            .map_err(TsumugiError::manifest)?;

        let format = detect_manifest_format(&url, content_type.as_deref(), &text)
            .ok_or_else(|| TsumugiError::ManifestError(format!("unknown manifest type: {url}")))?;
        tracing::debug!("Manifest type: {format:?}");

        let (selection, workdir) = match format {
            ManifestFormat::Hls => {
                let loaded =
                    hls::load_playlist_text(client, url, &text, &request.selection).await?;
                let workdir = WorkDir::unique_in(&self.config.temp_dir, WorkDirLayout::Flat);
                workdir.create().await?;
                for (kind, playlist) in &loaded.media_playlists {
                    tokio::fs::write(workdir.playlist_path(*kind), playlist).await?;
                }
                let streams = std::iter::once(&loaded.selection.video)
                    .chain(loaded.selection.audio.as_ref());
                for stream in streams.filter(|stream| stream.init.is_none()) {
                    tokio::fs::write(workdir.placeholder_path(stream.kind), b"").await?;
                }
                (loaded.selection, workdir)
            }
            ManifestFormat::Dash => {
                let representations = dash::parse_mpd(&text, &url)?;
                tracing::info!("{} representation(s) found.", representations.len());
                let selection = select(&representations, &request.selection)?;
                let workdir = WorkDir::unique_in(&self.config.temp_dir, WorkDirLayout::Staged);
                workdir.create().await?;
                (selection, workdir)
            }
        };
        tracing::debug!("Working directory: {}", workdir.root().display());

        let license_url = request.drm.license_url.clone();
        Ok((
            Selection {
                video: selection.video.with_license_url(license_url.clone()),
                audio: selection
                    .audio
                    .map(|audio| audio.with_license_url(license_url)),
            },
            workdir,
        ))
    }

    async fn fetch_stream(
        &self,
        client: &HttpClient,
        progress: &ProgressHandle,
        workdir: &WorkDir,
        representation: &Representation,
        concurrency: NonZeroU32,
        halt: &CancellationToken,
        summary: &Mutex<RetrySummary>,
    ) -> TsumugiResult<SchedulerReport> {
        let session = Arc::new(DownloadSession::new(
            representation.kind,
            &representation.segments,
        ));
        let output = workdir.fetch_path(representation.kind, representation.extension());

        let result = SegmentScheduler::new(Arc::new(client.clone()), self.interrupt.clone())
            .concurrency(concurrency)
            .halt(halt.clone())
            .retry(self.config.retry)
            .decryptor(SegmentDecryptor::from_context(&representation.encryption))
            .progress(progress.clone())
            .download(session.clone(), representation, &output)
            .await;

        let mut summary = summary.lock().unwrap_or_else(PoisonError::into_inner);
        *summary = summary.merge(session.summary());
        result
    }

    /// Decrypts a CENC stream with the external tool. Anything else is
    /// returned unchanged, segment level AES was already removed while fetching.
    async fn decrypt_stream(
        &self,
        client: &HttpClient,
        request: &DownloadRequest,
        workdir: &WorkDir,
        representation: &Representation,
        report: SchedulerReport,
    ) -> TsumugiResult<PathBuf> {
        if !matches!(representation.encryption, EncryptionContext::Cenc { .. }) {
            return Ok(report.path);
        }
        if self.interrupt.is_stopped() {
            return Err(TsumugiError::Interrupted);
        }
        self.enter(DownloadState::Decrypting);

        let mut provider = KeyProvider::new(client.clone()).with_keys(request.drm.keys.clone());
        if let Some(cdm) = &self.cdm {
            provider = provider.with_cdm(cdm.clone());
        }
        let license = LicenseRequest {
            license_url: request.drm.license_url.clone(),
            headers: request.drm.headers.clone(),
            payload: request.drm.payload.clone(),
        };
        let keys = provider.resolve(&representation.encryption, &license).await?;

        let decryptor = ExternalDecryptor::new(
            self.config.decrypt_tool,
            self.config.decrypt_tool_path.clone(),
        )?;
        let output = workdir.decrypted_path(representation.kind, representation.extension());
        decryptor.decrypt_file(&keys, &report.path, &output).await?;

        if self.config.delete_encrypted {
            tokio::fs::remove_file(&report.path).await?;
        }
        Ok(output)
    }

    async fn finalize(
        &self,
        workdir: &WorkDir,
        video: &Path,
        audio: Option<&Path>,
        shortest: Option<Duration>,
        output: &Path,
    ) -> TsumugiResult<()> {
        let muxed = workdir.mux_path(output);
        tracing::info!("Muxing into {}", muxed.display());
        if let Some(shortest) = shortest {
            tracing::info!("Streams differ in length, cutting to {shortest:?}.");
        }
        self.muxer.mux(video, audio, shortest, &muxed).await?;

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::rename(&muxed, output).await.is_err() {
            // rename fails across filesystems
            tokio::fs::copy(&muxed, output).await?;
            tokio::fs::remove_file(&muxed).await?;
        }

        let size = tokio::fs::metadata(output).await?.len();
        if size == 0 {
            return Err(TsumugiError::MuxError(format!(
                "{} is empty",
                output.display()
            )));
        }
        Ok(())
    }
}

fn header_map(headers: &HashMap<String, String>) -> TsumugiResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| TsumugiError::InvalidHeader(format!("{name}: {e}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| TsumugiError::InvalidHeader(format!("{name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

pub struct DownloadOrchestratorBuilder<M> {
    config: EngineConfig,
    muxer: M,
    interrupt: Interrupt,
    cdm: Option<Arc<dyn ContentDecryptionModule>>,
}

impl DownloadOrchestratorBuilder<AutoMuxer> {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            muxer: AutoMuxer::default(),
            interrupt: Interrupt::new(),
            cdm: None,
        }
    }
}

impl Default for DownloadOrchestratorBuilder<AutoMuxer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> DownloadOrchestratorBuilder<M> {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn cdm(mut self, cdm: Arc<dyn ContentDecryptionModule>) -> Self {
        self.cdm = Some(cdm);
        self
    }

    pub fn muxer<N>(self, muxer: N) -> DownloadOrchestratorBuilder<N> {
        DownloadOrchestratorBuilder {
            config: self.config,
            muxer,
            interrupt: self.interrupt,
            cdm: self.cdm,
        }
    }

    pub fn build(self) -> DownloadOrchestrator<M> {
        DownloadOrchestrator {
            config: self.config,
            muxer: self.muxer,
            interrupt: self.interrupt,
            cdm: self.cdm,
            state: Mutex::new(DownloadState::Init),
        }
    }
}

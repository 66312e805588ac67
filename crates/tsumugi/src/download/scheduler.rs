use std::{
    num::NonZeroU32,
    path::Path,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    fs::File,
    io::BufWriter,
    sync::{mpsc, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    retry::RetryPolicy,
    session::{DownloadSession, TaskState},
    writer::{
        spawn_writer, CloseMode, SegmentWriter, WriterMessage, WriterReport,
        DEFAULT_REORDER_WINDOW,
    },
    SegmentSource,
};
use crate::{
    decrypt::SegmentDecryptor,
    error::{TsumugiError, TsumugiResult},
    interrupt::Interrupt,
    model::{Representation, SegmentRef, StreamKind},
    progress::{format_bytes, ProgressHandle},
    util::range::ByteRange,
};

#[derive(Debug, Clone)]
pub struct SchedulerReport {
    pub kind: StreamKind,
    pub path: PathBuf,
    pub total: usize,
    pub succeeded: usize,
    /// The run was stopped before every segment was attempted. Only the
    /// contiguous prefix was written.
    pub interrupted: bool,
    pub writer: WriterReport,
}

pub struct SegmentScheduler<S> {
    source: Arc<S>,
    concurrency: NonZeroU32,
    retry: RetryPolicy,
    interrupt: Interrupt,
    halt: Option<CancellationToken>,
    window: usize,
    decryptor: Option<SegmentDecryptor>,
    progress: Option<ProgressHandle>,
}

impl<S> SegmentScheduler<S>
where
    S: SegmentSource,
{
    pub fn new(source: Arc<S>, interrupt: Interrupt) -> Self {
        Self {
            source,
            concurrency: NonZeroU32::MIN.saturating_add(4),
            retry: RetryPolicy::default(),
            interrupt,
            halt: None,
            window: DEFAULT_REORDER_WINDOW,
            decryptor: None,
            progress: None,
        }
    }

    /// Run level token shared with the other streams of a download. It is
    /// cancelled on a fatal error here, and cancelling it elsewhere halts
    /// this scheduler with [`TsumugiError::Halted`]. Defaults to a child of
    /// the interrupt.
    pub fn halt(mut self, token: CancellationToken) -> Self {
        self.halt = Some(token);
        self
    }

    /// Segments the writer may hold behind a failed segment before stepping
    /// over it without waiting for the next retry round.
    pub fn reorder_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    pub fn concurrency(mut self, concurrency: NonZeroU32) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Decrypt every segment before it is written.
    pub fn decryptor(mut self, decryptor: Option<SegmentDecryptor>) -> Self {
        self.decryptor = decryptor;
        self
    }

    pub fn progress(mut self, progress: ProgressHandle) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Download every segment of `representation` into `output`.
    ///
    /// Returns [`TsumugiError::AggregateFetchError`] when too many segments are
    /// still missing after all retry rounds. A decryption failure halts the
    /// run and is returned as is. Being stopped through the [`Interrupt`] is
    /// not an error, see [`SchedulerReport::interrupted`].
    pub async fn download(
        &self,
        session: Arc<DownloadSession>,
        representation: &Representation,
        output: &Path,
    ) -> TsumugiResult<SchedulerReport> {
        let kind = representation.kind;
        let total = representation.segments.len();
        tracing::info!(
            "Start downloading {total} {kind} segment(s) with {} thread(s).",
            self.concurrency.get()
        );

        let halt = self
            .halt
            .clone()
            .unwrap_or_else(|| self.interrupt.child_token());
        let (sender, receiver) = mpsc::channel(self.concurrency.get() as usize * 2);
        let worker = Arc::new(Worker {
            source: self.source.clone(),
            session: session.clone(),
            retry: self.retry,
            halt: halt.clone(),
            decryptor: self.decryptor.clone(),
            progress: self.progress.clone(),
            final_round: AtomicBool::new(self.retry.max_global_rounds == 0),
            sender,
        });

        let mut writer = SegmentWriter::new(BufWriter::new(File::create(output).await?))
            .window(self.window);
        if let Some(init) = &representation.init {
            let data = match worker.fetch(None, &init.url, init.byte_range).await {
                Ok(data) => data,
                Err(TsumugiError::Interrupted) if !self.interrupt.is_stopped() => {
                    return Err(TsumugiError::Halted)
                }
                Err(e) => {
                    if !e.is_interrupted() {
                        halt.cancel();
                    }
                    return Err(e);
                }
            };
            writer.write_init(&data).await?;
        }
        let writer = spawn_writer(writer, receiver, {
            let session = session.clone();
            let progress = self.progress.clone();
            move |index| give_up(&session, progress.as_ref(), index)
        });

        let permits = Arc::new(Semaphore::new(self.concurrency.get() as usize));
        let mut fatal = None;
        for round in 0..=self.retry.max_global_rounds {
            let pending = session.retryable();
            if pending.is_empty() || halt.is_cancelled() {
                break;
            }
            if round == self.retry.max_global_rounds {
                worker.final_round.store(true, Ordering::Relaxed);
            }
            if round > 0 {
                tracing::warn!(
                    "Retrying {} {kind} segment(s), round {round} / {}.",
                    pending.len(),
                    self.retry.max_global_rounds
                );
            }

            if let Err(e) = run_round(&worker, &permits, representation, pending).await {
                fatal = Some(e);
                break;
            }
        }

        // the writer exits once the last sender is gone
        drop(worker);
        let mut writer = writer.await??;

        if let Some(e) = fatal {
            writer.finish(CloseMode::ContiguousOnly, total).await?;
            return Err(e);
        }
        if halt.is_cancelled() && !self.interrupt.is_stopped() {
            tracing::warn!("{kind} download halted by a failure elsewhere in the run.");
            session.mark_interrupted();
            writer.finish(CloseMode::ContiguousOnly, total).await?;
            return Err(TsumugiError::Halted);
        }

        let interrupted = self.interrupt.is_stopped() && !session.unfinished().is_empty();
        let report = if interrupted {
            session.mark_interrupted();
            tracing::info!("{kind} download stopped, keeping the contiguous prefix.");
            writer.finish(CloseMode::ContiguousOnly, total).await?
        } else {
            writer.finish(CloseMode::SkipGaps, total).await?
        };

        let succeeded = session.succeeded();
        if !interrupted && !session.is_complete() {
            halt.cancel();
            let missing = session.unfinished();
            tracing::error!("Failed to download {} {kind} segment(s):", missing.len());
            for index in missing.iter() {
                tracing::error!("  - {index}");
            }
            return Err(TsumugiError::AggregateFetchError {
                succeeded,
                total,
                missing,
            });
        }

        Ok(SchedulerReport {
            kind,
            path: output.to_path_buf(),
            total,
            succeeded,
            interrupted,
            writer: report,
        })
    }
}

async fn run_round<S: SegmentSource>(
    worker: &Arc<Worker<S>>,
    permits: &Arc<Semaphore>,
    representation: &Representation,
    pending: Vec<usize>,
) -> TsumugiResult<()> {
    let mut tasks = JoinSet::new();
    for index in pending {
        let Some(segment) = representation.segments.get(index).cloned() else {
            continue;
        };

        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => permit,
            _ = worker.halt.cancelled() => break,
        };
        let Ok(permit) = permit else {
            break;
        };
        // stopped while waiting for a permit
        if worker.halt.is_cancelled() {
            break;
        }

        let worker = worker.clone();
        tasks.spawn(async move {
            let result = worker.run(segment).await;
            drop(permit);
            result
        });
    }

    let mut fatal = None;
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined? {
            fatal.get_or_insert(e);
        }
    }
    fatal.map_or(Ok(()), Err)
}

struct Worker<S> {
    source: Arc<S>,
    session: Arc<DownloadSession>,
    retry: RetryPolicy,
    halt: CancellationToken,
    decryptor: Option<SegmentDecryptor>,
    progress: Option<ProgressHandle>,
    /// No round follows the current one.
    final_round: AtomicBool,
    sender: mpsc::Sender<WriterMessage>,
}

/// Abandon a failed segment so the writer can step over it.
fn give_up(session: &DownloadSession, progress: Option<&ProgressHandle>, index: usize) -> bool {
    match session.give_up(index) {
        Some(newly) => {
            if newly {
                if let Some(progress) = progress {
                    progress.record_failure();
                }
            }
            true
        }
        None => false,
    }
}

impl<S> Worker<S>
where
    S: SegmentSource,
{
    /// Only decryption failures are returned, everything else is recorded in
    /// the session.
    async fn run(&self, segment: SegmentRef) -> TsumugiResult<()> {
        let index = segment.index;
        let data = match self
            .fetch(Some(index), &segment.url, segment.byte_range)
            .await
        {
            Ok(data) => data,
            Err(TsumugiError::Interrupted) => {
                self.session.set_state(index, TaskState::Pending);
                return Ok(());
            }
            Err(e) => {
                tracing::error!("Processing segment {index} failed, max retries exceed, drop. {e}");
                self.session.set_state(index, TaskState::Failed);
                if self.final_round.load(Ordering::Relaxed)
                    && give_up(&self.session, self.progress.as_ref(), index)
                {
                    // the writer is gone only after a fatal error, reported elsewhere
                    let _ = self.sender.send(WriterMessage::Skip(index)).await;
                }
                return Ok(());
            }
        };

        let data = match &self.decryptor {
            Some(decryptor) => match decryptor.decrypt(segment.sequence, &data) {
                Ok(data) => Bytes::from(data),
                Err(e) => {
                    tracing::error!("Failed to decrypt segment {index}: {e}");
                    self.session.set_state(index, TaskState::Failed);
                    self.halt.cancel();
                    return Err(e);
                }
            },
            None => data,
        };

        let size = data.len() as u64;
        if self
            .sender
            .send(WriterMessage::Segment(index, data))
            .await
            .is_err()
        {
            // writer failed, its error is reported when it is joined
            self.session.set_state(index, TaskState::Pending);
            self.halt.cancel();
            return Ok(());
        }

        self.session.set_state(index, TaskState::Succeeded);
        if let Some(progress) = &self.progress {
            progress.record_segment(size);
        }
        self.log_finished(index);
        Ok(())
    }

    /// Fetch with per-segment retries. `index` is `None` for the init segment.
    async fn fetch(
        &self,
        index: Option<usize>,
        url: &Url,
        range: Option<ByteRange>,
    ) -> TsumugiResult<Bytes> {
        let max_attempts = self.retry.max_attempts();
        let mut attempts = 0;
        loop {
            if let Some(index) = index {
                self.session.set_state(index, TaskState::InFlight);
            }

            let result = assert_send(self.source.fetch_bytes(url.clone(), range)).await;
            let error = match (result, index) {
                (Ok(data), _) if !data.is_empty() => return Ok(data),
                (Ok(_), Some(index)) => TsumugiError::EmptySegment(index),
                (Ok(_), None) => TsumugiError::InitSegmentError("empty payload".to_string()),
                (Err(e), _) => e,
            };

            attempts += 1;
            if attempts >= max_attempts {
                return Err(match index {
                    Some(index) => TsumugiError::SegmentFetchError {
                        index,
                        attempts,
                        reason: error.to_string(),
                    },
                    None => TsumugiError::InitSegmentError(format!(
                        "failed after {attempts} attempt(s): {error}"
                    )),
                });
            }
            if self.halt.is_cancelled() {
                return Err(TsumugiError::Interrupted);
            }

            let delay = self.retry.backoff(attempts - 1);
            if let Some(index) = index {
                self.session.record_retry(index);
            }
            tracing::warn!(
                "Processing {} failed, retry in {delay:?}. {error}",
                index.map_or_else(|| "init segment".to_string(), |i| format!("segment {i}"))
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.halt.cancelled() => return Err(TsumugiError::Interrupted),
            }
        }
    }

    fn log_finished(&self, index: usize) {
        let total = self.session.total();
        let done = self.session.succeeded() + self.session.failed();
        let percentage = if total == 0 {
            0.
        } else {
            done as f32 / total as f32 * 100.
        };

        let kind = self.session.kind();
        match self.progress.as_ref().map(ProgressHandle::snapshot) {
            Some(snapshot) if snapshot.speed > 0. => {
                let eta = snapshot
                    .eta(total.saturating_sub(done))
                    .unwrap_or(Duration::ZERO);
                tracing::info!(
                    "Processing {kind} segment {index} finished. ({done} / {total} or {percentage:.2}%) {}/s, ETA {}s",
                    format_bytes(snapshot.speed),
                    eta.as_secs()
                );
            }
            _ => tracing::info!(
                "Processing {kind} segment {index} finished. ({done} / {total} or {percentage:.2}%)"
            ),
        }
    }
}

// https://github.com/rust-lang/rust/issues/102211#issuecomment-1371414544
fn assert_send<'a, T>(
    fut: impl std::future::Future<Output = T> + Send + 'a,
) -> impl std::future::Future<Output = T> + Send + 'a {
    fut
}

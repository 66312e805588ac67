use bytes::Bytes;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};

use crate::{error::TsumugiResult, util::reorder::ReorderBuffer};

/// How the writer treats segments still missing when it is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Step over every missing index and write everything received.
    SkipGaps,
    /// Keep only the contiguous prefix, drop whatever waits behind a gap.
    ContiguousOnly,
}

/// Segments held behind a gap before the writer asks whether it may give up
/// on the gap.
pub const DEFAULT_REORDER_WINDOW: usize = 32;

/// What workers hand to the writer task.
#[derive(Debug)]
pub enum WriterMessage {
    Segment(usize, Bytes),
    /// The segment failed for good, step over it when the cursor gets there.
    Skip(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub written_segments: usize,
    pub written_bytes: u64,
    /// Indices stepped over, in the order they were given up on.
    pub skipped: Vec<usize>,
    /// Segments dropped because they were stuck behind a gap.
    pub discarded: usize,
}

/// Appends segments to a single output in index order.
pub struct SegmentWriter<W> {
    output: W,
    buffer: ReorderBuffer<Bytes>,
    window: usize,
    skipped: Vec<usize>,
    written_segments: usize,
    written_bytes: u64,
}

impl<W> SegmentWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(output: W) -> Self {
        Self {
            output,
            buffer: ReorderBuffer::new(),
            window: DEFAULT_REORDER_WINDOW,
            skipped: Vec::new(),
            written_segments: 0,
            written_bytes: 0,
        }
    }

    pub fn window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Writes the initialization segment. Must be called before any media segment.
    pub async fn write_init(&mut self, data: &[u8]) -> TsumugiResult<()> {
        self.output.write_all(data).await?;
        self.written_bytes += data.len() as u64;
        Ok(())
    }

    pub async fn push(&mut self, index: usize, data: Bytes) -> TsumugiResult<()> {
        let ready = self.buffer.push(index, data);
        self.write_ready(ready).await
    }

    /// Step over `index`, writing whatever was waiting behind it.
    pub async fn skip(&mut self, index: usize) -> TsumugiResult<()> {
        if index < self.buffer.expected() {
            return Ok(());
        }
        if !self.skipped.contains(&index) {
            self.skipped.push(index);
        }
        let ready = self.buffer.skip(index);
        self.write_ready(ready).await
    }

    /// The index holding back more than `window` segments, if any.
    pub fn blocked_on(&self) -> Option<usize> {
        (self.buffer.buffered() > self.window).then(|| self.buffer.expected())
    }

    pub fn buffered(&self) -> usize {
        self.buffer.buffered()
    }

    async fn write_ready(&mut self, ready: Vec<(usize, Bytes)>) -> TsumugiResult<()> {
        for (_, data) in ready {
            self.output.write_all(&data).await?;
            self.written_segments += 1;
            self.written_bytes += data.len() as u64;
        }
        Ok(())
    }

    pub fn expected(&self) -> usize {
        self.buffer.expected()
    }

    /// Flushes the output, handling the `total - expected` segments that never
    /// arrived according to `mode`.
    pub async fn finish(&mut self, mode: CloseMode, total: usize) -> TsumugiResult<WriterReport> {
        let mut discarded = 0;

        match mode {
            CloseMode::SkipGaps => {
                while self.buffer.expected() < total {
                    let index = self.buffer.expected();
                    self.skip(index).await?;
                }
            }
            CloseMode::ContiguousOnly => {
                discarded = self.buffer.discard();
            }
        }
        self.output.flush().await?;

        if !self.skipped.is_empty() {
            tracing::warn!("Skipped missing segments: {:?}", self.skipped);
        }
        if discarded > 0 {
            tracing::info!("Dropped {discarded} segment(s) waiting behind a gap.");
        }

        Ok(WriterReport {
            written_segments: self.written_segments,
            written_bytes: self.written_bytes,
            skipped: self.skipped.clone(),
            discarded,
        })
    }

    pub fn into_inner(self) -> W {
        self.output
    }
}

/// Runs `writer` on its own task until every sender of `rx` is dropped.
///
/// Whenever more than the writer's window is held behind a gap, `give_up` is
/// asked whether that index may be skipped. It must return `false` for a
/// segment that can still arrive.
pub fn spawn_writer<W, F>(
    mut writer: SegmentWriter<W>,
    mut rx: mpsc::Receiver<WriterMessage>,
    give_up: F,
) -> JoinHandle<TsumugiResult<SegmentWriter<W>>>
where
    W: AsyncWrite + Unpin + Send + 'static,
    F: Fn(usize) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                WriterMessage::Segment(index, data) => writer.push(index, data).await?,
                WriterMessage::Skip(index) => writer.skip(index).await?,
            }

            while let Some(index) = writer.blocked_on() {
                if !give_up(index) {
                    break;
                }
                tracing::warn!(
                    "Segment {index} is holding back {} segment(s), skipped.",
                    writer.buffered()
                );
                writer.skip(index).await?;
            }
        }
        Ok(writer)
    })
}

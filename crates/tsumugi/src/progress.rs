//! Background throughput estimation.
//!
//! A [`ProgressEstimator`] samples a shared [`ByteCounter`] at a fixed interval
//! and keeps a short moving window of samples. The resulting speed is only
//! used for display, it never influences what gets downloaded.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

/// Byte counter shared by every request of an engine instance.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    /// Time since the estimator started.
    pub elapsed: Duration,
    /// Cumulative bytes received.
    pub bytes: u64,
    /// Smoothed speed at this sample, bytes per second.
    pub speed: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressSnapshot {
    /// Smoothed download speed in bytes per second.
    pub speed: f64,
    /// Average size of the segments completed so far.
    pub average_size: u64,
    pub total_bytes: u64,
    pub segments: usize,
    /// Segments given up on after every retry.
    pub failed: usize,
}

impl ProgressSnapshot {
    /// Estimated size of `total_segments` segments.
    pub fn estimated_size(&self, total_segments: usize) -> u64 {
        self.average_size * total_segments as u64
    }

    pub fn eta(&self, remaining_segments: usize) -> Option<Duration> {
        if self.speed <= 0.0 || self.average_size == 0 {
            return None;
        }
        let remaining = self.average_size as f64 * remaining_segments as f64;
        Some(Duration::from_secs_f64(remaining / self.speed))
    }
}

#[derive(Debug)]
struct EstimatorState {
    window: usize,
    samples: VecDeque<ProgressSample>,
    segment_bytes: u64,
    segment_count: usize,
    failed_count: usize,
}

impl EstimatorState {
    fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
            samples: VecDeque::with_capacity(window),
            segment_bytes: 0,
            segment_count: 0,
            failed_count: 0,
        }
    }

    fn push(&mut self, elapsed: Duration, bytes: u64) -> ProgressSample {
        let speed = match self.samples.front() {
            Some(first) if elapsed > first.elapsed => {
                bytes.saturating_sub(first.bytes) as f64
                    / (elapsed - first.elapsed).as_secs_f64()
            }
            _ => 0.0,
        };
        let sample = ProgressSample {
            elapsed,
            bytes,
            speed,
        };

        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        sample
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let last = self.samples.back();
        ProgressSnapshot {
            speed: last.map(|s| s.speed).unwrap_or_default(),
            average_size: self
                .segment_bytes
                .checked_div(self.segment_count as u64)
                .unwrap_or_default(),
            total_bytes: last.map(|s| s.bytes).unwrap_or_default(),
            segments: self.segment_count,
            failed: self.failed_count,
        }
    }
}

fn lock(state: &Mutex<EstimatorState>) -> MutexGuard<'_, EstimatorState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read side of an estimator, cheap to clone into workers.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    state: Arc<Mutex<EstimatorState>>,
}

impl ProgressHandle {
    pub fn record_segment(&self, size: u64) {
        let mut state = lock(&self.state);
        state.segment_bytes += size;
        state.segment_count += 1;
    }

    pub fn record_failure(&self) {
        lock(&self.state).failed_count += 1;
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        lock(&self.state).snapshot()
    }
}

pub struct ProgressEstimator {
    counter: ByteCounter,
    interval: Duration,
    state: Arc<Mutex<EstimatorState>>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl ProgressEstimator {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1500);
    pub const DEFAULT_WINDOW: usize = 5;

    pub fn new(counter: ByteCounter, interval: Duration) -> Self {
        Self {
            counter,
            interval,
            state: Arc::new(Mutex::new(EstimatorState::new(Self::DEFAULT_WINDOW))),
            task: None,
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        ProgressHandle {
            state: self.state.clone(),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        lock(&self.state).snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Spawn the sampler. Calling this on a running estimator does nothing.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let counter = self.counter.clone();
        let state = self.state.clone();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let handle = tokio::spawn(async move {
            let started_at = Instant::now();
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let sample = lock(&state).push(started_at.elapsed(), counter.get());
                        tracing::trace!(bytes = sample.bytes, speed = sample.speed, "progress sample");
                    }
                }
            }
        });
        self.task = Some((token, handle));
    }

    /// Stop the sampler and wait for it to exit. In-flight downloads are not
    /// affected.
    pub async fn stop(&mut self) {
        if let Some((token, handle)) = self.task.take() {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("Progress sampler exited abnormally: {e}");
            }
        }
    }
}

impl Drop for ProgressEstimator {
    fn drop(&mut self) {
        if let Some((token, _)) = self.task.take() {
            token.cancel();
        }
    }
}

/// Human readable byte size, e.g. `1.50 MiB`.
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

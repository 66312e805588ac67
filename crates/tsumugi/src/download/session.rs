use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use url::Url;

use crate::model::{SegmentRef, StreamKind};

/// Share of segments that must succeed for a run to count as complete.
pub const COMPLETION_THRESHOLD: f64 = 0.999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub index: usize,
    pub url: Url,
    pub state: TaskState,
    pub retry_count: u32,
    /// The writer stepped over this segment, it is not retried any more.
    pub abandoned: bool,
}

/// Retry statistics reported at the end of every run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub max_retries: u32,
    pub total_retries: u32,
    pub failed: usize,
}

impl RetrySummary {
    pub fn merge(self, other: Self) -> Self {
        Self {
            max_retries: self.max_retries.max(other.max_retries),
            total_retries: self.total_retries + other.total_retries,
            failed: self.failed + other.failed,
        }
    }
}

impl fmt::Display for RetrySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "max retries {}, total retries {}, failed segments {}",
            self.max_retries, self.total_retries, self.failed
        )
    }
}

/// Bookkeeping for one stream of a run, shared by its workers.
#[derive(Debug)]
pub struct DownloadSession {
    kind: StreamKind,
    tasks: Mutex<Vec<DownloadTask>>,
    interrupted: AtomicBool,
}

impl DownloadSession {
    pub fn new(kind: StreamKind, segments: &[SegmentRef]) -> Self {
        let tasks = segments
            .iter()
            .map(|segment| DownloadTask {
                index: segment.index,
                url: segment.url.clone(),
                state: TaskState::Pending,
                retry_count: 0,
                abandoned: false,
            })
            .collect();

        Self {
            kind,
            tasks: Mutex::new(tasks),
            interrupted: AtomicBool::new(false),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<DownloadTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn total(&self) -> usize {
        self.tasks().len()
    }

    fn count(&self, state: TaskState) -> usize {
        self.tasks().iter().filter(|t| t.state == state).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(TaskState::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskState::Failed)
    }

    pub fn state(&self, index: usize) -> Option<TaskState> {
        self.tasks().get(index).map(|t| t.state)
    }

    /// Ignored once the task was abandoned.
    pub(crate) fn set_state(&self, index: usize, state: TaskState) {
        if let Some(task) = self.tasks().get_mut(index).filter(|t| !t.abandoned) {
            task.state = state;
        }
    }

    /// Abandon `index` if it has failed. `None` while it is pending or in
    /// flight, otherwise whether this call was the one abandoning it.
    pub(crate) fn give_up(&self, index: usize) -> Option<bool> {
        match self.tasks().get_mut(index) {
            Some(task) if task.state == TaskState::Failed => {
                let newly = !task.abandoned;
                task.abandoned = true;
                Some(newly)
            }
            _ => None,
        }
    }

    pub(crate) fn record_retry(&self, index: usize) {
        if let Some(task) = self.tasks().get_mut(index) {
            task.retry_count += 1;
        }
    }

    /// Indices that have not succeeded yet, ascending.
    pub fn unfinished(&self) -> Vec<usize> {
        self.tasks()
            .iter()
            .filter(|t| t.state != TaskState::Succeeded)
            .map(|t| t.index)
            .collect()
    }

    /// Unfinished indices worth another round.
    pub fn retryable(&self) -> Vec<usize> {
        self.tasks()
            .iter()
            .filter(|t| t.state != TaskState::Succeeded && !t.abandoned)
            .map(|t| t.index)
            .collect()
    }

    pub fn completion_ratio(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 1.0;
        }
        self.succeeded() as f64 / total as f64
    }

    pub fn is_complete(&self) -> bool {
        self.completion_ratio() >= COMPLETION_THRESHOLD
    }

    pub(crate) fn mark_interrupted(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> RetrySummary {
        let tasks = self.tasks();
        RetrySummary {
            max_retries: tasks.iter().map(|t| t.retry_count).max().unwrap_or_default(),
            total_retries: tasks.iter().map(|t| t.retry_count).sum(),
            failed: tasks
                .iter()
                .filter(|t| t.state == TaskState::Failed)
                .count(),
        }
    }
}

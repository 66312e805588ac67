//! Cooperative cancellation.
//!
//! The engine never kills work in flight. A first signal asks every stage to
//! stop issuing new work. Repeated signals in quick succession escalate to an
//! immediate stop, where the orchestrator abandons the run in place.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InterruptLevel {
    Running,
    Graceful,
    Immediate,
}

#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    graceful: CancellationToken,
    immediate: CancellationToken,
    signals: Arc<Mutex<VecDeque<Instant>>>,
}

impl Interrupt {
    /// Signals needed within [`Interrupt::IMMEDIATE_WINDOW`] to escalate.
    pub const IMMEDIATE_SIGNALS: usize = 3;
    pub const IMMEDIATE_WINDOW: Duration = Duration::from_secs(2);

    pub fn new() -> Self {
        Self::default()
    }

    /// Record one external cancel request (Ctrl-C, UI button, ...).
    pub fn signal(&self) -> InterruptLevel {
        let now = Instant::now();
        let recent = {
            let mut signals = self
                .signals
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            signals.push_back(now);
            while signals
                .front()
                .is_some_and(|t| now.duration_since(*t) > Self::IMMEDIATE_WINDOW)
            {
                signals.pop_front();
            }
            signals.len()
        };

        if recent >= Self::IMMEDIATE_SIGNALS {
            tracing::warn!("Interrupt received {recent} times, stopping immediately.");
            self.abort();
        } else {
            tracing::info!("Interrupt received, no new work will be started.");
            self.stop();
        }
        self.level()
    }

    /// Graceful stop: finish what is in flight, start nothing new.
    pub fn stop(&self) {
        self.graceful.cancel();
    }

    /// Immediate stop. Implies a graceful stop.
    pub fn abort(&self) {
        self.graceful.cancel();
        self.immediate.cancel();
    }

    pub fn level(&self) -> InterruptLevel {
        if self.immediate.is_cancelled() {
            InterruptLevel::Immediate
        } else if self.graceful.is_cancelled() {
            InterruptLevel::Graceful
        } else {
            InterruptLevel::Running
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.graceful.is_cancelled()
    }

    pub fn is_aborted(&self) -> bool {
        self.immediate.is_cancelled()
    }

    pub async fn stopped(&self) {
        self.graceful.cancelled().await
    }

    pub async fn aborted(&self) {
        self.immediate.cancelled().await
    }

    /// A token cancelled together with this interrupt, which can also be
    /// cancelled on its own without marking the run as interrupted.
    pub fn child_token(&self) -> CancellationToken {
        self.graceful.child_token()
    }
}

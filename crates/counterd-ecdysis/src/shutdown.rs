//! Drain controller.
//!
//! Stops accepting on every listener, then waits for in-flight requests to
//! finish within the grace period. Whatever is still open when the deadline
//! fires is force-closed.
//!
//! Uses [`InFlight`] for request accounting and the generation's connection
//! set for forced closes.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::LifecycleError;
use crate::generation::{Generation, GenerationState};

/// Exit status for a drain cut short by the grace deadline.
pub const FORCED_DRAIN_EXIT_CODE: i32 = 2;

/// Counts in-flight work. The final decrement to zero wakes drain waiters.
#[derive(Clone, Default)]
pub struct InFlight {
    inner: Arc<InFlightInner>,
}

#[derive(Default)]
struct InFlightInner {
    active: AtomicUsize,
    total: AtomicU64,
    idle: Notify,
}

/// Held for the duration of one request. Decrements the counter on drop.
#[must_use = "the request is only counted while the guard is alive"]
pub struct InFlightGuard {
    inner: Arc<InFlightInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let prev = self.inner.active.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request as started. Hold the guard until it completes.
    pub fn enter(&self) -> InFlightGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        self.inner.total.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Requests currently in flight.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Requests started since this generation began.
    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    /// Resolve once no request is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking, so a decrement in between is not missed.
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight request finished within the grace period.
    Completed,
    /// The grace period elapsed; `remaining` requests were cut off.
    TimedOut { remaining: usize },
    /// Immediate drain; `remaining` requests were abandoned without waiting.
    Abandoned { remaining: usize },
}

impl DrainOutcome {
    /// Process exit status for this outcome.
    ///
    /// Signal-driven drains exit 0, except when the grace deadline had to
    /// force connections closed.
    pub fn exit_code(&self) -> i32 {
        match self {
            DrainOutcome::Completed | DrainOutcome::Abandoned { .. } => 0,
            DrainOutcome::TimedOut { .. } => FORCED_DRAIN_EXIT_CODE,
        }
    }

    pub fn is_forced(&self) -> bool {
        !matches!(self, DrainOutcome::Completed)
    }
}

/// Coordinates the drain of one generation.
#[derive(Debug, Clone)]
pub struct DrainController {
    grace_period: Duration,
}

impl DrainController {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Stop accepting and drain `generation`.
    ///
    /// With `immediate`, every connection is closed at once and the generation
    /// goes straight from serving to exited. Otherwise the controller waits for
    /// the in-flight requests, then for the attached handlers to wind down, all
    /// within the grace period; the deadline is a hard bound.
    pub async fn begin_drain(
        &self,
        generation: &Generation,
        immediate: bool,
    ) -> Result<DrainOutcome, LifecycleError> {
        self.begin_drain_until(generation, immediate, std::future::pending())
            .await
    }

    /// Like [`begin_drain`](Self::begin_drain), but a graceful drain turns
    /// immediate as soon as `escalate` resolves: open connections are closed
    /// and the outcome is [`DrainOutcome::Abandoned`].
    pub async fn begin_drain_until<F>(
        &self,
        generation: &Generation,
        immediate: bool,
        escalate: F,
    ) -> Result<DrainOutcome, LifecycleError>
    where
        F: Future<Output = ()>,
    {
        if immediate {
            generation.stop_accepting();
            let remaining = generation.active_requests();
            let closed = generation.force_close();
            generation.transition(GenerationState::Exited)?;
            warn!(
                generation = generation.number(),
                remaining_requests = remaining,
                closed_connections = closed,
                "Immediate shutdown, abandoning in-flight requests"
            );
            return Ok(DrainOutcome::Abandoned { remaining });
        }

        generation.transition(GenerationState::Draining)?;
        generation.stop_accepting();

        let deadline = Instant::now() + self.grace_period;
        let requests = generation.requests();
        let active = requests.active();
        info!(
            generation = generation.number(),
            active_requests = active,
            grace_period_ms = self.grace_period.as_millis() as u64,
            "Draining in-flight requests"
        );

        let tasks = generation.tasks();
        tasks.close();
        let drained = tokio::time::timeout_at(deadline, async {
            requests.wait_idle().await;
            tasks.wait().await;
        });

        let completed = tokio::select! {
            drained = drained => drained.is_ok(),
            () = escalate => {
                let remaining = requests.active();
                let closed = generation.force_close();
                warn!(
                    generation = generation.number(),
                    remaining_requests = remaining,
                    closed_connections = closed,
                    "Drain escalated to immediate shutdown, abandoning in-flight requests"
                );
                generation.transition(GenerationState::Exited)?;
                return Ok(DrainOutcome::Abandoned { remaining });
            }
        };

        let outcome = if completed {
            info!(generation = generation.number(), "All requests drained cleanly");
            DrainOutcome::Completed
        } else {
            let remaining = requests.active();
            let closed = generation.force_close();
            warn!(
                generation = generation.number(),
                remaining_requests = remaining,
                closed_connections = closed,
                grace_period_ms = self.grace_period.as_millis() as u64,
                "Drain timeout expired, force-closing connections"
            );
            DrainOutcome::TimedOut { remaining }
        };

        generation.transition(GenerationState::Exited)?;
        Ok(outcome)
    }
}

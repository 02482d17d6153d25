//! Lifecycle supervisor.
//!
//! The one task that acts on lifecycle events for a generation. It runs
//! handoffs and drains; signal handlers only feed it events.
//!
//! While a handoff is pending, a second restart is ignored, a shutdown is
//! deferred until the handoff settles, and a terminate aborts the handoff and
//! drains immediately. During a graceful drain, a terminate still cuts it
//! short.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LifecycleConfig;
use crate::envelope::HandoffEnvelope;
use crate::error::{HandoffError, LifecycleError};
use crate::generation::{Generation, GenerationState};
use crate::restart::{ExecTransport, HandoffTransport, Successor};
use crate::shutdown::{DrainController, DrainOutcome};
use crate::signals::{LifecycleEvent, SignalCoordinator, EVENT_CAPACITY};

/// Drives one generation from serving to exit.
pub struct Supervisor<T> {
    generation: Arc<Generation>,
    transport: T,
    drain: DrainController,
    startup_timeout: Duration,
    events: mpsc::Receiver<LifecycleEvent>,
}

/// What happened while a handoff was pending.
struct HandoffAttempt {
    result: Result<Successor, HandoffError>,
    /// Shutdown or terminate received meanwhile.
    deferred: Option<LifecycleEvent>,
}

impl<T: HandoffTransport> Supervisor<T> {
    pub fn new(
        generation: Arc<Generation>,
        transport: T,
        config: &LifecycleConfig,
        events: mpsc::Receiver<LifecycleEvent>,
    ) -> Self {
        Self {
            generation,
            transport,
            drain: DrainController::new(config.grace_period),
            startup_timeout: config.startup_timeout,
            events,
        }
    }

    /// Process events until the generation has drained.
    ///
    /// A closed event channel counts as a graceful shutdown. A failed handoff
    /// is logged and the generation keeps serving.
    pub async fn run(mut self) -> Result<DrainOutcome, LifecycleError> {
        loop {
            let event = match self.events.recv().await {
                Some(event) => event,
                None => {
                    info!("Lifecycle event channel closed, shutting down");
                    LifecycleEvent::Shutdown
                }
            };

            match event {
                LifecycleEvent::Shutdown => return self.drain(false).await,
                LifecycleEvent::Terminate => return self.drain(true).await,
                LifecycleEvent::Restart => {}
            }

            let attempt = self.begin_handoff().await;
            match (attempt.result, attempt.deferred) {
                (Ok(successor), deferred) => {
                    info!(
                        generation = self.generation.number(),
                        successor_pid = successor.pid(),
                        "Successor ready, draining this generation"
                    );
                    let immediate = deferred == Some(LifecycleEvent::Terminate);
                    return self.drain(immediate).await;
                }
                (Err(e), deferred) => {
                    let err = LifecycleError::from(e);
                    match &err {
                        LifecycleError::HandoffFailed(HandoffError::Aborted { .. }) => {
                            info!(error = %err, "Handoff aborted")
                        }
                        _ => error!(
                            generation = self.generation.number(),
                            error = %err,
                            "Restart failed, continuing to serve"
                        ),
                    }
                    match deferred {
                        Some(LifecycleEvent::Terminate) => return self.drain(true).await,
                        Some(LifecycleEvent::Shutdown) => return self.drain(false).await,
                        _ => {}
                    }
                }
            }
        }
    }

    /// Drain this generation. A terminate event arriving during a graceful
    /// drain turns it immediate; anything else is ignored.
    async fn drain(&mut self, immediate: bool) -> Result<DrainOutcome, LifecycleError> {
        let events = &mut self.events;
        let escalate = async move {
            while let Some(event) = events.recv().await {
                match event {
                    LifecycleEvent::Terminate => {
                        warn!("Terminate requested during drain, closing remaining connections");
                        return;
                    }
                    event => debug!(%event, "Already draining, ignoring lifecycle event"),
                }
            }
            std::future::pending::<()>().await
        };
        self.drain
            .begin_drain_until(&self.generation, immediate, escalate)
            .await
    }

    /// Spawn a successor and wait for it, watching for events meanwhile.
    async fn begin_handoff(&mut self) -> HandoffAttempt {
        let envelope = match self.prepare() {
            Ok(envelope) => envelope,
            Err(e) => {
                return HandoffAttempt {
                    result: Err(e),
                    deferred: None,
                }
            }
        };

        info!(
            generation = self.generation.number(),
            successor_generation = envelope.generation(),
            listeners = envelope.len(),
            "Starting handoff"
        );

        let abort = CancellationToken::new();
        let spawn = self
            .transport
            .spawn_successor(envelope, self.startup_timeout, abort.clone());
        tokio::pin!(spawn);

        let mut deferred = None;
        let mut events_open = true;
        let result = loop {
            tokio::select! {
                result = &mut spawn => break result,
                event = self.events.recv(), if events_open => match event {
                    Some(LifecycleEvent::Restart) => {
                        warn!("Restart already in progress, ignoring restart request");
                    }
                    Some(LifecycleEvent::Shutdown) | None => {
                        if event.is_none() {
                            events_open = false;
                        }
                        if deferred.is_none() {
                            info!("Shutdown requested during handoff, deferring until it settles");
                            deferred = Some(LifecycleEvent::Shutdown);
                        }
                    }
                    Some(LifecycleEvent::Terminate) => {
                        warn!("Terminate requested during handoff, aborting successor");
                        deferred = Some(LifecycleEvent::Terminate);
                        abort.cancel();
                    }
                },
            }
        };

        HandoffAttempt { result, deferred }
    }

    /// Check preconditions and snapshot the listeners. Nothing is touched if
    /// this fails.
    fn prepare(&self) -> Result<HandoffEnvelope, HandoffError> {
        let state = self.generation.state();
        if state != GenerationState::Serving {
            return Err(HandoffError::NotServing(state));
        }
        self.transport.preflight()?;

        let envelope = HandoffEnvelope::snapshot(
            self.generation.registry(),
            self.generation.number() + 1,
        )
        .map_err(HandoffError::Prepare)?;
        if envelope.is_empty() {
            return Err(HandoffError::NoListeners);
        }
        Ok(envelope)
    }
}

/// Serve `generation` until a signal ends it, restarting by re-executing the
/// program this process was started as.
///
/// Signal handlers are installed first; a generation still starting is then
/// marked ready, which releases a waiting predecessor. Returns how the final
/// drain went; map it to an exit status with [`DrainOutcome::exit_code`].
pub async fn run(
    generation: Arc<Generation>,
    config: LifecycleConfig,
) -> Result<DrainOutcome, LifecycleError> {
    config.validate()?;

    let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
    let cancel = CancellationToken::new();
    let signals = SignalCoordinator::spawn(config.signals, tx, cancel.clone())?;

    if generation.state() == GenerationState::Starting {
        if let Err(e) = generation.mark_ready() {
            cancel.cancel();
            return Err(e);
        }
    }

    let supervisor = Supervisor::new(generation, ExecTransport::current_program(), &config, rx);
    let outcome = supervisor.run().await;

    cancel.cancel();
    if let Err(e) = signals.await {
        warn!(error = %e, "Signal coordinator task failed");
    }
    outcome
}

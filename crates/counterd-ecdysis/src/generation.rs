//! The server generation: one running instance of the service.
//!
//! A [`Generation`] is the single owned lifecycle object. It holds the listener
//! registry, the in-flight request counter, the open connection set and the
//! lifecycle state, and is handed explicitly to everything that needs them.

use std::fmt;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::envelope::{self, Inherited};
use crate::error::LifecycleError;
use crate::listener::{Listener, ListenerRegistry};
use crate::restart;
use crate::serve::{ConnectionSet, Handler, Incoming};
use crate::shutdown::InFlight;

/// Lifecycle state of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationState {
    Starting,
    Serving,
    Draining,
    Exited,
    Failed,
}

impl GenerationState {
    /// Whether `self -> next` is an allowed transition.
    ///
    /// `Serving -> Exited` is the only skip, used by immediate drains.
    pub fn can_transition_to(self, next: GenerationState) -> bool {
        use GenerationState::*;
        matches!(
            (self, next),
            (Starting, Serving)
                | (Starting, Failed)
                | (Serving, Draining)
                | (Serving, Exited)
                | (Serving, Failed)
                | (Draining, Exited)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, GenerationState::Exited | GenerationState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GenerationState::Starting => "starting",
            GenerationState::Serving => "serving",
            GenerationState::Draining => "draining",
            GenerationState::Exited => "exited",
            GenerationState::Failed => "failed",
        }
    }
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One running instance of the service, between a start and an exit.
pub struct Generation {
    number: u64,
    pid: u32,
    state: watch::Sender<GenerationState>,
    registry: ListenerRegistry,
    requests: InFlight,
    connections: ConnectionSet,
    tasks: TaskTracker,
    ready_fd: Mutex<Option<OwnedFd>>,
}

impl Generation {
    /// Cold start: generation 0, nothing inherited.
    pub fn new() -> Self {
        Self::build(0, ListenerRegistry::default(), None)
    }

    /// Start a generation, inheriting listeners from a predecessor when the
    /// handoff environment is present.
    ///
    /// Fails with [`LifecycleError::DescriptorInheritance`] if the environment
    /// announces descriptors that cannot be adopted. A half-inherited state is a
    /// bug in the predecessor; the successor must not come up.
    ///
    /// Call this from `main` before building the tokio runtime: it removes the
    /// handoff variables from the process environment.
    pub fn from_env() -> Result<Self, LifecycleError> {
        match envelope::inherit_from_env()? {
            Some(inherited) => {
                info!(
                    generation = inherited.generation,
                    listeners = inherited.listeners.len(),
                    "Inherited listeners from parent process"
                );
                Ok(Self::from_inherited(inherited))
            }
            None => Ok(Self::new()),
        }
    }

    pub(crate) fn from_inherited(inherited: Inherited) -> Self {
        let Inherited {
            generation,
            listeners,
            ready_fd,
        } = inherited;
        Self::build(
            generation,
            ListenerRegistry::with_inherited(listeners),
            ready_fd,
        )
    }

    fn build(number: u64, registry: ListenerRegistry, ready_fd: Option<OwnedFd>) -> Self {
        let (state, _) = watch::channel(GenerationState::Starting);
        Self {
            number,
            pid: std::process::id(),
            state,
            registry,
            requests: InFlight::new(),
            connections: ConnectionSet::new(),
            tasks: TaskTracker::new(),
            ready_fd: Mutex::new(ready_fd),
        }
    }

    /// Logical generation number, monotonically increasing across restarts.
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether this generation was started by a predecessor's handoff.
    pub fn is_successor(&self) -> bool {
        self.number > 0
    }

    pub fn state(&self) -> GenerationState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<GenerationState> {
        self.state.subscribe()
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// The in-flight request counter. Handlers call [`InFlight::enter`] when a
    /// request begins and drop the guard when it completes.
    pub fn requests(&self) -> &InFlight {
        &self.requests
    }

    pub fn active_requests(&self) -> usize {
        self.requests.active()
    }

    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Open (or adopt) a listening socket for `addr`.
    pub fn listen(&self, addr: SocketAddr) -> Result<Listener, LifecycleError> {
        self.registry.register(addr)
    }

    /// Open listeners, ordered by address.
    pub fn listeners(&self) -> Vec<Listener> {
        self.registry.all()
    }

    /// Bind `handler` to `listener`. The handler receives accepted connections
    /// until the listener is closed.
    pub fn attach<H: Handler>(
        &self,
        listener: &Listener,
        handler: Arc<H>,
    ) -> Result<(), LifecycleError> {
        let incoming = Incoming::new(listener, self.connections.clone())?;
        let addr = listener.local_addr();
        debug!(%addr, "Attaching handler");

        self.tasks.spawn(async move {
            match handler.serve(incoming).await {
                Ok(()) => debug!(%addr, "Handler stopped"),
                Err(e) => error!(%addr, error = %e, "Handler stopped with error"),
            }
        });
        Ok(())
    }

    /// Move to `Serving` and tell the predecessor, if any, that we are ready.
    ///
    /// Call once every listener has been registered and attached. Inherited
    /// descriptors the configuration never asked for are closed here.
    pub fn mark_ready(&self) -> Result<(), LifecycleError> {
        for addr in self.registry.release_unclaimed() {
            warn!(%addr, "Closing inherited listener not claimed by this configuration");
        }

        self.transition(GenerationState::Serving)?;

        let ready_fd = self
            .ready_fd
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(fd) = ready_fd {
            // The predecessor may already have given up on us; keep serving anyway.
            match restart::notify_ready(fd) {
                Ok(()) => debug!("Signalled readiness to parent process"),
                Err(e) => warn!(error = %e, "Failed to signal readiness to parent process"),
            }
        }

        info!(
            generation = self.number,
            pid = self.pid,
            listeners = self.registry.len(),
            "Generation serving"
        );
        Ok(())
    }

    /// Record an unrecoverable error.
    pub fn fail(&self, reason: &str) {
        let from = self.state();
        match self.transition(GenerationState::Failed) {
            Ok(()) => error!(generation = self.number, %from, reason, "Generation failed"),
            Err(e) => warn!(error = %e, reason, "Ignoring failure report"),
        }
    }

    /// Apply a lifecycle transition, rejecting anything the state machine forbids.
    pub fn transition(&self, to: GenerationState) -> Result<(), LifecycleError> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if current.can_transition_to(to) {
                debug!(generation = self.number, from = %current, %to, "Lifecycle transition");
                *current = to;
                true
            } else {
                result = Err(LifecycleError::InvalidTransition { from: *current, to });
                false
            }
        });
        result
    }

    /// Close every listener. Returns how many were open.
    pub(crate) fn stop_accepting(&self) -> usize {
        self.registry.close_all()
    }

    /// Forcibly close every tracked connection. Returns how many were open.
    pub(crate) fn force_close(&self) -> usize {
        self.connections.force_close_all()
    }

    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("number", &self.number)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("listeners", &self.registry.len())
            .field("active_requests", &self.requests.active())
            .finish()
    }
}

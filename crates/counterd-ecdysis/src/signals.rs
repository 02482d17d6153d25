//! Signal coordinator.
//!
//! Turns process signals into [`LifecycleEvent`]s. The handler side does
//! nothing but forward: all lifecycle work happens on the task that consumes
//! the channel.

use std::fmt;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::LifecycleError;

/// Capacity of the lifecycle event channel.
pub const EVENT_CAPACITY: usize = 16;

/// Lifecycle request delivered to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Hand off to a successor, then drain and exit.
    Restart,
    /// Drain gracefully and exit.
    Shutdown,
    /// Close everything and exit now.
    Terminate,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleEvent::Restart => "restart",
            LifecycleEvent::Shutdown => "shutdown",
            LifecycleEvent::Terminate => "terminate",
        })
    }
}

/// Which signal maps to which lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalBindings {
    pub restart: i32,
    pub shutdown: i32,
    pub terminate: i32,
}

impl Default for SignalBindings {
    fn default() -> Self {
        Self {
            restart: libc::SIGUSR2,
            shutdown: libc::SIGTERM,
            terminate: libc::SIGINT,
        }
    }
}

impl SignalBindings {
    /// Reject bindings that map one signal to two events, or that use a
    /// signal a process cannot catch.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        let bound = [self.restart, self.shutdown, self.terminate];
        for signo in bound {
            if matches!(signo, libc::SIGKILL | libc::SIGSTOP) || signo <= 0 {
                return Err(LifecycleError::Config(format!(
                    "signal {} cannot be handled",
                    signal_name(signo)
                )));
            }
        }
        if bound[0] == bound[1] || bound[0] == bound[2] || bound[1] == bound[2] {
            return Err(LifecycleError::Config(format!(
                "restart ({}), shutdown ({}) and terminate ({}) must use distinct signals",
                signal_name(self.restart),
                signal_name(self.shutdown),
                signal_name(self.terminate)
            )));
        }
        Ok(())
    }

    fn event_for(&self, signo: i32) -> Option<LifecycleEvent> {
        if signo == self.restart {
            Some(LifecycleEvent::Restart)
        } else if signo == self.shutdown {
            Some(LifecycleEvent::Shutdown)
        } else if signo == self.terminate {
            Some(LifecycleEvent::Terminate)
        } else {
            None
        }
    }
}

const SIGNAL_NAMES: &[(&str, i32)] = &[
    ("HUP", libc::SIGHUP),
    ("INT", libc::SIGINT),
    ("QUIT", libc::SIGQUIT),
    ("TERM", libc::SIGTERM),
    ("USR1", libc::SIGUSR1),
    ("USR2", libc::SIGUSR2),
    ("WINCH", libc::SIGWINCH),
];

/// Parse a signal given as `SIGUSR2`, `USR2`, `usr2` or a number.
pub fn parse_signal(raw: &str) -> Result<i32, LifecycleError> {
    let trimmed = raw.trim();
    if let Ok(signo) = trimmed.parse::<i32>() {
        return Ok(signo);
    }

    let upper = trimmed.to_ascii_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);
    SIGNAL_NAMES
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, signo)| *signo)
        .ok_or_else(|| LifecycleError::Config(format!("unknown signal {raw:?}")))
}

/// Human-readable name of a signal number, for logs and errors.
pub fn signal_name(signo: i32) -> String {
    SIGNAL_NAMES
        .iter()
        .find(|(_, candidate)| *candidate == signo)
        .map(|(name, _)| format!("SIG{name}"))
        .unwrap_or_else(|| signo.to_string())
}

/// Forwards bound signals to the lifecycle event channel.
pub struct SignalCoordinator;

impl SignalCoordinator {
    /// Install handlers for `bindings` and forward every delivery to `events`.
    ///
    /// Handlers are installed before this returns, so a signal sent right
    /// after is not lost. The forwarding task stops when `cancel` fires or
    /// the receiver is dropped.
    pub fn spawn(
        bindings: SignalBindings,
        events: mpsc::Sender<LifecycleEvent>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, LifecycleError> {
        bindings.validate()?;

        let install = |signo: i32| {
            signal(SignalKind::from_raw(signo))
                .map_err(|source| LifecycleError::Signal { signal: signo, source })
        };
        let mut restart = install(bindings.restart)?;
        let mut shutdown = install(bindings.shutdown)?;
        let mut terminate = install(bindings.terminate)?;

        info!(
            restart = %signal_name(bindings.restart),
            shutdown = %signal_name(bindings.shutdown),
            terminate = %signal_name(bindings.terminate),
            "Installed lifecycle signal handlers"
        );

        Ok(tokio::spawn(async move {
            loop {
                let signo = tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(()) = restart.recv() => bindings.restart,
                    Some(()) = shutdown.recv() => bindings.shutdown,
                    Some(()) = terminate.recv() => bindings.terminate,
                    else => break,
                };

                let Some(event) = bindings.event_for(signo) else {
                    continue;
                };
                info!(signal = %signal_name(signo), %event, "Received lifecycle signal");
                if events.send(event).await.is_err() {
                    debug!("Lifecycle event receiver dropped, signal forwarding stopped");
                    break;
                }
            }
        }))
    }
}

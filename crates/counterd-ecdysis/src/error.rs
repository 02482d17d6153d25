//! Error taxonomy for the restart lifecycle.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

use crate::generation::GenerationState;

/// Errors surfaced by the lifecycle core.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Address in use or permission denied. Fatal at startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The successor never confirmed readiness. The current generation keeps serving.
    #[error("handoff failed: {0}")]
    HandoffFailed(#[from] HandoffError),

    /// The successor could not rebuild a listener from an inherited descriptor.
    #[error("descriptor inheritance failed: {0}")]
    DescriptorInheritance(#[from] DescriptorInheritanceError),

    /// A state change the generation lifecycle does not allow.
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        from: GenerationState,
        to: GenerationState,
    },

    /// Registering a signal handler failed.
    #[error("failed to register handler for signal {signal}: {source}")]
    Signal {
        signal: i32,
        #[source]
        source: io::Error,
    },

    /// Invalid lifecycle configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reasons a handoff to a successor did not complete.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("executable {path} is unavailable: {source}")]
    ExecutableUnavailable {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("working directory is unavailable: {0}")]
    WorkingDirectoryUnavailable(#[source] io::Error),

    #[error("generation is {0}, only a serving generation can hand off")]
    NotServing(GenerationState),

    #[error("no open listeners to hand off")]
    NoListeners,

    #[error("failed to prepare handoff: {0}")]
    Prepare(#[source] io::Error),

    #[error("failed to spawn successor: {0}")]
    Spawn(#[source] io::Error),

    #[error("successor {pid} exited before signalling readiness ({status:?})")]
    SuccessorExited {
        pid: u32,
        status: Option<ExitStatus>,
    },

    #[error("successor {pid} did not signal readiness within {timeout:?}")]
    Timeout { pid: u32, timeout: Duration },

    #[error("handoff to successor {pid} was aborted")]
    Aborted { pid: u32 },

    #[error("readiness channel failed: {0}")]
    Readiness(#[source] io::Error),
}

impl HandoffError {
    /// Process id of the successor involved, when one was spawned.
    pub fn successor_pid(&self) -> Option<u32> {
        match self {
            HandoffError::SuccessorExited { pid, .. }
            | HandoffError::Timeout { pid, .. }
            | HandoffError::Aborted { pid } => Some(*pid),
            _ => None,
        }
    }
}

/// Failures while rebuilding listeners from descriptors passed by a predecessor.
#[derive(Debug, Error)]
pub enum DescriptorInheritanceError {
    #[error("{var} has invalid value {value:?}")]
    InvalidValue { var: &'static str, value: String },

    #[error("LISTEN_FDS is set but LISTEN_FD_NAMES is missing")]
    MissingNames,

    #[error("LISTEN_FD_NAMES has {names} entries but LISTEN_FDS says {fds}")]
    CountMismatch { names: usize, fds: usize },

    #[error("inherited name {name:?} is not a socket address")]
    InvalidName { name: String },

    #[error("inherited fd {fd} ({name}) is not a valid socket")]
    NotASocket { fd: RawFd, name: String },

    #[error("inherited fd {fd} ({name}) is bound to {actual}, expected {name}")]
    AddressMismatch {
        fd: RawFd,
        name: String,
        actual: SocketAddr,
    },

    #[error("inherited fd {fd} is not usable: {source}")]
    Adopt {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
}

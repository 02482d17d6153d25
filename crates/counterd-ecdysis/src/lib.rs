//! # counterd-ecdysis
//!
//! Zero-downtime restart support for counterd, implementing the
//! [Cloudflare Ecdysis pattern](https://blog.cloudflare.com/ecdysis-rust-graceful-restarts/).
//!
//! ## Overview
//!
//! A running [`Generation`] owns its listening sockets, its in-flight request
//! counter and its lifecycle state. On a restart signal:
//! 1. The open listeners are snapshotted into a [`HandoffEnvelope`]
//! 2. A successor process is spawned with those descriptors inherited
//! 3. The successor adopts the descriptors (no `bind`/`listen`) and writes a
//!    readiness byte to a pipe inherited from the parent
//! 4. The parent stops accepting, drains in-flight requests within the grace
//!    period, and exits
//!
//! If the successor never becomes ready, it is killed and reaped and the parent
//! keeps serving. A shutdown signal skips steps 1-3.
//!
//! ## Signal Conventions (defaults, configurable)
//!
//! - `SIGUSR2`: restart (handoff to a successor, then drain and exit)
//! - `SIGTERM`: graceful shutdown (drain, then exit)
//! - `SIGINT`: immediate shutdown (close everything, exit)
//!
//! ## Environment Variables
//!
//! - `LISTEN_FDS`: Number of inherited listener descriptors (starting at fd 3)
//! - `LISTEN_FD_NAMES`: Colon-separated addresses, one per inherited descriptor
//! - `COUNTERD_GENERATION`: Generation number of the successor
//! - `COUNTERD_READY_FD`: Descriptor the successor writes its readiness byte to
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("counterd-ecdysis requires a Unix platform (Linux or macOS)");

mod config;
mod envelope;
mod error;
mod generation;
mod listener;
mod restart;
mod serve;
mod shutdown;
mod signals;
mod supervisor;

pub use config::{parse_secs, LifecycleConfig, DEFAULT_GRACE_PERIOD, DEFAULT_STARTUP_TIMEOUT};
pub use envelope::{
    HandoffEnvelope, GENERATION_VAR, LISTEN_FDS, LISTEN_FDS_START, LISTEN_FD_NAMES, READY_FD_VAR,
};
pub use error::{DescriptorInheritanceError, HandoffError, LifecycleError};
pub use generation::{Generation, GenerationState};
pub use listener::{Listener, ListenerRegistry};
pub use restart::{ExecTransport, HandoffTransport, Successor};
pub use serve::{Handler, Incoming, TrackedStream};
pub use shutdown::{
    DrainController, DrainOutcome, InFlight, InFlightGuard, FORCED_DRAIN_EXIT_CODE,
};
pub use signals::{parse_signal, signal_name, LifecycleEvent, SignalBindings, SignalCoordinator};
pub use supervisor::{run, Supervisor};

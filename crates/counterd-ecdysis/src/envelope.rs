//! Handoff envelope: what a parent passes to its successor at exec time.
//!
//! The contract is compatible with systemd socket activation. Listener
//! descriptors start at fd 3, `LISTEN_FDS` holds their count and
//! `LISTEN_FD_NAMES` their addresses. Two extra variables carry the
//! successor's generation number and the readiness pipe descriptor.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::info;

use crate::error::DescriptorInheritanceError;
use crate::listener::ListenerRegistry;

pub const LISTEN_FDS: &str = "LISTEN_FDS";
pub const LISTEN_FD_NAMES: &str = "LISTEN_FD_NAMES";
pub const GENERATION_VAR: &str = "COUNTERD_GENERATION";
pub const READY_FD_VAR: &str = "COUNTERD_READY_FD";

/// First inherited descriptor number (`SD_LISTEN_FDS_START`).
pub const LISTEN_FDS_START: RawFd = 3;

/// Snapshot of the listeners being handed to a successor.
///
/// Holds its own duplicates of the listener descriptors, so it stays valid if
/// a listener is closed while the successor is being spawned.
#[derive(Debug)]
pub struct HandoffEnvelope {
    generation: u64,
    entries: Vec<(SocketAddr, OwnedFd)>,
}

impl HandoffEnvelope {
    /// Capture every open listener in `registry`, in address order.
    pub fn snapshot(registry: &ListenerRegistry, generation: u64) -> std::io::Result<Self> {
        let entries = registry
            .all()
            .into_iter()
            .map(|listener| Ok((listener.local_addr(), listener.duplicate()?)))
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self {
            generation,
            entries,
        })
    }

    /// Generation number the successor will run as.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.entries.iter().map(|(addr, _)| *addr).collect()
    }

    /// Descriptors in the parent, in the order they must land in the child.
    pub fn source_fds(&self) -> Vec<RawFd> {
        self.entries.iter().map(|(_, fd)| fd.as_raw_fd()).collect()
    }

    /// Descriptor number the readiness pipe lands on in the child.
    pub fn ready_fd(&self) -> RawFd {
        LISTEN_FDS_START + self.entries.len() as RawFd
    }

    /// Environment the successor needs to find its descriptors.
    pub fn env(&self) -> Vec<(&'static str, String)> {
        let names: Vec<String> = self
            .entries
            .iter()
            .map(|(addr, _)| addr.to_string())
            .collect();
        vec![
            (LISTEN_FDS, self.entries.len().to_string()),
            (LISTEN_FD_NAMES, names.join(":")),
            (GENERATION_VAR, self.generation.to_string()),
            (READY_FD_VAR, self.ready_fd().to_string()),
        ]
    }
}

/// What a successor reconstructs from the handoff environment.
#[derive(Debug)]
pub(crate) struct Inherited {
    pub(crate) generation: u64,
    pub(crate) listeners: BTreeMap<SocketAddr, std::net::TcpListener>,
    pub(crate) ready_fd: Option<OwnedFd>,
}

/// Decoded handoff variables, before any descriptor is touched.
#[derive(Debug, PartialEq, Eq)]
struct EnvelopeVars {
    generation: u64,
    listeners: Vec<(RawFd, SocketAddr)>,
    ready_fd: Option<RawFd>,
}

/// Parse the handoff variables. Returns `None` on a cold start.
fn parse_vars<F>(var: F) -> Result<Option<EnvelopeVars>, DescriptorInheritanceError>
where
    F: Fn(&'static str) -> Option<String>,
{
    let count: usize = match var(LISTEN_FDS) {
        None => return Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| DescriptorInheritanceError::InvalidValue {
                var: LISTEN_FDS,
                value: raw,
            })?,
    };
    if count == 0 {
        return Ok(None);
    }

    let names_raw = var(LISTEN_FD_NAMES).ok_or(DescriptorInheritanceError::MissingNames)?;
    let addrs = parse_names(&names_raw)?;
    if addrs.len() != count {
        return Err(DescriptorInheritanceError::CountMismatch {
            names: addrs.len(),
            fds: count,
        });
    }

    let listeners = addrs
        .into_iter()
        .enumerate()
        .map(|(i, addr)| (LISTEN_FDS_START + i as RawFd, addr))
        .collect();

    let generation = match var(GENERATION_VAR) {
        None => 1,
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| DescriptorInheritanceError::InvalidValue {
                var: GENERATION_VAR,
                value: raw,
            })?,
    };

    let ready_fd = var(READY_FD_VAR)
        .map(|raw| {
            raw.trim()
                .parse::<RawFd>()
                .ok()
                .filter(|fd| *fd >= LISTEN_FDS_START)
                .ok_or(DescriptorInheritanceError::InvalidValue {
                    var: READY_FD_VAR,
                    value: raw,
                })
        })
        .transpose()?;

    Ok(Some(EnvelopeVars {
        generation,
        listeners,
        ready_fd,
    }))
}

/// Split `LISTEN_FD_NAMES` into addresses.
///
/// IPv6 addresses contain ':' themselves, so tokens are joined back until
/// they form a complete `host:port`.
fn parse_names(raw: &str) -> Result<Vec<SocketAddr>, DescriptorInheritanceError> {
    let mut addrs = Vec::new();
    let mut current = String::new();
    let mut pending = false;

    for token in raw.split(':') {
        if pending {
            current.push(':');
        }
        current.push_str(token);
        pending = true;

        if let Ok(addr) = current.parse::<SocketAddr>() {
            addrs.push(addr);
            current.clear();
            pending = false;
        }
    }

    if pending {
        return Err(DescriptorInheritanceError::InvalidName { name: current });
    }
    Ok(addrs)
}

/// Read the handoff environment and adopt every announced descriptor.
///
/// Returns `None` on a cold start. The variables are removed afterwards so
/// processes spawned later do not see stale values. Removing them is only
/// sound while no other thread reads the environment, so this must run before
/// the async runtime starts.
pub(crate) fn inherit_from_env() -> Result<Option<Inherited>, DescriptorInheritanceError> {
    let Some(vars) = parse_vars(|name| std::env::var(name).ok())? else {
        return Ok(None);
    };

    let mut listeners = BTreeMap::new();
    for (fd, addr) in vars.listeners {
        let listener = adopt_listener(fd, addr)?;
        info!(fd, %addr, "Inherited listener from parent process");
        listeners.insert(addr, listener);
    }

    let ready_fd = vars.ready_fd.map(adopt_ready_fd).transpose()?;

    for var in [LISTEN_FDS, LISTEN_FD_NAMES, GENERATION_VAR, READY_FD_VAR] {
        std::env::remove_var(var);
    }

    Ok(Some(Inherited {
        generation: vars.generation,
        listeners,
        ready_fd,
    }))
}

fn adopt_listener(
    fd: RawFd,
    expected: SocketAddr,
) -> Result<std::net::TcpListener, DescriptorInheritanceError> {
    if !is_socket(fd) {
        return Err(DescriptorInheritanceError::NotASocket {
            fd,
            name: expected.to_string(),
        });
    }

    // SAFETY: fstat confirmed `fd` is an open socket, and the handoff contract
    // gives this process sole ownership of it.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    set_cloexec(fd).map_err(|source| DescriptorInheritanceError::Adopt { fd, source })?;

    let actual = listener
        .local_addr()
        .map_err(|source| DescriptorInheritanceError::Adopt { fd, source })?;
    if actual != expected {
        return Err(DescriptorInheritanceError::AddressMismatch {
            fd,
            name: expected.to_string(),
            actual,
        });
    }
    Ok(listener)
}

fn adopt_ready_fd(fd: RawFd) -> Result<OwnedFd, DescriptorInheritanceError> {
    set_cloexec(fd).map_err(|source| DescriptorInheritanceError::Adopt { fd, source })?;
    // SAFETY: F_SETFD succeeded, so `fd` is open; it was handed to us alone.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Validate that a file descriptor is a valid socket using fstat.
pub(crate) fn is_socket(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// Keep inherited descriptors from leaking into processes we spawn later.
fn set_cloexec(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

//! Listener registry.
//!
//! Tracks the listening sockets owned by the current generation, keyed by
//! address, so they can be handed to a successor. Inherited descriptors are
//! adopted here instead of binding fresh.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::LifecycleError;

/// A bound, listening TCP socket owned by this generation.
///
/// Cheap to clone; every clone refers to the same socket.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    addr: SocketAddr,
    inherited: bool,
    socket: Mutex<Option<std::net::TcpListener>>,
    closed: CancellationToken,
}

impl Listener {
    fn new(addr: SocketAddr, socket: std::net::TcpListener, inherited: bool) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                addr,
                inherited,
                socket: Mutex::new(Some(socket)),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Whether the socket came from a predecessor rather than a fresh `bind`.
    pub fn is_inherited(&self) -> bool {
        self.inner.inherited
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Token cancelled when the listener stops accepting.
    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    fn socket(&self) -> MutexGuard<'_, Option<std::net::TcpListener>> {
        self.inner
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Duplicate the descriptor, for accept loops and handoff envelopes.
    pub(crate) fn duplicate(&self) -> io::Result<OwnedFd> {
        match self.socket().as_ref() {
            Some(socket) => socket.as_fd().try_clone_to_owned(),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("listener {} is closed", self.inner.addr),
            )),
        }
    }

    /// Stop accepting on this listener. Returns `true` if this call closed it.
    fn close(&self) -> bool {
        let socket = self.socket().take();
        self.inner.closed.cancel();
        socket.is_some()
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.inner.addr)
            .field("inherited", &self.inner.inherited)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The set of listeners owned by a generation.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<BTreeMap<SocketAddr, Listener>>,
    inherited: Mutex<BTreeMap<SocketAddr, std::net::TcpListener>>,
}

impl ListenerRegistry {
    pub(crate) fn with_inherited(inherited: BTreeMap<SocketAddr, std::net::TcpListener>) -> Self {
        Self {
            listeners: Mutex::new(BTreeMap::new()),
            inherited: Mutex::new(inherited),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, BTreeMap<SocketAddr, Listener>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn inherited(&self) -> MutexGuard<'_, BTreeMap<SocketAddr, std::net::TcpListener>> {
        self.inherited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Open and track a listening socket for `addr`.
    ///
    /// A descriptor inherited for exactly this address is adopted without
    /// `bind`/`listen`. Otherwise the address is bound fresh, which fails with
    /// [`LifecycleError::Bind`] if it is already in use.
    pub fn register(&self, addr: SocketAddr) -> Result<Listener, LifecycleError> {
        let mut listeners = self.listeners();
        if listeners.get(&addr).is_some_and(|l| !l.is_closed()) {
            return Err(LifecycleError::Bind {
                addr,
                source: io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "address already registered by this generation",
                ),
            });
        }

        let listener = match self.inherited().remove(&addr) {
            Some(socket) => {
                info!(%addr, "Adopted inherited listener");
                Listener::new(addr, socket, true)
            }
            None => {
                let socket = std::net::TcpListener::bind(addr)
                    .map_err(|source| LifecycleError::Bind { addr, source })?;
                let bound = socket
                    .local_addr()
                    .map_err(|source| LifecycleError::Bind { addr, source })?;
                info!(addr = %bound, "Bound listener");
                Listener::new(bound, socket, false)
            }
        };

        listeners.insert(listener.local_addr(), listener.clone());
        Ok(listener)
    }

    /// Open listeners in address order. The order determines descriptor
    /// numbers in a handoff, so it must be stable.
    pub fn all(&self) -> Vec<Listener> {
        self.listeners()
            .values()
            .filter(|l| !l.is_closed())
            .cloned()
            .collect()
    }

    /// Addresses of the open listeners, in address order.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.all().iter().map(Listener::local_addr).collect()
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting new connections on `listener`. Idempotent.
    pub fn close(&self, listener: &Listener) {
        if listener.close() {
            debug!(addr = %listener.local_addr(), "Closed listener");
        }
    }

    /// Close every listener. Returns how many were still open.
    pub fn close_all(&self) -> usize {
        let listeners: Vec<Listener> = self.listeners().values().cloned().collect();
        let closed = listeners.iter().filter(|l| l.close()).count();
        if closed > 0 {
            info!(closed, "Stopped accepting on all listeners");
        }
        closed
    }

    /// Drop inherited descriptors nobody registered. Returns their addresses.
    pub(crate) fn release_unclaimed(&self) -> Vec<SocketAddr> {
        std::mem::take(&mut *self.inherited()).into_keys().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_register_binds_fresh() {
        let registry = ListenerRegistry::default();
        let listener = registry.register(localhost()).unwrap();

        assert_ne!(listener.local_addr().port(), 0);
        assert!(!listener.is_inherited());
        assert!(!listener.is_closed());
        assert_eq!(registry.len(), 1);

        std::net::TcpStream::connect(listener.local_addr()).unwrap();
    }

    #[test]
    fn test_register_address_in_use_fails() {
        let other = std::net::TcpListener::bind(localhost()).unwrap();
        let addr = other.local_addr().unwrap();

        let registry = ListenerRegistry::default();
        let err = registry.register(addr).unwrap_err();
        assert!(matches!(err, LifecycleError::Bind { addr: a, .. } if a == addr));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_same_address_twice_fails() {
        let registry = ListenerRegistry::default();
        let listener = registry.register(localhost()).unwrap();

        let err = registry.register(listener.local_addr()).unwrap_err();
        assert!(matches!(err, LifecycleError::Bind { .. }));
    }

    #[test]
    fn test_all_is_sorted_by_address() {
        let registry = ListenerRegistry::default();
        for _ in 0..4 {
            registry.register(localhost()).unwrap();
        }

        let addrs = registry.addresses();
        let mut sorted = addrs.clone();
        sorted.sort();
        assert_eq!(addrs, sorted);
        assert_eq!(addrs.len(), 4);
    }

    #[test]
    fn test_close_is_idempotent() {
        let registry = ListenerRegistry::default();
        let listener = registry.register(localhost()).unwrap();
        let addr = listener.local_addr();

        registry.close(&listener);
        registry.close(&listener);

        assert!(listener.is_closed());
        assert!(registry.is_empty());
        assert!(listener.duplicate().is_err());
        assert!(std::net::TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_close_all_counts_open_listeners() {
        let registry = ListenerRegistry::default();
        let first = registry.register(localhost()).unwrap();
        registry.register(localhost()).unwrap();
        registry.close(&first);

        assert_eq!(registry.close_all(), 1);
        assert_eq!(registry.close_all(), 0);
    }

    #[test]
    fn test_inherited_socket_is_adopted() {
        let socket = std::net::TcpListener::bind(localhost()).unwrap();
        let addr = socket.local_addr().unwrap();

        let registry = ListenerRegistry::with_inherited(BTreeMap::from([(addr, socket)]));
        let listener = registry.register(addr).unwrap();

        assert!(listener.is_inherited());
        assert_eq!(listener.local_addr(), addr);
        assert!(registry.release_unclaimed().is_empty());
        std::net::TcpStream::connect(addr).unwrap();
    }

    #[test]
    fn test_unclaimed_inherited_sockets_are_released() {
        let socket = std::net::TcpListener::bind(localhost()).unwrap();
        let addr = socket.local_addr().unwrap();

        let registry = ListenerRegistry::with_inherited(BTreeMap::from([(addr, socket)]));
        assert_eq!(registry.release_unclaimed(), vec![addr]);
        assert!(std::net::TcpStream::connect(addr).is_err());
    }
}

//! Shared listener fan-out over one process-wide readiness set.
//!
//! Listening sockets live in a dedicated epoll instance whose descriptor is registered
//! level-triggered on every worker's multiplexer. A worker that wakes on it extracts exactly one
//! listener event, accepts exactly one connection and returns to its own wait; while unaccepted
//! connections remain queued, level triggering re-wakes the next available worker, which spreads
//! acceptance across the pool in proportion to worker availability.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use syd_common::config::ServiceConfig;
use syd_common::error::{SydError, SydResult};
use syd_common::ids::WorkerId;

use crate::dcb::ProtocolHandler;
use crate::multiplexer::{Interest, Multiplexer, ReadyEvents, Token, Trigger};
use crate::worker::Worker;

/// Handler return bits fed into the worker statistics.
pub const ACTION_NOP: u32 = 0;
pub const ACTION_ACCEPT: u32 = 1 << 0;
pub const ACTION_READ: u32 = 1 << 1;
pub const ACTION_WRITE: u32 = 1 << 2;
pub const ACTION_HANGUP: u32 = 1 << 3;
pub const ACTION_ERROR: u32 = 1 << 4;

/// Creates the protocol handler for one accepted client connection.
///
/// Implemented by the protocol layer; invoked on the worker that won the accept race.
pub trait ClientHandlerFactory: Send + Sync {
    fn make_client_handler(&self, service: &Arc<ServiceConfig>) -> Rc<dyn ProtocolHandler>;
}

/// One listening socket bound to a service.
pub struct Listener {
    service: Arc<ServiceConfig>,
    socket: TcpListener,
    factory: Arc<dyn ClientHandlerFactory>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("service", &self.service.name)
            .field("fd", &self.socket.as_raw_fd())
            .finish()
    }
}

impl Listener {
    /// Binds a nonblocking listening socket for `service`.
    ///
    /// # Errors
    ///
    /// Returns `SydError::Io` when binding or configuring the socket fails.
    pub fn bind(
        address: SocketAddr,
        service: Arc<ServiceConfig>,
        factory: Arc<dyn ClientHandlerFactory>,
    ) -> SydResult<Arc<Self>> {
        let socket = TcpListener::bind(address)
            .map_err(|error| SydError::Io(format!("bind listener failed: {error}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|error| SydError::Io(format!("set listener nonblocking failed: {error}")))?;
        Ok(Arc::new(Self {
            service,
            socket,
            factory,
        }))
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns `SydError::Io` when the local address cannot be queried.
    pub fn local_addr(&self) -> SydResult<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|error| SydError::Io(format!("query listener address failed: {error}")))
    }

    #[must_use]
    pub fn service(&self) -> &Arc<ServiceConfig> {
        &self.service
    }

    /// Accepts exactly one connection on the invoking worker.
    pub(crate) fn handle_ready(&self, worker: &mut Worker) -> u32 {
        match self.socket.accept() {
            Ok((stream, _peer)) => {
                if stream.set_nonblocking(true).is_err() {
                    return ACTION_ERROR;
                }
                let _ = stream.set_nodelay(true);
                match worker.accept_client(OwnedFd::from(stream), &self.service, &self.factory) {
                    Ok(_dcb) => ACTION_ACCEPT,
                    Err(error) => {
                        warn!(
                            service = self.service.name.as_str(),
                            %error,
                            "attach of accepted client failed"
                        );
                        ACTION_ERROR
                    }
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => ACTION_NOP,
            Err(error) => {
                warn!(service = self.service.name.as_str(), %error, "accept failed");
                ACTION_ERROR
            }
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// The process-wide readiness set holding every listening socket.
#[derive(Debug)]
pub struct SharedListeners {
    mux: Multiplexer,
    owner: AtomicUsize,
    entries: Mutex<HashMap<RawFd, Arc<Listener>>>,
}

impl SharedListeners {
    /// Creates an empty shared listener set.
    ///
    /// # Errors
    ///
    /// Returns `SydError::Io` when the epoll instance cannot be created.
    pub fn new() -> SydResult<Arc<Self>> {
        Ok(Arc::new(Self {
            mux: Multiplexer::new()?,
            owner: AtomicUsize::new(0),
            entries: Mutex::new(HashMap::new()),
        }))
    }

    /// Worker id that owns the shared descriptors for bookkeeping purposes.
    #[must_use]
    pub fn owner(&self) -> WorkerId {
        self.owner.load(Ordering::Relaxed)
    }

    pub(crate) fn set_owner(&self, owner: WorkerId) {
        self.owner.store(owner, Ordering::Relaxed);
    }

    /// Installs a listening socket. The registration is always level-triggered; an
    /// edge-triggered entry would wake only one worker per connection burst.
    ///
    /// # Errors
    ///
    /// Returns `SydError::Io` when the kernel rejects the registration.
    pub fn add_shared(&self, listener: Arc<Listener>) -> SydResult<()> {
        let fd = listener.as_raw_fd();
        self.mux
            .add(fd, Interest::READABLE, Trigger::Level, Token(fd.unsigned_abs() as usize))?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SydError::InvalidState("shared listener table is poisoned"))?;
        let _ = entries.insert(fd, listener);
        info!(fd, "listener added to shared readiness set");
        Ok(())
    }

    /// Removes a listening socket from the shared set.
    ///
    /// # Errors
    ///
    /// Returns `SydError::Io` when the descriptor was not registered.
    pub fn remove_shared(&self, fd: RawFd) -> SydResult<()> {
        self.mux.remove(fd)?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SydError::InvalidState("shared listener table is poisoned"))?;
        let _ = entries.remove(&fd);
        Ok(())
    }

    /// Extracts at most one pending listener event.
    pub(crate) fn next_ready(&self) -> Option<Arc<Listener>> {
        let mut events = ReadyEvents::with_capacity(1);
        match self.mux.wait(&mut events, 0) {
            Ok(0) => None,
            Ok(_) => {
                let token = events.iter().next().map(|event| event.token())?;
                let fd = RawFd::try_from(token.0).ok()?;
                let entries = self.entries.lock().ok()?;
                entries.get(&fd).cloned()
            }
            Err(error) => {
                error!(%error, "shared listener wait failed");
                None
            }
        }
    }
}

impl AsRawFd for SharedListeners {
    fn as_raw_fd(&self) -> RawFd {
        self.mux.as_raw_fd()
    }
}

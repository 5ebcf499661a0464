//! Byte-relay protocol handlers exercising the worker runtime end to end.
//!
//! This is the in-process stand-in for the wire-protocol layer: client bytes are forwarded
//! verbatim to one backend connection per session and backend bytes flow back to the client.
//! The handler pair implements the full capability set the runtime consumes, including pool
//! reuse by liveness probe.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, warn};

use syd_common::config::ServiceConfig;
use syd_common::ids::SessionId;
use syd_runtime::dcb::{DcbRef, DcbState, ProtocolHandler, Upstream, UpstreamRef};
use syd_runtime::listener::ClientHandlerFactory;
use syd_runtime::multiplexer::Interest;
use syd_runtime::server::{BackendHandlerFactory, ServerTarget};
use syd_runtime::worker::Worker;

const RELAY_CHUNK_BYTES: usize = 8192;

/// Queues `bytes` on `target` and flushes; arms write events while the flush is backed up.
fn forward(worker: &mut Worker, target: &DcbRef, bytes: &[u8]) {
    let drained = {
        let mut target = target.borrow_mut();
        target.queue_write(bytes);
        target.flush_writes().unwrap_or(false)
    };
    let interest = if drained {
        Interest::READABLE
    } else {
        Interest::READABLE | Interest::WRITABLE
    };
    let _ = worker.update_interest(target, interest);
}

/// Reply route for one relayed session.
struct SessionUpstream {
    label: String,
}

impl SessionUpstream {
    fn for_session(session: SessionId) -> Self {
        Self {
            label: format!("session-{session}"),
        }
    }
}

impl Upstream for SessionUpstream {
    fn name(&self) -> &str {
        &self.label
    }
}

/// Client-side relay: forwards client bytes to a lazily acquired backend connection.
pub struct RelayClientHandler {
    server: Arc<ServerTarget>,
    backend: RefCell<Option<DcbRef>>,
}

impl RelayClientHandler {
    fn ensure_backend(&self, worker: &mut Worker, client: &DcbRef) -> Option<DcbRef> {
        if let Some(backend) = self.backend.borrow().as_ref()
            && backend.borrow().state() == DcbState::Polling
        {
            return Some(Rc::clone(backend));
        }

        let session = client.borrow().session()?;
        let upstream: UpstreamRef = Rc::new(SessionUpstream::for_session(session));
        match worker.get_backend(&self.server, session, &upstream) {
            Ok(backend) => {
                *self.backend.borrow_mut() = Some(Rc::clone(&backend));
                Some(backend)
            }
            Err(error) => {
                warn!(server = self.server.name(), %error, "backend unavailable for session");
                None
            }
        }
    }
}

impl ProtocolHandler for RelayClientHandler {
    fn on_read(&self, worker: &mut Worker, dcb: &DcbRef) {
        let mut chunk = [0_u8; RELAY_CHUNK_BYTES];
        loop {
            let read = dcb.borrow_mut().read_chunk(&mut chunk);
            match read {
                Ok(0) => {
                    worker.close_dcb(dcb);
                    return;
                }
                Ok(read_len) => {
                    let Some(backend) = self.ensure_backend(worker, dcb) else {
                        worker.close_dcb(dcb);
                        return;
                    };
                    forward(worker, &backend, &chunk[..read_len]);
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(_error) => {
                    worker.close_dcb(dcb);
                    return;
                }
            }
        }
    }

    fn on_write_ready(&self, worker: &mut Worker, dcb: &DcbRef) {
        let drained = dcb.borrow_mut().flush_writes().unwrap_or(false);
        if drained {
            let _ = worker.update_interest(dcb, Interest::READABLE);
        }
    }

    fn on_error(&self, worker: &mut Worker, dcb: &DcbRef) {
        worker.close_dcb(dcb);
    }

    fn on_hangup(&self, worker: &mut Worker, dcb: &DcbRef) {
        worker.close_dcb(dcb);
    }
}

/// Backend-side relay: forwards server bytes back to the session's client.
pub struct RelayBackendHandler;

impl RelayBackendHandler {
    fn client_of(worker: &Worker, dcb: &DcbRef) -> Option<DcbRef> {
        let session = dcb.borrow().session()?;
        worker.lookup_session(session)?.client()
    }
}

impl ProtocolHandler for RelayBackendHandler {
    fn on_read(&self, worker: &mut Worker, dcb: &DcbRef) {
        let mut chunk = [0_u8; RELAY_CHUNK_BYTES];
        loop {
            let read = dcb.borrow_mut().read_chunk(&mut chunk);
            match read {
                Ok(0) => {
                    worker.close_dcb(dcb);
                    return;
                }
                Ok(read_len) => {
                    let Some(client) = Self::client_of(worker, dcb) else {
                        debug!("backend bytes without a client, dropping connection");
                        worker.close_dcb(dcb);
                        return;
                    };
                    forward(worker, &client, &chunk[..read_len]);
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(_error) => {
                    worker.close_dcb(dcb);
                    return;
                }
            }
        }
    }

    fn on_write_ready(&self, worker: &mut Worker, dcb: &DcbRef) {
        let drained = dcb.borrow_mut().flush_writes().unwrap_or(false);
        if drained {
            let _ = worker.update_interest(dcb, Interest::READABLE);
        }
    }

    fn on_error(&self, worker: &mut Worker, dcb: &DcbRef) {
        worker.close_dcb(dcb);
    }

    fn on_hangup(&self, worker: &mut Worker, dcb: &DcbRef) {
        worker.close_dcb(dcb);
    }

    fn established(&self) -> bool {
        // The relay has no handshake; a connected socket is reusable.
        true
    }

    fn reuse_connection(&self, _worker: &mut Worker, dcb: &DcbRef, upstream: &UpstreamRef) -> bool {
        // A pooled relay connection must be quiet: pending bytes or EOF mean the server gave
        // up on it while it rested in the pool.
        let mut probe = [0_u8; 1];
        let alive = match dcb.borrow_mut().read_chunk(&mut probe) {
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => true,
            Ok(_) | Err(_) => false,
        };
        if alive {
            debug!(upstream = upstream.name(), "rebound pooled backend connection");
        }
        alive
    }

    fn clear(&self) {}
}

/// Factory wiring the client relay to its backend server.
pub struct RelayClientFactory {
    server: Arc<ServerTarget>,
}

impl RelayClientFactory {
    #[must_use]
    pub fn new(server: Arc<ServerTarget>) -> Self {
        Self { server }
    }
}

impl ClientHandlerFactory for RelayClientFactory {
    fn make_client_handler(&self, _service: &Arc<ServiceConfig>) -> Rc<dyn ProtocolHandler> {
        Rc::new(RelayClientHandler {
            server: Arc::clone(&self.server),
            backend: RefCell::new(None),
        })
    }
}

/// Factory for the backend half of the relay.
pub struct RelayBackendFactory;

impl BackendHandlerFactory for RelayBackendFactory {
    fn make_backend_handler(&self, _server: &Arc<ServerTarget>) -> Rc<dyn ProtocolHandler> {
        Rc::new(RelayBackendHandler)
    }
}

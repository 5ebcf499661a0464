//! Shared fixtures for the crate's tests.

use std::cell::Cell;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::Arc;

use syd_common::config::{ServerPoolConfig, ServiceConfig};
use syd_common::ids::SessionId;

use crate::dcb::{Dcb, DcbRef, ProtocolHandler};
use crate::listener::{ClientHandlerFactory, SharedListeners};
use crate::modules::ModuleRegistry;
use crate::multiplexer::Interest;
use crate::server::{BackendHandlerFactory, ServerTarget};
use crate::session::{Session, SessionRef};
use crate::worker::{Worker, WorkerChannels, WorkerSeed};

pub(crate) fn nonblocking_socketpair() -> (OwnedFd, OwnedFd) {
    let mut fds = [0_i32; 2];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(rc, 0, "socketpair must be creatable");
    let left = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let right = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    (left, right)
}

/// Builds a standalone worker plus its channels, driven by `poll_once` from the test thread.
pub(crate) fn test_worker(id: syd_common::ids::WorkerId) -> (Worker, WorkerChannels) {
    let shared = SharedListeners::new().expect("shared listener set must be creatable");
    let (seed, channels) = WorkerSeed::create(id, shared, Arc::new(ModuleRegistry::new()), 64)
        .expect("worker seed must be creatable");
    (Worker::from_seed(seed), channels)
}

/// Observable state of a [`ProbeHandler`].
#[derive(Debug, Default)]
pub(crate) struct HandlerProbe {
    pub reads: Cell<usize>,
    pub writes: Cell<usize>,
    pub errors: Cell<usize>,
    pub hangups: Cell<usize>,
    pub reuses: Cell<usize>,
    pub clears: Cell<usize>,
    pub established: Cell<bool>,
    pub reuse_result: Cell<bool>,
    pub close_on_hangup: Cell<bool>,
}

impl HandlerProbe {
    pub(crate) fn poolable() -> Rc<Self> {
        let probe = Rc::new(Self::default());
        probe.established.set(true);
        probe.reuse_result.set(true);
        probe.close_on_hangup.set(true);
        probe
    }
}

/// Protocol handler that records every callback into its probe.
pub(crate) struct ProbeHandler {
    pub probe: Rc<HandlerProbe>,
}

impl ProtocolHandler for ProbeHandler {
    fn on_read(&self, _worker: &mut Worker, _dcb: &DcbRef) {
        self.probe.reads.set(self.probe.reads.get() + 1);
    }

    fn on_write_ready(&self, _worker: &mut Worker, _dcb: &DcbRef) {
        self.probe.writes.set(self.probe.writes.get() + 1);
    }

    fn on_error(&self, worker: &mut Worker, dcb: &DcbRef) {
        self.probe.errors.set(self.probe.errors.get() + 1);
        worker.close_dcb(dcb);
    }

    fn on_hangup(&self, worker: &mut Worker, dcb: &DcbRef) {
        self.probe.hangups.set(self.probe.hangups.get() + 1);
        if self.probe.close_on_hangup.get() {
            worker.close_dcb(dcb);
        }
    }

    fn established(&self) -> bool {
        self.probe.established.get()
    }

    fn reuse_connection(
        &self,
        _worker: &mut Worker,
        _dcb: &DcbRef,
        _upstream: &crate::dcb::UpstreamRef,
    ) -> bool {
        self.probe.reuses.set(self.probe.reuses.get() + 1);
        self.probe.reuse_result.get()
    }

    fn clear(&self) {
        self.probe.clears.set(self.probe.clears.get() + 1);
    }
}

struct ProbeBackendFactory;

impl BackendHandlerFactory for ProbeBackendFactory {
    fn make_backend_handler(&self, _server: &Arc<ServerTarget>) -> Rc<dyn ProtocolHandler> {
        Rc::new(ProbeHandler {
            probe: HandlerProbe::poolable(),
        })
    }
}

/// Server target with probe-backed handlers, pointed at `address`.
pub(crate) fn probe_server(
    address: SocketAddr,
    pool_max: u32,
    max_age: u64,
) -> Arc<ServerTarget> {
    ServerTarget::new(
        "db-0",
        address,
        ServerPoolConfig {
            persist_pool_max: pool_max,
            persist_max_time: max_age,
        },
        Arc::new(ProbeBackendFactory),
    )
}

/// Registers a session on the worker and returns it.
pub(crate) fn test_session(worker: &mut Worker, service: &Arc<ServiceConfig>) -> SessionRef {
    let session = Session::new(Arc::clone(service));
    let registered = worker.sessions().register(Rc::clone(&session));
    assert!(registered, "fresh session id must register");
    session
}

/// Attaches a probe-handled backend DCB over a socketpair; returns the DCB, its probe and the
/// peer end that simulates the server side.
pub(crate) fn attach_probe_backend(
    worker: &mut Worker,
    server: &Arc<ServerTarget>,
    session: SessionId,
) -> (DcbRef, Rc<HandlerProbe>, OwnedFd) {
    let (local, peer) = nonblocking_socketpair();
    let probe = HandlerProbe::poolable();
    let handler = Rc::new(ProbeHandler {
        probe: Rc::clone(&probe),
    });
    let dcb = Dcb::new_backend(local, worker.id(), session, Arc::clone(server), handler);
    worker
        .attach_dcb(&dcb, Interest::READABLE)
        .expect("backend attach must succeed");
    server.incr_current();
    dcb.borrow_mut().set_counted_on_server(true);
    if let Some(session) = worker.lookup_session(session) {
        session.link_backend(dcb.borrow().token());
    }
    (dcb, probe, peer)
}

/// Attaches a probe-handled client DCB over a socketpair bound to a fresh session.
pub(crate) fn attach_probe_client(
    worker: &mut Worker,
    service: &Arc<ServiceConfig>,
) -> (DcbRef, Rc<HandlerProbe>, OwnedFd, SessionRef) {
    let (local, peer) = nonblocking_socketpair();
    let session = test_session(worker, service);
    let probe = HandlerProbe::poolable();
    let handler = Rc::new(ProbeHandler {
        probe: Rc::clone(&probe),
    });
    let dcb = Dcb::new_client(local, worker.id(), session.id(), handler);
    session.set_client(Rc::clone(&dcb));
    worker
        .attach_dcb(&dcb, Interest::READABLE)
        .expect("client attach must succeed");
    (dcb, probe, peer, session)
}

/// Upstream stub for reuse calls.
pub(crate) struct TestUpstream;

impl crate::dcb::Upstream for TestUpstream {
    fn name(&self) -> &str {
        "test-upstream"
    }
}

/// Client handler factory echoing every read chunk back to the peer.
pub(crate) struct EchoClientFactory;

struct EchoClientHandler;

impl ProtocolHandler for EchoClientHandler {
    fn on_read(&self, worker: &mut Worker, dcb: &DcbRef) {
        let mut chunk = [0_u8; 4096];
        loop {
            let read = dcb.borrow_mut().read_chunk(&mut chunk);
            match read {
                Ok(0) => {
                    worker.close_dcb(dcb);
                    return;
                }
                Ok(read_len) => {
                    let mut dcb = dcb.borrow_mut();
                    dcb.queue_write(&chunk[..read_len]);
                    let _ = dcb.flush_writes();
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(_error) => {
                    worker.close_dcb(dcb);
                    return;
                }
            }
        }
    }

    fn on_write_ready(&self, _worker: &mut Worker, dcb: &DcbRef) {
        let _ = dcb.borrow_mut().flush_writes();
    }

    fn on_error(&self, worker: &mut Worker, dcb: &DcbRef) {
        worker.close_dcb(dcb);
    }

    fn on_hangup(&self, worker: &mut Worker, dcb: &DcbRef) {
        worker.close_dcb(dcb);
    }
}

impl ClientHandlerFactory for EchoClientFactory {
    fn make_client_handler(&self, _service: &Arc<ServiceConfig>) -> Rc<dyn ProtocolHandler> {
        Rc::new(EchoClientHandler)
    }
}

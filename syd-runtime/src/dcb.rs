//! Descriptor control blocks: one handle per network connection.
//!
//! A DCB is created on the worker that accepted or opened the connection and never changes
//! owner. The protocol layer drives it through the [`ProtocolHandler`] capability set; while a
//! backend DCB rests in the persistent pool its handler assignment is switched to the pool
//! sentinel so that any readiness activity evicts it instead of reaching protocol code.

use std::cell::RefCell;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

use syd_common::ids::{SessionId, WorkerId};

use crate::clock;
use crate::multiplexer::Token;
use crate::server::ServerTarget;
use crate::worker::Worker;

/// Which side of the proxy a DCB faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcbRole {
    Client,
    Backend,
    Internal,
}

/// Lifecycle state of a DCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcbState {
    /// Created, not yet registered for readiness events.
    Allocated,
    /// Registered on the owning worker's multiplexer.
    Polling,
    /// Events disabled ahead of shutdown.
    NoPolling,
    /// Closed; waiting in the zombie queue or already destroyed.
    Disconnected,
}

/// Which handler receives readiness events for a DCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAssignment {
    /// The protocol handler installed at creation (or restored on pool reuse).
    Protocol,
    /// The pool sentinel: any activity evicts and closes the DCB.
    Pool,
}

/// Reply routing seam handed through `reuse_connection`; opaque to the runtime.
pub trait Upstream {
    fn name(&self) -> &str;
}

/// Shared handle to an upstream component within one worker.
pub type UpstreamRef = Rc<dyn Upstream>;

/// Capability set the protocol layer provides per DCB.
///
/// Event callbacks run on the owning worker thread and must not block; a handler that needs to
/// wait reschedules itself through the same worker's mailbox. Handlers keep their own mutable
/// state behind interior mutability, which keeps re-entrant queries (`established` during an
/// event callback) safe.
pub trait ProtocolHandler {
    fn on_read(&self, worker: &mut Worker, dcb: &DcbRef);
    fn on_write_ready(&self, worker: &mut Worker, dcb: &DcbRef);
    fn on_error(&self, worker: &mut Worker, dcb: &DcbRef);
    fn on_hangup(&self, worker: &mut Worker, dcb: &DcbRef);

    /// Whether the protocol session finished its handshake and is reusable in principle.
    fn established(&self) -> bool {
        false
    }

    /// Rebinds a pooled connection to a new session. Returning `false` closes the DCB.
    fn reuse_connection(&self, _worker: &mut Worker, _dcb: &DcbRef, _upstream: &UpstreamRef) -> bool {
        false
    }

    /// Resets per-session protocol state before the DCB enters the pool.
    fn clear(&self) {}
}

/// Shared handle to a DCB inside its owning worker.
pub type DcbRef = Rc<RefCell<Dcb>>;

/// One connection descriptor owned by a single worker.
pub struct Dcb {
    role: DcbRole,
    state: DcbState,
    owner: WorkerId,
    token: Token,
    io: OwnedFd,
    session: Option<SessionId>,
    server: Option<Arc<ServerTarget>>,
    protocol: Rc<dyn ProtocolHandler>,
    assignment: HandlerAssignment,
    last_read: i64,
    last_write: i64,
    write_buffer: Vec<u8>,
    hanged_up: bool,
    close_requested: bool,
    counted_on_server: bool,
}

impl std::fmt::Debug for Dcb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dcb")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("owner", &self.owner)
            .field("token", &self.token)
            .field("fd", &self.io.as_raw_fd())
            .field("session", &self.session)
            .finish()
    }
}

impl Dcb {
    /// Creates a client-side DCB for an accepted socket.
    #[must_use]
    pub fn new_client(
        io: OwnedFd,
        owner: WorkerId,
        session: SessionId,
        protocol: Rc<dyn ProtocolHandler>,
    ) -> DcbRef {
        Rc::new(RefCell::new(Self::new(
            DcbRole::Client,
            io,
            owner,
            Some(session),
            None,
            protocol,
        )))
    }

    /// Creates a backend-side DCB for a freshly connected server socket.
    #[must_use]
    pub fn new_backend(
        io: OwnedFd,
        owner: WorkerId,
        session: SessionId,
        server: Arc<ServerTarget>,
        protocol: Rc<dyn ProtocolHandler>,
    ) -> DcbRef {
        Rc::new(RefCell::new(Self::new(
            DcbRole::Backend,
            io,
            owner,
            Some(session),
            Some(server),
            protocol,
        )))
    }

    /// Creates an internal DCB (runtime-owned descriptor with a handler).
    #[must_use]
    pub fn new_internal(io: OwnedFd, owner: WorkerId, protocol: Rc<dyn ProtocolHandler>) -> DcbRef {
        Rc::new(RefCell::new(Self::new(
            DcbRole::Internal,
            io,
            owner,
            None,
            None,
            protocol,
        )))
    }

    fn new(
        role: DcbRole,
        io: OwnedFd,
        owner: WorkerId,
        session: Option<SessionId>,
        server: Option<Arc<ServerTarget>>,
        protocol: Rc<dyn ProtocolHandler>,
    ) -> Self {
        let now = clock::ticks();
        Self {
            role,
            state: DcbState::Allocated,
            owner,
            token: Token(0),
            io,
            session,
            server,
            protocol,
            assignment: HandlerAssignment::Protocol,
            last_read: now,
            last_write: now,
            write_buffer: Vec::new(),
            hanged_up: false,
            close_requested: false,
            counted_on_server: false,
        }
    }

    #[must_use]
    pub fn role(&self) -> DcbRole {
        self.role
    }

    #[must_use]
    pub fn state(&self) -> DcbState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: DcbState) {
        self.state = state;
    }

    #[must_use]
    pub fn owner(&self) -> WorkerId {
        self.owner
    }

    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn set_token(&mut self, token: Token) {
        self.token = token;
    }

    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.io.as_raw_fd()
    }

    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub(crate) fn bind_session(&mut self, session: SessionId) {
        self.session = Some(session);
    }

    pub(crate) fn clear_session(&mut self) {
        self.session = None;
    }

    #[must_use]
    pub fn server(&self) -> Option<&Arc<ServerTarget>> {
        self.server.as_ref()
    }

    /// The protocol handler installed at creation, regardless of pool assignment.
    #[must_use]
    pub fn protocol(&self) -> Rc<dyn ProtocolHandler> {
        Rc::clone(&self.protocol)
    }

    #[must_use]
    pub fn handler_assignment(&self) -> HandlerAssignment {
        self.assignment
    }

    pub(crate) fn set_handler_assignment(&mut self, assignment: HandlerAssignment) {
        self.assignment = assignment;
    }

    #[must_use]
    pub fn hanged_up(&self) -> bool {
        self.hanged_up
    }

    pub(crate) fn mark_hanged_up(&mut self) {
        self.hanged_up = true;
    }

    #[must_use]
    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested
    }

    pub(crate) fn set_close_requested(&mut self, requested: bool) {
        self.close_requested = requested;
    }

    #[must_use]
    pub(crate) fn counted_on_server(&self) -> bool {
        self.counted_on_server
    }

    pub(crate) fn set_counted_on_server(&mut self, counted: bool) {
        self.counted_on_server = counted;
    }

    /// Tick of the most recent successful read.
    #[must_use]
    pub fn last_read(&self) -> i64 {
        self.last_read
    }

    /// Tick of the most recent successful write.
    #[must_use]
    pub fn last_write(&self) -> i64 {
        self.last_write
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_read(&mut self, ticks: i64) {
        self.last_read -= ticks;
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_write(&mut self, ticks: i64) {
        self.last_write -= ticks;
    }

    /// Bytes queued for write but not yet flushed to the socket.
    #[must_use]
    pub fn writeq_len(&self) -> usize {
        self.write_buffer.len()
    }

    /// Reads once into `buffer`, updating the read timestamp.
    ///
    /// # Errors
    ///
    /// Forwards the socket error; `WouldBlock` means the descriptor is drained for this turn.
    pub fn read_chunk(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        let read = unsafe {
            libc::read(
                self.io.as_raw_fd(),
                buffer.as_mut_ptr().cast(),
                buffer.len(),
            )
        };
        if read < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if read > 0 {
            self.last_read = clock::ticks();
        }
        Ok(read.unsigned_abs())
    }

    /// Appends bytes to the write queue; call [`Dcb::flush_writes`] to push them out.
    pub fn queue_write(&mut self, bytes: &[u8]) {
        self.write_buffer.extend_from_slice(bytes);
    }

    /// Writes as much queued data as the socket accepts. Returns whether the queue drained.
    ///
    /// # Errors
    ///
    /// Forwards socket errors other than `WouldBlock`; a zero-length write is reported as
    /// `WriteZero`.
    pub fn flush_writes(&mut self) -> std::io::Result<bool> {
        while !self.write_buffer.is_empty() {
            let written = unsafe {
                libc::write(
                    self.io.as_raw_fd(),
                    self.write_buffer.as_ptr().cast(),
                    self.write_buffer.len(),
                )
            };
            if written < 0 {
                let error = std::io::Error::last_os_error();
                if error.kind() == std::io::ErrorKind::WouldBlock {
                    return Ok(false);
                }
                return Err(error);
            }
            if written == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero));
            }
            let _ = self.write_buffer.drain(..written.unsigned_abs());
            self.last_write = clock::ticks();
        }
        Ok(true)
    }

    /// Shuts both directions of the socket down ahead of close.
    pub(crate) fn shutdown_socket(&self) {
        let _ = unsafe { libc::shutdown(self.io.as_raw_fd(), libc::SHUT_RDWR) };
    }
}

#[cfg(test)]
mod tests {
    use super::{Dcb, DcbRef, DcbRole, DcbState, HandlerAssignment, ProtocolHandler};
    use crate::testutil::nonblocking_socketpair;
    use crate::worker::Worker;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::rc::Rc;

    struct NullHandler;

    impl ProtocolHandler for NullHandler {
        fn on_read(&self, _worker: &mut Worker, _dcb: &DcbRef) {}
        fn on_write_ready(&self, _worker: &mut Worker, _dcb: &DcbRef) {}
        fn on_error(&self, _worker: &mut Worker, _dcb: &DcbRef) {}
        fn on_hangup(&self, _worker: &mut Worker, _dcb: &DcbRef) {}
    }

    #[rstest]
    fn new_client_dcb_starts_allocated_with_protocol_handler() {
        let (left, _right) = nonblocking_socketpair();
        let dcb = Dcb::new_client(left, 0, 1, Rc::new(NullHandler));
        let dcb = dcb.borrow();
        assert_that!(dcb.role(), eq(DcbRole::Client));
        assert_that!(dcb.state(), eq(DcbState::Allocated));
        assert_that!(dcb.handler_assignment(), eq(HandlerAssignment::Protocol));
        assert_that!(dcb.hanged_up(), eq(false));
    }

    #[rstest]
    fn queued_writes_flush_through_the_socket() {
        let (left, right) = nonblocking_socketpair();
        let dcb = Dcb::new_client(left, 0, 1, Rc::new(NullHandler));
        dcb.borrow_mut().queue_write(b"ping");
        let drained = dcb
            .borrow_mut()
            .flush_writes()
            .expect("flush over socketpair must succeed");
        assert_that!(drained, eq(true));
        assert_that!(dcb.borrow().writeq_len(), eq(0_usize));

        let peer = Dcb::new_client(right, 0, 2, Rc::new(NullHandler));
        let mut buffer = [0_u8; 16];
        let read = peer
            .borrow_mut()
            .read_chunk(&mut buffer)
            .expect("read over socketpair must succeed");
        assert_that!(&buffer[..read], eq(b"ping".as_slice()));
    }

    #[rstest]
    fn read_on_drained_socket_reports_would_block() {
        let (left, _right) = nonblocking_socketpair();
        let dcb = Dcb::new_client(left, 0, 1, Rc::new(NullHandler));
        let mut buffer = [0_u8; 16];
        let error = dcb
            .borrow_mut()
            .read_chunk(&mut buffer)
            .expect_err("empty nonblocking socket must not yield bytes");
        assert_that!(error.kind(), eq(std::io::ErrorKind::WouldBlock));
    }
}

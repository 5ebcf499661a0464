//! The routing worker: one OS thread running a cooperative event loop.
//!
//! A worker owns its multiplexer, its DCB registry and zombie queue, its per-server persistent
//! pool, its session registry and its statistics. Nothing in here is shared with other threads
//! except the mailbox submission side and the per-server atomic counters; every other structure
//! relies on single-writer access from the owning thread.

use std::cell::Cell;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, warn};

use syd_common::config::ServiceConfig;
use syd_common::error::{SydError, SydResult};
use syd_common::ids::{SessionId, WorkerId};

use crate::clock;
use crate::dcb::{Dcb, DcbRef, DcbRole, DcbState, HandlerAssignment, UpstreamRef};
use crate::listener::{
    ACTION_ACCEPT, ACTION_ERROR, ACTION_HANGUP, ACTION_READ, ACTION_WRITE, ClientHandlerFactory,
    SharedListeners,
};
use crate::mailbox::{ExecuteMode, Job, MSG_SHUTDOWN, Mailbox, MailboxHandle, RawMessage, mailbox_pair};
use crate::modules::ModuleRegistry;
use crate::multiplexer::{Interest, Multiplexer, ReadyEvent, ReadyEvents, Token, Trigger};
use crate::pool::{Evict, PersistentEntry, PoolMap, PoolShelf, server_key};
use crate::server::ServerTarget;
use crate::session::{CloseReason, Session, SessionRef, SessionRegistry};
use crate::stats::WorkerStatistics;

pub(crate) const WAKE_TOKEN: Token = Token(0);
pub(crate) const RAW_TOKEN: Token = Token(1);
pub(crate) const SHARED_TOKEN: Token = Token(2);
const FIRST_DCB_TOKEN: usize = 3;

/// Upper bound of one `wait`; the tick must run at least this often.
const MAX_WAIT_MS: i32 = 100;

/// Timeout scan interval: one second, in 100 ms ticks.
const TIMEOUT_CHECK_INTERVAL_TICKS: i64 = 10;

thread_local! {
    static CURRENT_WORKER_ID: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// Id of the worker whose loop the calling thread is currently inside, if any.
#[must_use]
pub fn current_worker_id() -> Option<WorkerId> {
    CURRENT_WORKER_ID.get()
}

/// Scope guard marking the calling thread as a worker's loop thread.
pub(crate) struct CurrentWorkerGuard {
    previous: Option<WorkerId>,
}

impl Drop for CurrentWorkerGuard {
    fn drop(&mut self) {
        CURRENT_WORKER_ID.set(self.previous);
    }
}

/// Installed callback for raw messages the loop does not handle itself.
pub type RawMessageHandler = fn(&mut Worker, RawMessage);

/// Cross-thread channels of one worker, held by the pool manager.
#[derive(Debug, Clone)]
pub struct WorkerChannels {
    pub id: WorkerId,
    pub handle: MailboxHandle,
    pub stop: Arc<AtomicBool>,
}

/// Everything a worker needs before its thread starts.
///
/// The seed is created during pool init — multiplexer or wake-descriptor failures surface
/// before any thread runs — and is `Send`, unlike the assembled [`Worker`], whose DCB registry
/// pins it to the thread that builds it.
#[derive(Debug)]
pub struct WorkerSeed {
    id: WorkerId,
    mux: Multiplexer,
    mailbox: Mailbox,
    handle: MailboxHandle,
    shared: Arc<SharedListeners>,
    stop: Arc<AtomicBool>,
    modules: Arc<ModuleRegistry>,
    max_events: usize,
}

impl WorkerSeed {
    /// Creates the seed and cross-thread channels for one worker.
    ///
    /// # Errors
    ///
    /// Returns `SydError::Io` when the multiplexer, wake descriptor or message pipe cannot be
    /// created or registered. This is init-fatal for the pool.
    pub fn create(
        id: WorkerId,
        shared: Arc<SharedListeners>,
        modules: Arc<ModuleRegistry>,
        max_events: usize,
    ) -> SydResult<(Self, WorkerChannels)> {
        let mux = Multiplexer::new()?;
        let (mailbox, handle) = mailbox_pair()?;
        let stop = Arc::new(AtomicBool::new(false));

        mux.add(mailbox.wake_fd(), Interest::READABLE, Trigger::Edge, WAKE_TOKEN)?;
        mux.add(mailbox.raw_fd(), Interest::READABLE, Trigger::Edge, RAW_TOKEN)?;
        // Level-triggered on purpose: each worker accepts once per wakeup, and pending
        // connections must re-wake the next available worker.
        mux.add(
            shared.as_raw_fd(),
            Interest::READABLE,
            Trigger::Level,
            SHARED_TOKEN,
        )?;

        let channels = WorkerChannels {
            id,
            handle: handle.clone(),
            stop: Arc::clone(&stop),
        };
        let seed = Self {
            id,
            mux,
            mailbox,
            handle,
            shared,
            stop,
            modules,
            max_events,
        };
        Ok((seed, channels))
    }

    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }
}

/// One event observed on the worker's multiplexer, decoded once.
#[derive(Debug, Clone, Copy)]
struct EventSnapshot {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
    hangup: bool,
}

impl EventSnapshot {
    fn from_ready(event: &ReadyEvent) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            hangup: event.is_hangup(),
        }
    }

    fn hangup_only(token: Token) -> Self {
        Self {
            token,
            readable: false,
            writable: false,
            error: false,
            hangup: true,
        }
    }
}

/// One routing worker. Created by the pool manager; lives on its own thread once started.
pub struct Worker {
    id: WorkerId,
    mux: Multiplexer,
    mailbox: Mailbox,
    handle: MailboxHandle,
    shared: Arc<SharedListeners>,
    stop: Arc<AtomicBool>,
    modules: Arc<ModuleRegistry>,
    events: ReadyEvents,
    dcbs: HashMap<Token, DcbRef>,
    targets: HashMap<Token, DcbRef>,
    zombies: Vec<DcbRef>,
    pool: PoolMap,
    evicting: bool,
    next_timeout_check: i64,
    tick_hooks: Vec<Box<dyn FnMut(&mut Worker)>>,
    sessions: SessionRegistry,
    stats: WorkerStatistics,
    raw_handler: Option<RawMessageHandler>,
    next_token: usize,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("dcbs", &self.dcbs.len())
            .field("zombies", &self.zombies.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl Worker {
    /// Assembles a worker from its seed; called on the thread the worker will live on.
    #[must_use]
    pub fn from_seed(seed: WorkerSeed) -> Self {
        Self {
            id: seed.id,
            mux: seed.mux,
            mailbox: seed.mailbox,
            handle: seed.handle,
            shared: seed.shared,
            stop: seed.stop,
            modules: seed.modules,
            events: ReadyEvents::with_capacity(seed.max_events),
            dcbs: HashMap::new(),
            targets: HashMap::new(),
            zombies: Vec::new(),
            pool: PoolMap::new(),
            evicting: false,
            next_timeout_check: clock::ticks(),
            tick_hooks: Vec::new(),
            sessions: SessionRegistry::default(),
            stats: WorkerStatistics::default(),
            raw_handler: None,
            next_token: FIRST_DCB_TOKEN,
        }
    }

    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    #[must_use]
    pub fn statistics(&self) -> &WorkerStatistics {
        &self.stats
    }

    #[must_use]
    pub fn should_shutdown(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// The per-worker session registry.
    pub fn sessions(&mut self) -> &mut SessionRegistry {
        &mut self.sessions
    }

    #[must_use]
    pub fn lookup_session(&self, id: SessionId) -> Option<SessionRef> {
        self.sessions.lookup(id)
    }

    /// Installs the callback for raw messages beyond the built-in ids.
    pub fn set_raw_message_handler(&mut self, handler: RawMessageHandler) {
        self.raw_handler = Some(handler);
    }

    /// Registers a hook run at the end of every tick.
    pub fn register_tick_hook(&mut self, hook: Box<dyn FnMut(&mut Worker)>) {
        self.tick_hooks.push(hook);
    }

    pub(crate) fn enter(&self) -> CurrentWorkerGuard {
        let previous = CURRENT_WORKER_ID.replace(Some(self.id));
        CurrentWorkerGuard { previous }
    }

    pub(crate) fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    /// Runs the loop until the stop flag is raised, then flushes the pool.
    pub fn run(&mut self) {
        while !self.should_shutdown() {
            let _ = self.poll_once(MAX_WAIT_MS);
        }
        self.evict_pooled(Evict::All);
    }

    /// Executes one loop turn: wait, dispatch readiness, drain the mailbox, tick.
    ///
    /// Returns the number of readiness events observed. Wait failures other than interruption
    /// are logged and the turn continues so one bad wakeup cannot kill the worker.
    pub fn poll_once(&mut self, timeout_ms: i32) -> usize {
        let timeout = timeout_ms.clamp(0, MAX_WAIT_MS);
        let count = match self.mux.wait(&mut self.events, timeout) {
            Ok(count) => count,
            Err(wait_error) => {
                error!(worker = self.id, error = %wait_error, "wait failed");
                0
            }
        };
        self.stats.n_polls += 1;
        self.stats.n_pollev += count as u64;
        self.stats.evq_max = self.stats.evq_max.max(count as u64);

        let snapshots = self
            .events
            .iter()
            .map(EventSnapshot::from_ready)
            .collect::<Vec<_>>();
        for snapshot in &snapshots {
            match snapshot.token {
                WAKE_TOKEN => self.mailbox.clear_wake(),
                RAW_TOKEN => self.handle_raw_messages(),
                SHARED_TOKEN => self.handle_shared_ready(),
                _ => self.deliver_dcb_event(*snapshot),
            }
        }

        self.drain_mailbox();
        self.tick();
        count
    }

    // ---- mailbox -------------------------------------------------------------------------

    /// Runs a job inline on this worker (the direct submission mode).
    pub fn execute_local(&mut self, job: Job) {
        job.run(self);
    }

    /// Submits a job to this worker's own mailbox.
    ///
    /// `Auto` executes inline because the caller evidently already runs on this worker;
    /// `Queued` defers to the next loop turn.
    ///
    /// # Errors
    ///
    /// Returns `SydError::InvalidState` when the mailbox is closed (queued mode only).
    pub fn execute(&mut self, job: Job, mode: ExecuteMode) -> SydResult<()> {
        match mode {
            ExecuteMode::Auto => {
                self.execute_local(job);
                Ok(())
            }
            ExecuteMode::Queued => self.handle.post(job),
        }
    }

    fn drain_mailbox(&mut self) {
        while let Some(job) = self.mailbox.try_pop() {
            job.run(self);
        }
    }

    fn handle_raw_messages(&mut self) {
        let mut messages = Vec::new();
        self.mailbox.drain_raw(&mut messages);
        for message in messages {
            if message.id == MSG_SHUTDOWN {
                self.stop.store(true, Ordering::Relaxed);
            } else if let Some(handler) = self.raw_handler {
                handler(self, message);
            } else {
                debug!(worker = self.id, id = message.id, "raw message without handler");
            }
        }
    }

    // ---- shared listener fan-out ---------------------------------------------------------

    fn handle_shared_ready(&mut self) {
        let Some(listener) = self.shared.next_ready() else {
            // Another worker raced us to the event; that is the expected common case.
            return;
        };
        let actions = listener.handle_ready(self);
        self.apply_listener_actions(actions);
    }

    fn apply_listener_actions(&mut self, actions: u32) {
        if actions & ACTION_ACCEPT != 0 {
            self.stats.n_accept += 1;
        }
        if actions & ACTION_READ != 0 {
            self.stats.n_read += 1;
        }
        if actions & ACTION_WRITE != 0 {
            self.stats.n_write += 1;
        }
        if actions & ACTION_HANGUP != 0 {
            self.stats.n_hup += 1;
        }
        if actions & ACTION_ERROR != 0 {
            self.stats.n_error += 1;
        }
    }

    /// Builds the session and client DCB for a socket this worker just accepted.
    ///
    /// # Errors
    ///
    /// Returns `SydError::Io` when the descriptor cannot be registered.
    pub fn accept_client(
        &mut self,
        io: OwnedFd,
        service: &Arc<ServiceConfig>,
        factory: &Arc<dyn ClientHandlerFactory>,
    ) -> SydResult<DcbRef> {
        let session = Session::new(Arc::clone(service));
        let handler = factory.make_client_handler(service);
        let dcb = Dcb::new_client(io, self.id, session.id(), handler);
        session.set_client(Rc::clone(&dcb));
        let session_id = session.id();
        let _ = self.sessions.register(session);
        if let Err(attach_error) = self.attach_dcb(&dcb, Interest::READABLE) {
            let _ = self.sessions.deregister(session_id);
            return Err(attach_error);
        }
        Ok(dcb)
    }

    // ---- DCB registry & dispatch ---------------------------------------------------------

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token = self.next_token.saturating_add(1);
        token
    }

    fn on_owning_thread(&self) -> bool {
        match current_worker_id() {
            Some(id) => id == self.id,
            // Not inside any worker loop: direct construction (tests, bootstrap) is allowed.
            None => true,
        }
    }

    /// Registers a freshly created DCB for readiness events on this worker.
    ///
    /// # Errors
    ///
    /// Returns `SydError::InvalidState` for wrong-worker access and `SydError::Io` when the
    /// kernel rejects the registration.
    pub fn attach_dcb(&mut self, dcb: &DcbRef, interest: Interest) -> SydResult<()> {
        if dcb.borrow().owner() != self.id || !self.on_owning_thread() {
            warn!(worker = self.id, "attach of a DCB owned elsewhere rejected");
            return Err(SydError::InvalidState("dcb is owned by another worker"));
        }
        let token = self.allocate_token();
        let fd = dcb.borrow().fd();
        self.mux.add(fd, interest, Trigger::Edge, token)?;
        {
            let mut dcb = dcb.borrow_mut();
            dcb.set_token(token);
            dcb.set_state(DcbState::Polling);
        }
        let _ = self.targets.insert(token, Rc::clone(dcb));
        let _ = self.dcbs.insert(token, Rc::clone(dcb));
        self.stats.n_fds += 1;
        self.stats.total_fds += 1;
        Ok(())
    }

    /// Inserts a DCB into the live set (registry bookkeeping only).
    ///
    /// # Errors
    ///
    /// Returns `SydError::InvalidState` for wrong-worker access or a double add.
    pub fn add(&mut self, dcb: &DcbRef) -> SydResult<()> {
        if dcb.borrow().owner() != self.id || !self.on_owning_thread() {
            warn!(worker = self.id, "add of a DCB owned elsewhere rejected");
            return Err(SydError::InvalidState("dcb is owned by another worker"));
        }
        let token = dcb.borrow().token();
        if self.dcbs.insert(token, Rc::clone(dcb)).is_some() {
            warn!(worker = self.id, token = token.0, "double add of a DCB rejected");
            return Err(SydError::InvalidState("dcb is already registered"));
        }
        Ok(())
    }

    /// Removes a DCB from the live set (registry bookkeeping only).
    ///
    /// # Errors
    ///
    /// Returns `SydError::InvalidState` for wrong-worker access or an unknown DCB.
    pub fn remove(&mut self, dcb: &DcbRef) -> SydResult<()> {
        if dcb.borrow().owner() != self.id || !self.on_owning_thread() {
            warn!(worker = self.id, "remove of a DCB owned elsewhere rejected");
            return Err(SydError::InvalidState("dcb is owned by another worker"));
        }
        let token = dcb.borrow().token();
        if self.dcbs.remove(&token).is_none() {
            return Err(SydError::InvalidState("dcb is not registered"));
        }
        Ok(())
    }

    /// Queues a DCB for destruction at the end of the current tick.
    pub fn destroy_later(&mut self, dcb: &DcbRef) {
        self.zombies.push(Rc::clone(dcb));
    }

    /// Replaces the readiness interests of a polling DCB (e.g. to arm write events while a
    /// flush is backed up).
    ///
    /// # Errors
    ///
    /// Returns `SydError::InvalidState` when the DCB is not polling, `SydError::Io` when the
    /// kernel rejects the modification.
    pub fn update_interest(&mut self, dcb: &DcbRef, interest: Interest) -> SydResult<()> {
        let (fd, token, state) = {
            let dcb = dcb.borrow();
            (dcb.fd(), dcb.token(), dcb.state())
        };
        if state != DcbState::Polling {
            return Err(SydError::InvalidState("dcb is not polling"));
        }
        self.mux.modify(fd, interest, Trigger::Edge, token)
    }

    /// Number of live DCBs registered on this worker.
    #[must_use]
    pub fn dcb_count(&self) -> usize {
        self.dcbs.len()
    }

    fn deliver_dcb_event(&mut self, snapshot: EventSnapshot) {
        let Some(dcb) = self.targets.get(&snapshot.token).cloned() else {
            return;
        };

        if dcb.borrow().handler_assignment() == HandlerAssignment::Pool {
            // A pool entry must never process protocol traffic.
            if snapshot.hangup {
                dcb.borrow_mut().mark_hanged_up();
                self.stats.n_hup += 1;
            } else {
                self.stats.n_read += 1;
            }
            self.evict_dcb(&dcb);
            return;
        }

        if dcb.borrow().state() == DcbState::Disconnected {
            return;
        }
        if snapshot.hangup {
            dcb.borrow_mut().mark_hanged_up();
        }
        // A callback may close the DCB, or park it in the pool; either way the remaining
        // events of this snapshot must not reach the protocol handler.
        let still_active = |dcb: &DcbRef| {
            let dcb = dcb.borrow();
            !dcb.close_requested()
                && dcb.state() != DcbState::Disconnected
                && dcb.handler_assignment() == HandlerAssignment::Protocol
        };
        let handler = dcb.borrow().protocol();
        if snapshot.readable {
            self.stats.n_read += 1;
            handler.on_read(self, &dcb);
        }
        if snapshot.writable && still_active(&dcb) {
            self.stats.n_write += 1;
            handler.on_write_ready(self, &dcb);
        }
        if snapshot.error && still_active(&dcb) {
            self.stats.n_error += 1;
            handler.on_error(self, &dcb);
        }
        if snapshot.hangup && still_active(&dcb) {
            self.stats.n_hup += 1;
            handler.on_hangup(self, &dcb);
        }
    }

    /// Synthesizes a hangup for a DCB, delivered through the normal handler path.
    pub fn trigger_hangup(&mut self, token: Token) {
        self.deliver_dcb_event(EventSnapshot::hangup_only(token));
    }

    // ---- close path ----------------------------------------------------------------------

    /// Requests the logical close of a DCB. Backend DCBs may enter the persistent pool
    /// instead of being destroyed; everything else lands in the zombie queue.
    pub fn close_dcb(&mut self, dcb: &DcbRef) {
        {
            let dcb = dcb.borrow();
            if dcb.close_requested() || dcb.state() == DcbState::Disconnected {
                return;
            }
        }
        dcb.borrow_mut().set_close_requested(true);
        let role = dcb.borrow().role();
        if role == DcbRole::Backend && !self.can_be_destroyed(dcb) {
            // Parked in the pool; it is live again from the pool's point of view.
            return;
        }
        self.destroy_later(dcb);
    }

    fn destroy_dcb(&mut self, dcb: &DcbRef) {
        let (token, role, state, fd, session_id, server, counted) = {
            let dcb = dcb.borrow();
            (
                dcb.token(),
                dcb.role(),
                dcb.state(),
                dcb.fd(),
                dcb.session(),
                dcb.server().cloned(),
                dcb.counted_on_server(),
            )
        };
        if state == DcbState::Disconnected {
            return;
        }
        if state == DcbState::Polling {
            let _ = self.mux.remove(fd);
        }
        if self.targets.remove(&token).is_some() {
            self.stats.n_fds -= 1;
        }
        let _ = self.dcbs.remove(&token);
        dcb.borrow_mut().set_state(DcbState::Disconnected);

        match role {
            DcbRole::Backend => {
                if counted && let Some(server) = server {
                    server.decr_current();
                    dcb.borrow_mut().set_counted_on_server(false);
                }
                if let Some(session_id) = session_id
                    && let Some(session) = self.sessions.lookup(session_id)
                {
                    session.unlink_backend(token);
                }
            }
            DcbRole::Client => {
                if let Some(session_id) = session_id
                    && let Some(session) = self.sessions.lookup(session_id)
                {
                    if session.close_reason() == CloseReason::None {
                        session.set_close_reason(CloseReason::ClientGone);
                    }
                    // Closing the session's backends may push them into the pool or enqueue
                    // further zombies; both are handled by the pop-until-empty drain.
                    for backend_token in session.linked_backends() {
                        if let Some(backend) = self.targets.get(&backend_token).cloned() {
                            self.close_dcb(&backend);
                        }
                    }
                    session.clear_client();
                    let _ = self.sessions.deregister(session_id);
                }
            }
            DcbRole::Internal => {}
        }
    }

    fn delete_zombies(&mut self) {
        // Not a snapshot iteration: destroying a DCB may enqueue further zombies.
        while let Some(dcb) = self.zombies.pop() {
            self.destroy_dcb(&dcb);
        }
    }

    fn disable_events(&mut self, dcb: &DcbRef) {
        let (fd, state) = {
            let dcb = dcb.borrow();
            (dcb.fd(), dcb.state())
        };
        if state == DcbState::Polling {
            let _ = self.mux.remove(fd);
            dcb.borrow_mut().set_state(DcbState::NoPolling);
        }
    }

    // ---- persistent pool -----------------------------------------------------------------

    /// Hands out a backend connection for `session`, reusing a pooled one when possible.
    ///
    /// # Errors
    ///
    /// Returns `SydError::Io` when no pooled connection is usable and a fresh connect fails.
    pub fn get_backend(
        &mut self,
        server: &Arc<ServerTarget>,
        session: SessionId,
        upstream: &UpstreamRef,
    ) -> SydResult<DcbRef> {
        if server.pooling_enabled()
            && server.is_running()
            && let Some(dcb) = self.backend_from_pool(server, session, upstream)
        {
            return Ok(dcb);
        }
        self.connect_backend(server, session)
    }

    fn backend_from_pool(
        &mut self,
        server: &Arc<ServerTarget>,
        session: SessionId,
        upstream: &UpstreamRef,
    ) -> Option<DcbRef> {
        let _ = self.evict_expired(server);

        loop {
            let entry = self
                .pool
                .get_mut(&server_key(server))
                .and_then(|shelf| shelf.entries.pop_front())?;
            server.release_pool_slot();
            let dcb = entry.into_dcb();
            let token = dcb.borrow().token();
            {
                let mut dcb = dcb.borrow_mut();
                dcb.set_handler_assignment(HandlerAssignment::Protocol);
                dcb.bind_session(session);
            }
            if let Some(session) = self.sessions.lookup(session) {
                session.link_backend(token);
            }

            let handler = dcb.borrow().protocol();
            if handler.reuse_connection(self, &dcb, upstream) {
                server.note_reuse_from_pool();
                server.incr_current();
                dcb.borrow_mut().set_counted_on_server(true);
                // Back into the regular book-keeping.
                let _ = self.dcbs.insert(token, Rc::clone(&dcb));
                return Some(dcb);
            }

            warn!(server = server.name(), "failed to reuse a pooled connection");
            if let Some(session) = self.sessions.lookup(session) {
                session.unlink_backend(token);
            }
            self.evicting = true;
            if dcb.borrow().state() == DcbState::Polling {
                self.disable_events(&dcb);
                dcb.borrow().shutdown_socket();
            }
            self.close_dcb(&dcb);
            self.evicting = false;
        }
    }

    fn connect_backend(
        &mut self,
        server: &Arc<ServerTarget>,
        session: SessionId,
    ) -> SydResult<DcbRef> {
        let stream = std::net::TcpStream::connect(server.address()).map_err(|connect_error| {
            SydError::Io(format!(
                "connect to {} failed: {connect_error}",
                server.name()
            ))
        })?;
        stream
            .set_nonblocking(true)
            .map_err(|error| SydError::Io(format!("set backend nonblocking failed: {error}")))?;
        let _ = stream.set_nodelay(true);

        let handler = server.make_backend_handler();
        let dcb = Dcb::new_backend(
            OwnedFd::from(stream),
            self.id,
            session,
            Arc::clone(server),
            handler,
        );
        self.attach_dcb(&dcb, Interest::READABLE)?;
        server.incr_current();
        dcb.borrow_mut().set_counted_on_server(true);
        if let Some(session) = self.sessions.lookup(session) {
            session.link_backend(dcb.borrow().token());
        }
        Ok(dcb)
    }

    /// Decides whether a closing backend DCB is destroyed or parked in the pool.
    ///
    /// Returns `false` when the DCB entered the pool and must not be destroyed.
    pub(crate) fn can_be_destroyed(&mut self, dcb: &DcbRef) -> bool {
        if self.evicting {
            return true;
        }
        let Some(server) = dcb.borrow().server().cloned() else {
            return true;
        };

        let pool_max = server.pool_max_count();
        let eligible = {
            let state_ok = dcb.borrow().state() == DcbState::Polling;
            let established = dcb.borrow().protocol().established();
            let session_ok = dcb
                .borrow()
                .session()
                .and_then(|id| self.sessions.lookup(id))
                .is_some_and(|session| session.pooling_permitted());
            state_ok
                && established
                && session_ok
                && pool_max > 0
                && server.pool_max_age() > 0
                && server.is_running()
                && !dcb.borrow().hanged_up()
        };
        if !eligible || self.evict_expired(&server) >= pool_max as usize {
            return true;
        }
        if !server.try_reserve_pool_slot() {
            return true;
        }

        // Reset per-session protocol state and swap in the pool sentinel.
        dcb.borrow().protocol().clear();
        let token = dcb.borrow().token();
        if let Some(session_id) = dcb.borrow().session()
            && let Some(session) = self.sessions.lookup(session_id)
        {
            session.unlink_backend(token);
        }
        {
            let mut dcb = dcb.borrow_mut();
            dcb.clear_session();
            dcb.set_handler_assignment(HandlerAssignment::Pool);
            dcb.set_close_requested(false);
        }
        let shelf = self
            .pool
            .entry(server_key(&server))
            .or_insert_with(|| PoolShelf::new(Arc::clone(&server)));
        shelf.entries.push_back(PersistentEntry::new(Rc::clone(dcb)));

        // Out of the live set; the dispatch table keeps it so activity can evict it.
        let _ = self.dcbs.remove(&token);
        if dcb.borrow().counted_on_server() {
            server.decr_current();
            dcb.borrow_mut().set_counted_on_server(false);
        }
        false
    }

    /// Flushes expired, hung-up and over-cap entries for one server; returns the kept count.
    pub fn evict_expired(&mut self, server: &Arc<ServerTarget>) -> usize {
        self.evict_pool_entries(server, Evict::Expired)
    }

    /// Applies `evict` to every server shelf of this worker.
    pub fn evict_pooled(&mut self, evict: Evict) {
        let servers: Vec<Arc<ServerTarget>> = self
            .pool
            .values()
            .map(|shelf| Arc::clone(&shelf.server))
            .collect();
        for server in servers {
            let _ = self.evict_pool_entries(&server, evict);
        }
    }

    fn evict_pool_entries(&mut self, server: &Arc<ServerTarget>, evict: Evict) -> usize {
        debug_assert!(!self.evicting);
        self.evicting = true;

        let now = clock::monotonic_secs();
        let evict = if server.is_running() { evict } else { Evict::All };
        let max_age = i64::try_from(server.pool_max_age()).unwrap_or(i64::MAX);
        let pool_max = server.pool_max_count() as usize;

        let mut kept = 0_usize;
        let mut to_close: Vec<DcbRef> = Vec::new();
        if let Some(shelf) = self.pool.get_mut(&server_key(server)) {
            let mut remaining = std::collections::VecDeque::with_capacity(shelf.entries.len());
            while let Some(entry) = shelf.entries.pop_front() {
                let hanged_up = entry.hanged_up();
                let expired =
                    evict == Evict::All || max_age == 0 || now - entry.created() > max_age;
                let too_many = kept >= pool_max;
                if hanged_up || expired || too_many {
                    server.release_pool_slot();
                    to_close.push(entry.into_dcb());
                } else {
                    kept += 1;
                    remaining.push_back(entry);
                }
            }
            shelf.entries = remaining;
        }
        server.note_persist_high_water(i64::try_from(kept).unwrap_or(i64::MAX));

        for dcb in to_close {
            self.close_pooled_dcb(&dcb);
        }
        self.evicting = false;
        kept
    }

    /// Evicts one pooled DCB after spurious activity and closes it.
    pub(crate) fn evict_dcb(&mut self, dcb: &DcbRef) {
        debug_assert!(!self.evicting);
        self.evicting = true;

        if let Some(server) = dcb.borrow().server().cloned()
            && let Some(shelf) = self.pool.get_mut(&server_key(&server))
            && let Some(position) = shelf
                .entries
                .iter()
                .position(|entry| Rc::ptr_eq(entry.dcb(), dcb))
        {
            let _ = shelf.entries.remove(position);
            server.release_pool_slot();
        }
        self.close_pooled_dcb(dcb);
        self.evicting = false;
    }

    fn close_pooled_dcb(&mut self, dcb: &DcbRef) {
        debug_assert!(self.evicting);
        let token = dcb.borrow().token();
        // Back into the live set for the duration of the close so bookkeeping stays symmetric.
        let _ = self.dcbs.insert(token, Rc::clone(dcb));
        dcb.borrow_mut()
            .set_handler_assignment(HandlerAssignment::Protocol);
        if dcb.borrow().state() == DcbState::Polling {
            self.disable_events(dcb);
            dcb.borrow().shutdown_socket();
        }
        self.close_dcb(dcb);
    }

    /// Pooled entries for one server on this worker.
    #[must_use]
    pub fn pool_entry_count(&self, server: &Arc<ServerTarget>) -> usize {
        self.pool
            .get(&server_key(server))
            .map_or(0, |shelf| shelf.entries.len())
    }

    #[cfg(test)]
    pub(crate) fn backdate_pool_entries(&mut self, server: &Arc<ServerTarget>, secs: i64) {
        if let Some(shelf) = self.pool.get_mut(&server_key(server)) {
            for entry in &mut shelf.entries {
                entry.backdate(secs);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pool_front_dcb(&self, server: &Arc<ServerTarget>) -> Option<DcbRef> {
        self.pool
            .get(&server_key(server))
            .and_then(|shelf| shelf.entries.front())
            .map(|entry| Rc::clone(entry.dcb()))
    }

    // ---- tick ----------------------------------------------------------------------------

    fn tick(&mut self) {
        self.process_timeouts();
        self.delete_zombies();
        self.run_tick_hooks();
    }

    /// Disconnects clients that have been idle, or stuck writing, for too long.
    ///
    /// Timeout resolution is one second, so the scan runs on every tenth tick. The configured
    /// second values are compared against 100 ms ticks, hence the factor of ten.
    fn process_timeouts(&mut self) {
        let now = clock::ticks();
        if now < self.next_timeout_check {
            return;
        }
        self.next_timeout_check = now + TIMEOUT_CHECK_INTERVAL_TICKS;

        let mut victims: Vec<Token> = Vec::new();
        for (token, dcb) in &self.dcbs {
            let dcb = dcb.borrow();
            if dcb.role() != DcbRole::Client || dcb.state() != DcbState::Polling {
                continue;
            }
            let Some(session) = dcb.session().and_then(|id| self.sessions.lookup(id)) else {
                continue;
            };
            let service = session.service();

            if service.conn_idle_timeout > 0 {
                let idle = now - dcb.last_read();
                let limit = i64::try_from(service.conn_idle_timeout).unwrap_or(i64::MAX) * 10;
                if idle > limit {
                    warn!(
                        service = service.name.as_str(),
                        session = session.id(),
                        idle_secs = idle / 10,
                        "closing idle client connection"
                    );
                    session.set_close_reason(CloseReason::Timeout);
                    victims.push(*token);
                    continue;
                }
            }

            if service.net_write_timeout > 0 && dcb.writeq_len() > 0 {
                let stalled = now - dcb.last_write();
                let limit = i64::try_from(service.net_write_timeout).unwrap_or(i64::MAX) * 10;
                if stalled > limit {
                    warn!(
                        service = service.name.as_str(),
                        session = session.id(),
                        "network write timed out for client connection"
                    );
                    session.set_close_reason(CloseReason::Timeout);
                    victims.push(*token);
                }
            }
        }

        for token in victims {
            self.trigger_hangup(token);
        }
    }

    fn run_tick_hooks(&mut self) {
        if self.tick_hooks.is_empty() {
            return;
        }
        let mut hooks = std::mem::take(&mut self.tick_hooks);
        for hook in &mut hooks {
            hook(self);
        }
        let added = std::mem::replace(&mut self.tick_hooks, hooks);
        self.tick_hooks.extend(added);
    }

    #[cfg(test)]
    pub(crate) fn zombie_count(&self) -> usize {
        self.zombies.len()
    }

    #[cfg(test)]
    pub(crate) fn force_timeout_scan(&mut self) {
        self.next_timeout_check = clock::ticks();
    }
}

//! Sessions and the per-worker session registry.
//!
//! A session is owned by its client DCB's worker and never leaves it. Backend DCBs reference
//! their session weakly, by id, and re-resolve it through the owning worker's registry; there is
//! no global registry, so looking a session up on the wrong worker finds nothing.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use syd_common::config::ServiceConfig;
use syd_common::ids::SessionId;

use crate::dcb::DcbRef;
use crate::multiplexer::Token;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique session id.
#[must_use]
pub fn allocate_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Why a session ended, recorded before the close is delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CloseReason {
    #[default]
    None,
    Timeout,
    ClientGone,
    KilledByAdmin,
}

/// One client session, pinned to the worker that accepted it.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    service: Arc<ServiceConfig>,
    close_reason: Cell<CloseReason>,
    pooling_permitted: Cell<bool>,
    client: RefCell<Option<DcbRef>>,
    backends: RefCell<Vec<Token>>,
}

/// Shared handle to a session inside its owning worker.
pub type SessionRef = Rc<Session>;

impl Session {
    /// Creates a session for `service` with a fresh id.
    #[must_use]
    pub fn new(service: Arc<ServiceConfig>) -> SessionRef {
        Rc::new(Self {
            id: allocate_session_id(),
            service,
            close_reason: Cell::new(CloseReason::None),
            pooling_permitted: Cell::new(true),
            client: RefCell::new(None),
            backends: RefCell::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn service(&self) -> &Arc<ServiceConfig> {
        &self.service
    }

    #[must_use]
    pub fn close_reason(&self) -> CloseReason {
        self.close_reason.get()
    }

    pub fn set_close_reason(&self, reason: CloseReason) {
        self.close_reason.set(reason);
    }

    /// Whether backend connections of this session may enter the persistent pool.
    #[must_use]
    pub fn pooling_permitted(&self) -> bool {
        self.pooling_permitted.get()
    }

    /// Marks the session's backends as non-poolable (protocol state beyond reset).
    pub fn forbid_pooling(&self) {
        self.pooling_permitted.set(false);
    }

    /// Binds the owning client DCB. The session holds the only long-lived strong reference.
    pub fn set_client(&self, dcb: DcbRef) {
        *self.client.borrow_mut() = Some(dcb);
    }

    #[must_use]
    pub fn client(&self) -> Option<DcbRef> {
        self.client.borrow().clone()
    }

    pub fn clear_client(&self) {
        *self.client.borrow_mut() = None;
    }

    /// Records a backend DCB opened on this session's behalf.
    pub fn link_backend(&self, token: Token) {
        let mut backends = self.backends.borrow_mut();
        if !backends.contains(&token) {
            backends.push(token);
        }
    }

    pub fn unlink_backend(&self, token: Token) {
        self.backends.borrow_mut().retain(|linked| *linked != token);
    }

    #[must_use]
    pub fn linked_backends(&self) -> Vec<Token> {
        self.backends.borrow().clone()
    }
}

/// Per-worker map from session id to session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, SessionRef>,
}

impl SessionRegistry {
    /// Registers a session; returns whether the id was new.
    pub fn register(&mut self, session: SessionRef) -> bool {
        let id = session.id();
        self.sessions.insert(id, session).is_none()
    }

    /// Removes a session by id.
    pub fn deregister(&mut self, id: SessionId) -> Option<SessionRef> {
        self.sessions.remove(&id)
    }

    /// Looks a session up on this worker.
    #[must_use]
    pub fn lookup(&self, id: SessionId) -> Option<SessionRef> {
        self.sessions.get(&id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

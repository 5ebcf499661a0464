//! Persistent-connection pool data model.
//!
//! Each worker keeps one shelf of idle, authenticated backend connections per server. Reuse is
//! FIFO (push back, pop front) so long-idle connections are handed out before they can rot past
//! the age limit; the eviction scan walks front to back for the same reason. The pool
//! *operations* live on [`crate::worker::Worker`], keeping all mutation single-writer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::clock;
use crate::dcb::DcbRef;
use crate::server::ServerTarget;

/// Eviction scope for a pool scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evict {
    /// Remove entries that are hung up, over age, or beyond the pool cap.
    Expired,
    /// Remove every entry (server down, worker shutdown).
    All,
}

/// One idle backend connection resting in the pool.
#[derive(Debug)]
pub struct PersistentEntry {
    created: i64,
    dcb: DcbRef,
}

impl PersistentEntry {
    #[must_use]
    pub fn new(dcb: DcbRef) -> Self {
        Self {
            created: clock::monotonic_secs(),
            dcb,
        }
    }

    /// Monotonic second the entry was pooled at.
    #[must_use]
    pub fn created(&self) -> i64 {
        self.created
    }

    #[must_use]
    pub fn dcb(&self) -> &DcbRef {
        &self.dcb
    }

    #[must_use]
    pub fn hanged_up(&self) -> bool {
        self.dcb.borrow().hanged_up()
    }

    pub fn into_dcb(self) -> DcbRef {
        self.dcb
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, secs: i64) {
        self.created -= secs;
    }
}

/// Pointer-identity key for one server within a worker's pool map.
pub(crate) type ServerKey = usize;

pub(crate) fn server_key(server: &Arc<ServerTarget>) -> ServerKey {
    Arc::as_ptr(server) as ServerKey
}

/// Per-server slice of one worker's pool.
#[derive(Debug)]
pub(crate) struct PoolShelf {
    pub(crate) server: Arc<ServerTarget>,
    pub(crate) entries: VecDeque<PersistentEntry>,
}

impl PoolShelf {
    pub(crate) fn new(server: Arc<ServerTarget>) -> Self {
        Self {
            server,
            entries: VecDeque::new(),
        }
    }
}

/// One worker's complete pool: server identity to shelf.
pub(crate) type PoolMap = HashMap<ServerKey, PoolShelf>;

//! Backend server abstraction consumed by the worker runtime.
//!
//! The runtime sees a server as an address, a running flag, the persistent-pool knobs and a set
//! of shared counters. Counters are mutated with relaxed atomics from every worker; the pooled
//! count uses a compare-and-swap bounded increment so the per-server cap holds without a lock
//! (a plain fetch-add with fix-up races against concurrent releases).

use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use syd_common::config::ServerPoolConfig;

use crate::dcb::ProtocolHandler;

/// Shared persistent-pool counters for one server.
#[derive(Debug, Default)]
pub struct PoolStats {
    n_persistent: AtomicI64,
    n_from_pool: AtomicU64,
    persist_high_water: AtomicI64,
}

impl PoolStats {
    /// Pooled connections across all workers.
    #[must_use]
    pub fn n_persistent(&self) -> i64 {
        self.n_persistent.load(Ordering::Relaxed)
    }

    /// Connections handed out of the pool since startup.
    #[must_use]
    pub fn n_from_pool(&self) -> u64 {
        self.n_from_pool.load(Ordering::Relaxed)
    }

    /// Highest per-scan pooled count observed.
    #[must_use]
    pub fn persist_high_water(&self) -> i64 {
        self.persist_high_water.load(Ordering::Relaxed)
    }
}

/// Creates the protocol handler for a backend connection to one server.
///
/// Implemented by the protocol layer; invoked on the worker that owns the new connection.
pub trait BackendHandlerFactory: Send + Sync {
    fn make_backend_handler(&self, server: &Arc<ServerTarget>) -> Rc<dyn ProtocolHandler>;
}

/// One backend server as the runtime sees it.
pub struct ServerTarget {
    name: String,
    address: SocketAddr,
    running: AtomicBool,
    pool_config: ServerPoolConfig,
    pool_stats: PoolStats,
    n_current: AtomicI64,
    factory: Arc<dyn BackendHandlerFactory>,
}

impl std::fmt::Debug for ServerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTarget")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("running", &self.is_running())
            .field("pool_config", &self.pool_config)
            .finish()
    }
}

impl ServerTarget {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        address: SocketAddr,
        pool_config: ServerPoolConfig,
        factory: Arc<dyn BackendHandlerFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            address,
            running: AtomicBool::new(true),
            pool_config,
            pool_stats: PoolStats::default(),
            n_current: AtomicI64::new(0),
            factory,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Monitor hook: flips the running state.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    /// Maximum pooled connections per worker; zero disables pooling.
    #[must_use]
    pub fn pool_max_count(&self) -> u32 {
        self.pool_config.persist_pool_max
    }

    /// Maximum age in seconds of a pooled connection.
    #[must_use]
    pub fn pool_max_age(&self) -> u64 {
        self.pool_config.persist_max_time
    }

    #[must_use]
    pub fn pooling_enabled(&self) -> bool {
        self.pool_config.persist_pool_max > 0
    }

    #[must_use]
    pub fn pool_stats(&self) -> &PoolStats {
        &self.pool_stats
    }

    /// Established connections currently serving sessions.
    #[must_use]
    pub fn n_current(&self) -> i64 {
        self.n_current.load(Ordering::Relaxed)
    }

    pub(crate) fn incr_current(&self) {
        let _ = self.n_current.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decr_current(&self) {
        let _ = self.n_current.fetch_sub(1, Ordering::Relaxed);
    }

    /// Bounded increment of the pooled count: succeeds only while the result stays within
    /// `pool_max_count`.
    pub(crate) fn try_reserve_pool_slot(&self) -> bool {
        let limit = i64::from(self.pool_config.persist_pool_max);
        let mut seen = self.pool_stats.n_persistent.load(Ordering::Relaxed);
        loop {
            if seen >= limit {
                return false;
            }
            match self.pool_stats.n_persistent.compare_exchange_weak(
                seen,
                seen + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => seen = current,
            }
        }
    }

    pub(crate) fn release_pool_slot(&self) {
        let _ = self.pool_stats.n_persistent.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn note_reuse_from_pool(&self) {
        let _ = self.pool_stats.n_from_pool.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_persist_high_water(&self, count: i64) {
        let _ = self
            .pool_stats
            .persist_high_water
            .fetch_max(count, Ordering::Relaxed);
    }

    pub(crate) fn make_backend_handler(self: &Arc<Self>) -> Rc<dyn ProtocolHandler> {
        Arc::clone(&self.factory).make_backend_handler(self)
    }
}

#[cfg(test)]
mod tests {
    use super::{BackendHandlerFactory, ServerTarget};
    use crate::dcb::{DcbRef, ProtocolHandler};
    use crate::worker::Worker;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::net::SocketAddr;
    use std::rc::Rc;
    use std::sync::Arc;
    use syd_common::config::ServerPoolConfig;

    struct NullHandler;

    impl ProtocolHandler for NullHandler {
        fn on_read(&self, _worker: &mut Worker, _dcb: &DcbRef) {}
        fn on_write_ready(&self, _worker: &mut Worker, _dcb: &DcbRef) {}
        fn on_error(&self, _worker: &mut Worker, _dcb: &DcbRef) {}
        fn on_hangup(&self, _worker: &mut Worker, _dcb: &DcbRef) {}
    }

    struct NullFactory;

    impl BackendHandlerFactory for NullFactory {
        fn make_backend_handler(&self, _server: &Arc<ServerTarget>) -> Rc<dyn ProtocolHandler> {
            Rc::new(NullHandler)
        }
    }

    pub(crate) fn test_server(pool_max: u32, max_age: u64) -> Arc<ServerTarget> {
        let address: SocketAddr = "127.0.0.1:0".parse().expect("literal address must parse");
        ServerTarget::new(
            "db-0",
            address,
            ServerPoolConfig {
                persist_pool_max: pool_max,
                persist_max_time: max_age,
            },
            Arc::new(NullFactory),
        )
    }

    #[rstest]
    fn bounded_increment_respects_the_cap() {
        let server = test_server(2, 60);
        assert_that!(server.try_reserve_pool_slot(), eq(true));
        assert_that!(server.try_reserve_pool_slot(), eq(true));
        assert_that!(server.try_reserve_pool_slot(), eq(false));
        assert_that!(server.pool_stats().n_persistent(), eq(2_i64));

        server.release_pool_slot();
        assert_that!(server.try_reserve_pool_slot(), eq(true));
    }

    #[rstest]
    fn bounded_increment_holds_under_contention() {
        let server = test_server(8, 60);
        let mut joins = Vec::new();
        for _ in 0..4 {
            let server = Arc::clone(&server);
            joins.push(std::thread::spawn(move || {
                let mut reserved = 0_usize;
                for _ in 0..100 {
                    if server.try_reserve_pool_slot() {
                        reserved += 1;
                    }
                }
                reserved
            }));
        }
        let reserved: usize = joins
            .into_iter()
            .map(|join| join.join().expect("reserver thread must not panic"))
            .sum();
        assert_that!(reserved, eq(8_usize));
        assert_that!(server.pool_stats().n_persistent(), eq(8_i64));
    }

    #[rstest]
    fn zero_cap_disables_pooling() {
        let server = test_server(0, 60);
        assert_that!(server.pooling_enabled(), eq(false));
        assert_that!(server.try_reserve_pool_slot(), eq(false));
    }

    #[rstest]
    fn high_water_mark_keeps_the_maximum() {
        let server = test_server(4, 60);
        server.note_persist_high_water(2);
        server.note_persist_high_water(1);
        assert_that!(server.pool_stats().persist_high_water(), eq(2_i64));
    }
}

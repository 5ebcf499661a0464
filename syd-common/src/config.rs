//! Runtime configuration shared by process bootstrap code.

use crate::ids::WorkerCount;

/// Bootstrap configuration used by `syd-server` during process startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of routing worker threads (`threadcount`).
    pub thread_count: WorkerCount,
    /// Upper bound of readiness events drained per `wait` call.
    pub max_events: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_count: WorkerCount::new(4).expect("literal thread count must be non-zero"),
            max_events: 1024,
        }
    }
}

/// Per-service settings the timeout scanner reads.
///
/// Timeouts are in seconds; zero disables the corresponding check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Service name used in disconnect logs.
    pub name: String,
    /// Seconds a client connection may stay idle before it is disconnected (`conn_idle_timeout`).
    pub conn_idle_timeout: u64,
    /// Seconds an unflushed write may linger before the client is disconnected
    /// (`net_write_timeout`).
    pub net_write_timeout: u64,
}

impl ServiceConfig {
    /// Creates a service config with both timeouts disabled.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            conn_idle_timeout: 0,
            net_write_timeout: 0,
        }
    }
}

/// Per-server persistent-pool settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerPoolConfig {
    /// Maximum pooled connections per worker (`persist_pool_max`); zero disables pooling.
    pub persist_pool_max: u32,
    /// Maximum age in seconds of a pooled connection (`persist_max_time`).
    pub persist_max_time: u64,
}

#[cfg(test)]
mod tests {
    use super::{RuntimeConfig, ServiceConfig};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn default_runtime_config_has_workers() {
        let config = RuntimeConfig::default();
        assert_that!(config.thread_count.get() > 0, eq(true));
    }

    #[rstest]
    fn new_service_config_disables_timeouts() {
        let service = ServiceConfig::new("read-split");
        assert_that!(service.conn_idle_timeout, eq(0_u64));
        assert_that!(service.net_write_timeout, eq(0_u64));
    }
}

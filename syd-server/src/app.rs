//! Process bootstrap: configuration, logging, worker pool and listener wiring.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use syd_common::config::{RuntimeConfig, ServerPoolConfig, ServiceConfig};
use syd_common::error::{SydError, SydResult};
use syd_common::ids::WorkerCount;
use syd_runtime::listener::Listener;
use syd_runtime::modules::ModuleRegistry;
use syd_runtime::runtime::WorkerPool;
use syd_runtime::server::ServerTarget;

use crate::relay::{RelayBackendFactory, RelayClientFactory};

/// Everything the proxy needs to come up.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub runtime: RuntimeConfig,
    pub listen: SocketAddr,
    pub backend: SocketAddr,
    pub service: ServiceConfig,
    pub pool: ServerPoolConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            listen: SocketAddr::from(([127, 0, 0, 1], 4006)),
            backend: SocketAddr::from(([127, 0, 0, 1], 3306)),
            service: ServiceConfig::new("relay-service"),
            pool: ServerPoolConfig {
                persist_pool_max: 8,
                persist_max_time: 300,
            },
        }
    }
}

impl AppConfig {
    /// Resolves the config from `SYD_*` environment variables over the defaults.
    ///
    /// Recognized: `SYD_THREADCOUNT`, `SYD_LISTEN`, `SYD_BACKEND`, `SYD_CONN_IDLE_TIMEOUT`,
    /// `SYD_NET_WRITE_TIMEOUT`, `SYD_PERSIST_POOL_MAX`, `SYD_PERSIST_MAX_TIME`.
    ///
    /// # Errors
    ///
    /// Returns `SydError::InvalidConfig` for unparseable values.
    pub fn from_env() -> SydResult<Self> {
        let mut config = Self::default();
        if let Some(threads) = read_env("SYD_THREADCOUNT")? {
            let threads: usize = threads;
            config.runtime.thread_count = WorkerCount::new(threads)
                .ok_or(SydError::InvalidConfig("threadcount must be positive"))?;
        }
        if let Some(listen) = read_env("SYD_LISTEN")? {
            config.listen = listen;
        }
        if let Some(backend) = read_env("SYD_BACKEND")? {
            config.backend = backend;
        }
        if let Some(idle) = read_env("SYD_CONN_IDLE_TIMEOUT")? {
            config.service.conn_idle_timeout = idle;
        }
        if let Some(write) = read_env("SYD_NET_WRITE_TIMEOUT")? {
            config.service.net_write_timeout = write;
        }
        if let Some(pool_max) = read_env("SYD_PERSIST_POOL_MAX")? {
            config.pool.persist_pool_max = pool_max;
        }
        if let Some(max_time) = read_env("SYD_PERSIST_MAX_TIME")? {
            config.pool.persist_max_time = max_time;
        }
        Ok(config)
    }
}

fn read_env<T: std::str::FromStr>(key: &'static str) -> SydResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| SydError::InvalidConfig(key)),
        Err(_) => Ok(None),
    }
}

/// A bootstrapped proxy: started worker pool plus its listener and backend target.
pub struct App {
    pool: WorkerPool,
    listen_addr: SocketAddr,
    server: Arc<ServerTarget>,
}

impl App {
    /// Builds and starts the runtime for `config`.
    ///
    /// # Errors
    ///
    /// Propagates pool init, listener bind and worker start failures; nothing keeps running
    /// when an error is returned.
    pub fn bootstrap(config: &AppConfig) -> SydResult<Self> {
        let server = ServerTarget::new(
            "backend",
            config.backend,
            config.pool,
            Arc::new(RelayBackendFactory),
        );
        let mut pool = WorkerPool::init(&config.runtime, ModuleRegistry::new())?;
        let listener = Listener::bind(
            config.listen,
            Arc::new(config.service.clone()),
            Arc::new(RelayClientFactory::new(Arc::clone(&server))),
        )?;
        let listen_addr = listener.local_addr()?;
        pool.add_listener(listener)?;
        pool.start()?;

        info!(
            workers = config.runtime.thread_count.get(),
            listen = %listen_addr,
            backend = %config.backend,
            "switchyard is accepting connections"
        );
        Ok(Self {
            pool,
            listen_addr,
            server,
        })
    }

    /// Address the proxy listens on (useful with an ephemeral port).
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    #[must_use]
    pub fn server(&self) -> &Arc<ServerTarget> {
        &self.server
    }

    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Blocks until the worker pool shuts down.
    pub fn wait(mut self) {
        self.pool.join();
    }
}

/// Binary entrypoint body: resolve config, install logging, run until shutdown.
///
/// # Errors
///
/// Returns the first bootstrap failure; the process exits nonzero.
pub fn run() -> SydResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let config = AppConfig::from_env()?;
    let app = App::bootstrap(&config)?;
    app.wait();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{App, AppConfig};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::time::{Duration, Instant};
    use syd_common::config::ServerPoolConfig;
    use syd_common::ids::WorkerCount;

    /// Echo server standing in for the backend database.
    fn spawn_echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").expect("echo backend must bind");
        let address = listener
            .local_addr()
            .expect("echo backend address must be available");
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                std::thread::spawn(move || {
                    let mut chunk = [0_u8; 4096];
                    loop {
                        match stream.read(&mut chunk) {
                            Ok(0) | Err(_) => return,
                            Ok(read_len) => {
                                if stream.write_all(&chunk[..read_len]).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        address
    }

    fn single_worker_config(backend: SocketAddr) -> AppConfig {
        let mut config = AppConfig::default();
        config.runtime.thread_count =
            WorkerCount::new(1).expect("literal worker count must be non-zero");
        config.listen = "127.0.0.1:0".parse().expect("literal address must parse");
        config.backend = backend;
        config.pool = ServerPoolConfig {
            persist_pool_max: 4,
            persist_max_time: 60,
        };
        config
    }

    fn roundtrip(address: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(address).expect("client connect must succeed");
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("read timeout must be configurable");
        client.write_all(payload).expect("client write must succeed");
        let mut reply = vec![0_u8; payload.len()];
        client
            .read_exact(&mut reply)
            .expect("relayed reply must arrive");
        reply
    }

    #[rstest]
    fn relay_round_trips_bytes_and_reuses_the_pooled_backend() {
        let backend = spawn_echo_backend();
        let app = App::bootstrap(&single_worker_config(backend))
            .expect("app bootstrap must succeed");

        let reply = roundtrip(app.listen_addr(), b"select 1");
        assert_that!(&reply, eq(&b"select 1".to_vec()));

        // The session ended, so its backend connection must reach the pool.
        let deadline = Instant::now() + Duration::from_secs(3);
        while app.server().pool_stats().n_persistent() < 1 {
            assert_that!(Instant::now() < deadline, eq(true));
            std::thread::sleep(Duration::from_millis(10));
        }

        let reply = roundtrip(app.listen_addr(), b"select 2");
        assert_that!(&reply, eq(&b"select 2".to_vec()));

        let deadline = Instant::now() + Duration::from_secs(3);
        while app.server().pool_stats().n_from_pool() < 1 {
            assert_that!(Instant::now() < deadline, eq(true));
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_that!(app.server().pool_stats().n_from_pool() >= 1, eq(true));

        app.pool().shutdown_all();
        app.wait();
    }

    #[rstest]
    fn config_defaults_are_usable() {
        let config = AppConfig::default();
        assert_that!(config.runtime.thread_count.get() > 0, eq(true));
        assert_that!(config.pool.persist_pool_max > 0, eq(true));
    }
}

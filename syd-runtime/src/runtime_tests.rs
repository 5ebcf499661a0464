//! Cross-component tests driving workers from the test thread (`poll_once`) or as a started
//! pool over real sockets.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use googletest::prelude::*;
use rstest::rstest;

use syd_common::config::{RuntimeConfig, ServiceConfig};
use syd_common::ids::WorkerCount;

use crate::dcb::{DcbState, UpstreamRef};
use crate::listener::Listener;
use crate::mailbox::{Job, MSG_SHUTDOWN, WorkerTask};
use crate::modules::ModuleRegistry;
use crate::pool::Evict;
use crate::runtime::WorkerPool;
use crate::session::CloseReason;
use crate::testutil::{
    EchoClientFactory, TestUpstream, attach_probe_backend, attach_probe_client, probe_server,
    test_session, test_worker,
};
use crate::worker::Worker;

fn upstream() -> UpstreamRef {
    Rc::new(TestUpstream)
}

fn unused_address() -> SocketAddr {
    "127.0.0.1:9".parse().expect("literal address must parse")
}

fn service() -> Arc<ServiceConfig> {
    Arc::new(ServiceConfig::new("routing-service"))
}

fn service_with_timeouts(idle: u64, write: u64) -> Arc<ServiceConfig> {
    Arc::new(ServiceConfig {
        name: "routing-service".to_owned(),
        conn_idle_timeout: idle,
        net_write_timeout: write,
    })
}

// ---- registry ------------------------------------------------------------------------------

#[rstest]
fn dcb_add_remove_round_trip_leaves_registry_unchanged() {
    let (mut worker, _channels) = test_worker(0);
    let server = probe_server(unused_address(), 2, 60);
    let session = test_session(&mut worker, &service());
    let (dcb, _probe, _peer) = attach_probe_backend(&mut worker, &server, session.id());

    let before = worker.dcb_count();
    worker.remove(&dcb).expect("registered dcb must remove");
    worker.add(&dcb).expect("removed dcb must re-add");
    assert_that!(worker.dcb_count(), eq(before));

    let double_add = worker.add(&dcb);
    assert_that!(double_add.is_err(), eq(true));
}

#[rstest]
fn zombie_queue_is_empty_after_every_turn() {
    let (mut worker, _channels) = test_worker(0);
    let server = probe_server(unused_address(), 0, 60);
    let session = test_session(&mut worker, &service());
    let (dcb, _probe, _peer) = attach_probe_backend(&mut worker, &server, session.id());

    worker.close_dcb(&dcb);
    assert_that!(worker.zombie_count(), eq(1_usize));
    let _ = worker.poll_once(0);
    assert_that!(worker.zombie_count(), eq(0_usize));
    assert_that!(dcb.borrow().state(), eq(DcbState::Disconnected));
}

#[rstest]
fn closing_a_client_closes_its_linked_backends() {
    let (mut worker, _channels) = test_worker(0);
    let server = probe_server(unused_address(), 0, 60);
    let client_service = service();
    let (client, _client_probe, _client_peer, session) =
        attach_probe_client(&mut worker, &client_service);
    let (backend, _backend_probe, _backend_peer) =
        attach_probe_backend(&mut worker, &server, session.id());

    worker.close_dcb(&client);
    let _ = worker.poll_once(0);

    assert_that!(client.borrow().state(), eq(DcbState::Disconnected));
    assert_that!(backend.borrow().state(), eq(DcbState::Disconnected));
    assert_that!(worker.lookup_session(session.id()).is_none(), eq(true));
    assert_that!(session.close_reason(), eq(CloseReason::ClientGone));
}

#[rstest]
fn wrong_worker_access_is_rejected() {
    let (mut first, _first_channels) = test_worker(0);
    let (second, _second_channels) = test_worker(1);
    let server = probe_server(unused_address(), 2, 60);
    let session = test_session(&mut first, &service());
    let (dcb, _probe, _peer) = attach_probe_backend(&mut first, &server, session.id());

    // While the thread is marked as worker 1, worker 0 must reject registry mutations.
    let guard = second.enter();
    assert_that!(first.remove(&dcb).is_err(), eq(true));
    drop(guard);
    assert_that!(first.remove(&dcb).is_ok(), eq(true));
}

// ---- persistent pool -----------------------------------------------------------------------

#[rstest]
fn pool_cap_keeps_two_of_three_released_backends() {
    let (mut worker, _channels) = test_worker(0);
    let server = probe_server(unused_address(), 2, 60);
    let session = test_session(&mut worker, &service());

    let mut backends = Vec::new();
    for _ in 0..3 {
        backends.push(attach_probe_backend(&mut worker, &server, session.id()));
    }
    for (dcb, _probe, _peer) in &backends {
        worker.close_dcb(dcb);
    }
    let _ = worker.poll_once(0);

    assert_that!(worker.pool_entry_count(&server), eq(2_usize));
    assert_that!(server.pool_stats().n_persistent(), eq(2_i64));
    assert_that!(server.n_current(), eq(0_i64));
    let (third, _, _) = &backends[2];
    assert_that!(third.borrow().state(), eq(DcbState::Disconnected));
}

#[rstest]
fn released_backend_is_not_pooled_when_pooling_is_disabled() {
    let (mut worker, _channels) = test_worker(0);
    let server = probe_server(unused_address(), 0, 60);
    let session = test_session(&mut worker, &service());
    let (dcb, _probe, _peer) = attach_probe_backend(&mut worker, &server, session.id());

    worker.close_dcb(&dcb);
    let _ = worker.poll_once(0);

    assert_that!(worker.pool_entry_count(&server), eq(0_usize));
    assert_that!(server.pool_stats().n_persistent(), eq(0_i64));
    assert_that!(dcb.borrow().state(), eq(DcbState::Disconnected));
}

#[rstest]
fn released_backend_is_destroyed_when_max_age_is_zero() {
    let (mut worker, _channels) = test_worker(0);
    let server = probe_server(unused_address(), 2, 0);
    let session = test_session(&mut worker, &service());
    let (dcb, _probe, _peer) = attach_probe_backend(&mut worker, &server, session.id());

    worker.close_dcb(&dcb);
    let _ = worker.poll_once(0);

    assert_that!(worker.pool_entry_count(&server), eq(0_usize));
    assert_that!(dcb.borrow().state(), eq(DcbState::Disconnected));
}

#[rstest]
fn acquire_after_release_returns_the_same_connection() {
    let (mut worker, _channels) = test_worker(0);
    let server = probe_server(unused_address(), 2, 60);
    let first_session = test_session(&mut worker, &service());
    let (dcb, probe, _peer) = attach_probe_backend(&mut worker, &server, first_session.id());

    worker.close_dcb(&dcb);
    assert_that!(worker.pool_entry_count(&server), eq(1_usize));
    assert_that!(probe.clears.get(), eq(1_usize));

    let second_session = test_session(&mut worker, &service());
    let reused = worker
        .get_backend(&server, second_session.id(), &upstream())
        .expect("pooled connection must be reusable");

    assert_that!(Rc::ptr_eq(&reused, &dcb), eq(true));
    assert_that!(probe.reuses.get(), eq(1_usize));
    assert_that!(server.pool_stats().n_from_pool(), eq(1_u64));
    assert_that!(server.pool_stats().n_persistent(), eq(0_i64));
    assert_that!(reused.borrow().session(), eq(Some(second_session.id())));

    // Releasing again restores the original pool composition.
    worker.close_dcb(&reused);
    assert_that!(worker.pool_entry_count(&server), eq(1_usize));
    let front = worker
        .pool_front_dcb(&server)
        .expect("pool must hold the released connection");
    assert_that!(Rc::ptr_eq(&front, &dcb), eq(true));
}

#[rstest]
fn aged_entry_is_evicted_and_acquire_falls_through_to_fresh_connect() {
    let backend_listener =
        TcpListener::bind("127.0.0.1:0").expect("backend listener must be bindable");
    let backend_addr = backend_listener
        .local_addr()
        .expect("backend listener address must be available");

    let (mut worker, _channels) = test_worker(0);
    let server = probe_server(backend_addr, 2, 1);
    let session = test_session(&mut worker, &service());
    let (stale, _probe, _peer) = attach_probe_backend(&mut worker, &server, session.id());

    worker.close_dcb(&stale);
    assert_that!(worker.pool_entry_count(&server), eq(1_usize));
    worker.backdate_pool_entries(&server, 2);

    let fresh = worker
        .get_backend(&server, session.id(), &upstream())
        .expect("fresh connect must succeed against the listener");
    let _ = worker.poll_once(0);

    assert_that!(Rc::ptr_eq(&fresh, &stale), eq(false));
    assert_that!(stale.borrow().state(), eq(DcbState::Disconnected));
    assert_that!(worker.pool_entry_count(&server), eq(0_usize));
    assert_that!(server.pool_stats().n_persistent(), eq(0_i64));
    assert_that!(server.pool_stats().n_from_pool(), eq(0_u64));
    assert_that!(server.n_current(), eq(1_i64));
}

#[rstest]
fn failed_reuse_closes_the_entry_and_falls_through_to_fresh_connect() {
    let backend_listener =
        TcpListener::bind("127.0.0.1:0").expect("backend listener must be bindable");
    let backend_addr = backend_listener
        .local_addr()
        .expect("backend listener address must be available");

    let (mut worker, _channels) = test_worker(0);
    let server = probe_server(backend_addr, 2, 60);
    let session = test_session(&mut worker, &service());
    let (stale, probe, _peer) = attach_probe_backend(&mut worker, &server, session.id());

    worker.close_dcb(&stale);
    probe.reuse_result.set(false);

    let fresh = worker
        .get_backend(&server, session.id(), &upstream())
        .expect("fresh connect must succeed against the listener");
    let _ = worker.poll_once(0);

    assert_that!(probe.reuses.get(), eq(1_usize));
    assert_that!(Rc::ptr_eq(&fresh, &stale), eq(false));
    assert_that!(stale.borrow().state(), eq(DcbState::Disconnected));
    assert_that!(server.pool_stats().n_persistent(), eq(0_i64));
    assert_that!(server.pool_stats().n_from_pool(), eq(0_u64));
}

#[rstest]
fn activity_on_a_pooled_connection_evicts_it() {
    let (mut worker, _channels) = test_worker(0);
    let server = probe_server(unused_address(), 2, 60);
    let session = test_session(&mut worker, &service());
    let (dcb, probe, peer) = attach_probe_backend(&mut worker, &server, session.id());

    worker.close_dcb(&dcb);
    assert_that!(worker.pool_entry_count(&server), eq(1_usize));
    assert_that!(server.pool_stats().n_persistent(), eq(1_i64));

    // The peer sends unsolicited bytes; the pool sentinel must close, not parse.
    let mut peer = std::fs::File::from(peer);
    peer.write_all(b"\x00unexpected")
        .expect("peer write must succeed");
    let _ = worker.poll_once(100);

    assert_that!(worker.pool_entry_count(&server), eq(0_usize));
    assert_that!(server.pool_stats().n_persistent(), eq(0_i64));
    assert_that!(dcb.borrow().state(), eq(DcbState::Disconnected));
    // Protocol callbacks never ran while the connection was pooled.
    assert_that!(probe.reads.get(), eq(0_usize));
}

#[rstest]
fn worker_shutdown_flushes_every_shelf() {
    let (mut worker, _channels) = test_worker(0);
    let server = probe_server(unused_address(), 4, 60);
    let session = test_session(&mut worker, &service());
    for _ in 0..3 {
        let (dcb, _probe, peer) = attach_probe_backend(&mut worker, &server, session.id());
        worker.close_dcb(&dcb);
        // Keep the peer alive so pooled entries see no hangup before the flush.
        std::mem::forget(peer);
    }
    assert_that!(server.pool_stats().n_persistent(), eq(3_i64));

    worker.evict_pooled(Evict::All);
    let _ = worker.poll_once(0);
    assert_that!(worker.pool_entry_count(&server), eq(0_usize));
    assert_that!(server.pool_stats().n_persistent(), eq(0_i64));
}

// ---- timeout scanner -----------------------------------------------------------------------

#[rstest]
fn idle_client_gets_timeout_close_reason_and_hangup() {
    let (mut worker, _channels) = test_worker(0);
    let idle_service = service_with_timeouts(5, 0);
    let (client, probe, _peer, session) = attach_probe_client(&mut worker, &idle_service);

    client.borrow_mut().backdate_last_read(70);
    worker.force_timeout_scan();
    let _ = worker.poll_once(0);

    assert_that!(probe.hangups.get(), eq(1_usize));
    assert_that!(session.close_reason(), eq(CloseReason::Timeout));
    assert_that!(client.borrow().state(), eq(DcbState::Disconnected));
    assert_that!(worker.lookup_session(session.id()).is_none(), eq(true));
}

#[rstest]
fn zero_idle_timeout_disables_the_scan() {
    let (mut worker, _channels) = test_worker(0);
    let no_timeout_service = service_with_timeouts(0, 0);
    let (client, probe, _peer, session) = attach_probe_client(&mut worker, &no_timeout_service);

    client.borrow_mut().backdate_last_read(10_000);
    worker.force_timeout_scan();
    let _ = worker.poll_once(0);

    assert_that!(probe.hangups.get(), eq(0_usize));
    assert_that!(session.close_reason(), eq(CloseReason::None));
}

#[rstest]
fn stalled_write_queue_times_out() {
    let (mut worker, _channels) = test_worker(0);
    let write_service = service_with_timeouts(0, 1);
    let (client, probe, _peer, session) = attach_probe_client(&mut worker, &write_service);

    client.borrow_mut().queue_write(b"undeliverable");
    client.borrow_mut().backdate_last_write(20);
    worker.force_timeout_scan();
    let _ = worker.poll_once(0);

    assert_that!(probe.hangups.get(), eq(1_usize));
    assert_that!(session.close_reason(), eq(CloseReason::Timeout));
}

#[rstest]
fn write_timeout_needs_a_nonempty_write_queue() {
    let (mut worker, _channels) = test_worker(0);
    let write_service = service_with_timeouts(0, 1);
    let (client, probe, _peer, _session) = attach_probe_client(&mut worker, &write_service);

    client.borrow_mut().backdate_last_write(20);
    worker.force_timeout_scan();
    let _ = worker.poll_once(0);

    assert_that!(probe.hangups.get(), eq(0_usize));
}

// ---- worker pool dispatch ------------------------------------------------------------------

fn pool_config(workers: usize) -> RuntimeConfig {
    RuntimeConfig {
        thread_count: WorkerCount::new(workers).expect("test worker count must be non-zero"),
        max_events: 256,
    }
}

struct CountingTask {
    executions: AtomicUsize,
}

impl WorkerTask for CountingTask {
    fn execute(&self, _worker: &mut Worker) {
        let _ = self.executions.fetch_add(1, Ordering::Relaxed);
    }
}

#[rstest]
fn execute_concurrently_is_a_completion_barrier() {
    let mut pool = WorkerPool::init(&pool_config(3), ModuleRegistry::new())
        .expect("pool init must succeed");
    pool.start().expect("pool start must succeed");

    let task = Arc::new(CountingTask {
        executions: AtomicUsize::new(0),
    });
    let shared: Arc<dyn WorkerTask> = Arc::clone(&task) as Arc<dyn WorkerTask>;
    let completed = pool
        .execute_concurrently(&shared)
        .expect("barrier must run off the worker threads");

    assert_that!(completed, eq(3_usize));
    assert_that!(task.executions.load(Ordering::Relaxed), eq(3_usize));

    pool.shutdown_all();
    pool.join();
}

#[rstest]
fn execute_serially_visits_workers_in_id_order() {
    let mut pool = WorkerPool::init(&pool_config(3), ModuleRegistry::new())
        .expect("pool init must succeed");
    pool.start().expect("pool start must succeed");

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    struct OrderTask {
        order: Arc<std::sync::Mutex<Vec<usize>>>,
    }
    impl WorkerTask for OrderTask {
        fn execute(&self, worker: &mut Worker) {
            self.order
                .lock()
                .expect("order mutex must not be poisoned")
                .push(worker.id());
        }
    }
    let task: Arc<dyn WorkerTask> = Arc::new(OrderTask {
        order: Arc::clone(&order),
    });
    let completed = pool
        .execute_serially(&task)
        .expect("serial execution must run off the worker threads");

    assert_that!(completed, eq(3_usize));
    let visited = order.lock().expect("order mutex must not be poisoned");
    assert_that!(&*visited, eq(&vec![0_usize, 1_usize, 2_usize]));

    pool.shutdown_all();
    pool.join();
}

#[rstest]
fn broadcast_message_shutdown_stops_every_worker() {
    let mut pool = WorkerPool::init(&pool_config(3), ModuleRegistry::new())
        .expect("pool init must succeed");
    pool.start().expect("pool start must succeed");

    let submitted = pool.broadcast_message(MSG_SHUTDOWN, 0, 0);
    assert_that!(submitted, eq(3_usize));
    pool.join();

    // Submissions to exited workers fail and the broadcast count reflects that.
    let ignored = pool.broadcast_closure(|_worker| {}, None);
    assert_that!(ignored, eq(0_usize));
}

#[rstest]
fn pick_worker_round_robins_over_the_pool() {
    let pool = WorkerPool::init(&pool_config(3), ModuleRegistry::new())
        .expect("pool init must succeed");
    let picks: Vec<usize> = (0..4).map(|_| pool.pick_worker().id).collect();
    assert_that!(&picks, eq(&vec![0_usize, 1_usize, 2_usize, 0_usize]));
}

#[rstest]
fn queued_job_runs_on_the_target_worker() {
    let mut pool = WorkerPool::init(&pool_config(2), ModuleRegistry::new())
        .expect("pool init must succeed");
    pool.start().expect("pool start must succeed");

    let observed = Arc::new(std::sync::Mutex::new(None));
    let writer = Arc::clone(&observed);
    pool.execute_on(
        1,
        Job::closure(move |worker| {
            *writer.lock().expect("slot mutex must not be poisoned") = Some(worker.id());
        }),
        crate::mailbox::ExecuteMode::Queued,
    )
    .expect("submission to a live worker must succeed");

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if observed
            .lock()
            .expect("slot mutex must not be poisoned")
            .is_some()
        {
            break;
        }
        assert_that!(Instant::now() < deadline, eq(true));
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_that!(
        *observed.lock().expect("slot mutex must not be poisoned"),
        eq(Some(1_usize))
    );

    pool.shutdown_all();
    pool.join();
}

// ---- shared listener fan-out ---------------------------------------------------------------

#[rstest]
fn shared_listener_accepts_and_echoes_across_the_pool() {
    let mut pool = WorkerPool::init(&pool_config(4), ModuleRegistry::new())
        .expect("pool init must succeed");
    let listener = Listener::bind(
        "127.0.0.1:0".parse().expect("literal address must parse"),
        service(),
        Arc::new(EchoClientFactory),
    )
    .expect("listener must bind");
    let address = listener
        .local_addr()
        .expect("listener address must be available");
    pool.add_listener(listener).expect("listener must register");
    pool.start().expect("pool start must succeed");

    let mut clients = Vec::new();
    for index in 0..8_u8 {
        let mut client = TcpStream::connect(address).expect("client connect must succeed");
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("read timeout must be configurable");
        client
            .write_all(&[b'm', index])
            .expect("client write must succeed");
        clients.push((index, client));
    }
    for (index, client) in &mut clients {
        let mut reply = [0_u8; 2];
        client
            .read_exact(&mut reply)
            .expect("echo reply must arrive");
        assert_that!(reply, eq([b'm', *index]));
    }
    drop(clients);

    // All eight connections were accepted through the shared set, each exactly once.
    let deadline = Instant::now() + Duration::from_secs(3);
    let accepts: Vec<u64> = loop {
        let snapshot = pool
            .statistics_snapshot()
            .expect("snapshot must run off the worker threads");
        let counts: Vec<u64> = snapshot.iter().map(|stats| stats.n_accept).collect();
        if counts.iter().sum::<u64>() == 8 {
            break counts;
        }
        assert_that!(Instant::now() < deadline, eq(true));
        std::thread::sleep(Duration::from_millis(10));
    };
    assert_that!(accepts.iter().sum::<u64>(), eq(8_u64));
    assert_that!(accepts.len(), eq(4_usize));

    let document = pool.stats_as_json().expect("stats document must build");
    let aggregate_accepts = document
        .get("aggregate")
        .and_then(|aggregate| aggregate.get("n_accept"))
        .and_then(serde_json::Value::as_u64);
    assert_that!(aggregate_accepts, eq(Some(8_u64)));

    pool.shutdown_all();
    pool.join();
}

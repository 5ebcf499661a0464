//! The worker pool manager: startup, shutdown and cross-thread dispatch.
//!
//! `WorkerPool` is the single long-lived runtime value owned by the process entry point; there
//! is no global unit state. Startup is fatal-or-all: seeds for every worker (multiplexer, wake
//! descriptor, message pipe) are created before any thread runs, and a worker whose per-thread
//! module init fails takes the whole start down.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use serde_json::Value;
use tracing::info;

use syd_common::config::RuntimeConfig;
use syd_common::error::{SydError, SydResult};
use syd_common::ids::WorkerId;
use syd_common::sync::Semaphore;

use crate::listener::{Listener, SharedListeners};
use crate::mailbox::{ExecuteMode, Job, RawMessage, WorkerTask};
use crate::modules::ModuleRegistry;
use crate::stats::{WorkerStatistics, pool_document, worker_document};
use crate::worker::{Worker, WorkerChannels, WorkerSeed, current_worker_id};

struct ClosureTask<F>(F);

impl<F> WorkerTask for ClosureTask<F>
where
    F: Fn(&mut Worker) + Send + Sync,
{
    fn execute(&self, worker: &mut Worker) {
        (self.0)(worker);
    }
}

struct WorkerSlot {
    channels: WorkerChannels,
    seed: Option<WorkerSeed>,
    join: Option<JoinHandle<()>>,
}

/// Fixed pool of routing workers sharing one listener readiness set.
pub struct WorkerPool {
    shared: Arc<SharedListeners>,
    modules: Arc<ModuleRegistry>,
    workers: Vec<WorkerSlot>,
    id_main: WorkerId,
    next_pick: AtomicUsize,
    started: bool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("started", &self.started)
            .finish()
    }
}

impl WorkerPool {
    /// Creates the shared listener set and one seed per worker with dense ids `0..n`.
    ///
    /// # Errors
    ///
    /// Returns the first seed-creation error; no partially initialized pool is exposed.
    pub fn init(config: &RuntimeConfig, modules: ModuleRegistry) -> SydResult<Self> {
        let shared = SharedListeners::new()?;
        let modules = Arc::new(modules);
        let count = config.thread_count.get();

        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let (seed, channels) = WorkerSeed::create(
                id,
                Arc::clone(&shared),
                Arc::clone(&modules),
                config.max_events,
            )?;
            workers.push(WorkerSlot {
                channels,
                seed: Some(seed),
                join: None,
            });
        }

        // The first worker owns the shared descriptors for bookkeeping.
        let id_main = 0;
        shared.set_owner(id_main);

        Ok(Self {
            shared,
            modules,
            workers,
            id_main,
            next_pick: AtomicUsize::new(0),
            started: false,
        })
    }

    /// Number of workers in the pool.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Id of the main worker (the first one created).
    #[must_use]
    pub fn main_worker_id(&self) -> WorkerId {
        self.id_main
    }

    #[must_use]
    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    /// The process-wide listener readiness set.
    #[must_use]
    pub fn shared_listeners(&self) -> &Arc<SharedListeners> {
        &self.shared
    }

    /// Installs a listener into the shared readiness set.
    ///
    /// # Errors
    ///
    /// Returns `SydError::Io` when the registration fails.
    pub fn add_listener(&self, listener: Arc<Listener>) -> SydResult<()> {
        self.shared.add_shared(listener)
    }

    /// Channels of one worker.
    #[must_use]
    pub fn worker_for(&self, id: WorkerId) -> Option<&WorkerChannels> {
        self.workers.get(id).map(|slot| &slot.channels)
    }

    /// Channels of the worker whose loop the calling thread is inside, if any.
    #[must_use]
    pub fn current_worker(&self) -> Option<&WorkerChannels> {
        current_worker_id().and_then(|id| self.worker_for(id))
    }

    /// Channels of the main worker.
    ///
    /// # Panics
    ///
    /// Panics if the pool was constructed without workers, which `init` prevents.
    #[must_use]
    pub fn main_worker(&self) -> &WorkerChannels {
        &self.workers[self.id_main].channels
    }

    /// Round-robin pick for assigning a new stateless unit to some worker.
    #[must_use]
    pub fn pick_worker(&self) -> &WorkerChannels {
        let index = self.next_pick.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[index].channels
    }

    /// Starts every worker thread and waits for their per-thread module init.
    ///
    /// # Errors
    ///
    /// Returns `SydError::InvalidState` when any worker fails to initialize; the already
    /// started workers are stopped and joined, so no partial pool survives.
    pub fn start(&mut self) -> SydResult<()> {
        if self.started {
            return Err(SydError::InvalidState("worker pool is already started"));
        }
        let (ready_sender, ready_receiver) = channel::<bool>();
        for slot in &mut self.workers {
            let seed = slot
                .seed
                .take()
                .ok_or(SydError::InvalidState("worker seed was already consumed"))?;
            let ready = ready_sender.clone();
            let id = seed.id();
            let join = std::thread::Builder::new()
                .name(format!("syd-worker-{id}"))
                .spawn(move || worker_thread_main(seed, &ready))
                .map_err(|spawn_error| {
                    SydError::Io(format!("spawn worker {id} failed: {spawn_error}"))
                })?;
            slot.join = Some(join);
        }
        drop(ready_sender);

        let mut initialized = 0_usize;
        for _ in 0..self.workers.len() {
            match ready_receiver.recv() {
                Ok(true) => initialized += 1,
                Ok(false) | Err(_) => break,
            }
        }
        if initialized != self.workers.len() {
            self.shutdown_all();
            self.join();
            return Err(SydError::InvalidState(
                "worker thread initialization failed",
            ));
        }
        self.started = true;
        info!(workers = self.workers.len(), "worker pool started");
        Ok(())
    }

    /// Raises every worker's stop flag and wakes it. Signal-safe: no logging, no allocation.
    pub fn shutdown_all(&self) {
        for slot in &self.workers {
            slot.channels.stop.store(true, Ordering::Relaxed);
            slot.channels.handle.notify();
        }
    }

    /// Waits for every worker thread to exit.
    pub fn join(&mut self) {
        for slot in &mut self.workers {
            if let Some(join) = slot.join.take() {
                let _ = join.join();
            }
        }
        self.started = false;
    }

    // ---- dispatch primitives -------------------------------------------------------------

    /// Submits a job to one worker.
    ///
    /// `Auto` and `Queued` behave identically through the pool: a caller holding `&mut Worker`
    /// takes the inline path via [`Worker::execute_local`] instead.
    ///
    /// # Errors
    ///
    /// Returns `SydError::InvalidState` for an unknown worker or an exited loop.
    pub fn execute_on(&self, id: WorkerId, job: Job, _mode: ExecuteMode) -> SydResult<()> {
        let channels = self
            .worker_for(id)
            .ok_or(SydError::InvalidState("worker id is out of range"))?;
        channels.handle.post(job)
    }

    /// Submits `task` to every worker; returns the number of successful submissions.
    ///
    /// With a completion semaphore the caller can wait for that many completions.
    pub fn broadcast(&self, task: &Arc<dyn WorkerTask>, completion: Option<&Arc<Semaphore>>) -> usize {
        let mut submitted = 0_usize;
        for slot in &self.workers {
            let job = match completion {
                Some(semaphore) => {
                    Job::task_with_completion(Arc::clone(task), Arc::clone(semaphore))
                }
                None => Job::task(Arc::clone(task)),
            };
            if slot.channels.handle.post(job).is_ok() {
                submitted += 1;
            }
        }
        submitted
    }

    /// Broadcasts a closure; the shared closure runs once on every worker.
    pub fn broadcast_closure<F>(&self, call: F, completion: Option<&Arc<Semaphore>>) -> usize
    where
        F: Fn(&mut Worker) + Send + Sync + 'static,
    {
        let task: Arc<dyn WorkerTask> = Arc::new(ClosureTask(call));
        self.broadcast(&task, completion)
    }

    /// Broadcasts a runtime-owned task; the last worker to finish drops it.
    pub fn broadcast_disposable(&self, task: Arc<dyn WorkerTask>) -> usize {
        self.broadcast(&task, None)
    }

    /// Runs `task` on every worker, one worker at a time.
    ///
    /// # Errors
    ///
    /// Returns `SydError::InvalidState` when called from a worker thread; waiting on the own
    /// mailbox would deadlock the loop.
    pub fn execute_serially(&self, task: &Arc<dyn WorkerTask>) -> SydResult<usize> {
        self.reject_on_worker_thread()?;
        let semaphore = Arc::new(Semaphore::new(0));
        let mut completed = 0_usize;
        for slot in &self.workers {
            let job = Job::task_with_completion(Arc::clone(task), Arc::clone(&semaphore));
            if slot.channels.handle.post(job).is_ok() {
                semaphore.wait();
                completed += 1;
            }
        }
        Ok(completed)
    }

    /// Runs `task` on every worker concurrently and waits for all completions.
    ///
    /// The returned count is the number of workers that ran the task; callers needing
    /// all-or-nothing semantics compare it against [`WorkerPool::worker_count`].
    ///
    /// # Errors
    ///
    /// Returns `SydError::InvalidState` when called from a worker thread.
    pub fn execute_concurrently(&self, task: &Arc<dyn WorkerTask>) -> SydResult<usize> {
        self.reject_on_worker_thread()?;
        let semaphore = Arc::new(Semaphore::new(0));
        let submitted = self.broadcast(task, Some(&semaphore));
        Ok(semaphore.wait_n(submitted))
    }

    /// Sends a raw message to every worker. Signal-safe: no logging, no allocation.
    pub fn broadcast_message(&self, id: u32, arg1: i64, arg2: i64) -> usize {
        let message = RawMessage { id, arg1, arg2 };
        let mut submitted = 0_usize;
        for slot in &self.workers {
            if slot.channels.handle.post_message(message) {
                submitted += 1;
            }
        }
        submitted
    }

    fn reject_on_worker_thread(&self) -> SydResult<()> {
        if current_worker_id().is_some() {
            return Err(SydError::InvalidState(
                "completion barriers must not run on a worker thread",
            ));
        }
        Ok(())
    }

    // ---- statistics ----------------------------------------------------------------------

    /// Copies every worker's counters into a slot indexed by worker id.
    ///
    /// # Errors
    ///
    /// Returns `SydError::InvalidState` when called from a worker thread.
    pub fn statistics_snapshot(&self) -> SydResult<Vec<WorkerStatistics>> {
        let slots = Arc::new(Mutex::new(vec![
            WorkerStatistics::default();
            self.workers.len()
        ]));
        let writer = Arc::clone(&slots);
        let task: Arc<dyn WorkerTask> = Arc::new(ClosureTask(move |worker: &mut Worker| {
            let mut slots = writer.lock().expect("stats slot mutex must not be poisoned");
            let id = worker.id();
            if let Some(slot) = slots.get_mut(id) {
                *slot = *worker.statistics();
            }
        }));
        let _ = self.execute_concurrently(&task)?;
        let slots = slots.lock().expect("stats slot mutex must not be poisoned");
        Ok(slots.clone())
    }

    /// JSON document for one worker, as served by the admin endpoint.
    ///
    /// # Errors
    ///
    /// Returns `SydError::InvalidState` for an unknown worker or a worker-thread caller.
    pub fn worker_stats_json(&self, id: WorkerId) -> SydResult<Value> {
        let snapshot = self.statistics_snapshot()?;
        let stats = snapshot
            .get(id)
            .ok_or(SydError::InvalidState("worker id is out of range"))?;
        Ok(worker_document(id, stats))
    }

    /// JSON list document over all workers plus the aggregate rollup.
    ///
    /// # Errors
    ///
    /// Returns `SydError::InvalidState` when called from a worker thread.
    pub fn stats_as_json(&self) -> SydResult<Value> {
        Ok(pool_document(&self.statistics_snapshot()?))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_all();
        self.join();
    }
}

fn worker_thread_main(seed: WorkerSeed, ready: &Sender<bool>) {
    let mut worker = Worker::from_seed(seed);
    let guard = worker.enter();
    let modules = Arc::clone(worker.modules());
    if !modules.thread_init() {
        let _ = ready.send(false);
        drop(guard);
        return;
    }
    let _ = ready.send(true);
    worker.run();
    modules.thread_finish();
    drop(guard);
}

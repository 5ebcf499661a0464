//! Cross-thread mailbox delivering work into a worker's event loop.
//!
//! Each worker owns the receiving half; any thread may hold a [`MailboxHandle`] and submit.
//! Ordinary jobs travel over an mpsc channel paired with an eventfd wake descriptor that is
//! registered on the worker's multiplexer. Raw messages travel over a separate nonblocking pipe
//! as fixed-size records: that path never allocates and never logs, so it is usable from signal
//! handlers.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};

use syd_common::error::{SydError, SydResult};
use syd_common::sync::Semaphore;

use crate::worker::Worker;

/// Raw message id handled by the loop itself: sets the worker's stop flag.
pub const MSG_SHUTDOWN: u32 = 1;

/// First raw message id available to embedders.
pub const MSG_USER_BASE: u32 = 1000;

const RAW_MESSAGE_BYTES: usize = 24;

/// Fixed-size cross-thread message for signal-safe submission paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMessage {
    pub id: u32,
    pub arg1: i64,
    pub arg2: i64,
}

impl RawMessage {
    fn encode(self) -> [u8; RAW_MESSAGE_BYTES] {
        let mut bytes = [0_u8; RAW_MESSAGE_BYTES];
        bytes[0..4].copy_from_slice(&self.id.to_ne_bytes());
        bytes[8..16].copy_from_slice(&self.arg1.to_ne_bytes());
        bytes[16..24].copy_from_slice(&self.arg2.to_ne_bytes());
        bytes
    }

    fn decode(bytes: &[u8; RAW_MESSAGE_BYTES]) -> Self {
        let mut id = [0_u8; 4];
        let mut arg1 = [0_u8; 8];
        let mut arg2 = [0_u8; 8];
        id.copy_from_slice(&bytes[0..4]);
        arg1.copy_from_slice(&bytes[8..16]);
        arg2.copy_from_slice(&bytes[16..24]);
        Self {
            id: u32::from_ne_bytes(id),
            arg1: i64::from_ne_bytes(arg1),
            arg2: i64::from_ne_bytes(arg2),
        }
    }
}

/// Unit of work executed on a worker thread.
///
/// Shared tasks are reference-counted so one instance can be delivered to every worker of the
/// pool; the submitter keeps its own reference and may wait on the completion semaphore.
pub trait WorkerTask: Send + Sync {
    fn execute(&self, worker: &mut Worker);
}

/// One mailbox submission.
pub enum Job {
    /// Shared task, optionally paired with a completion semaphore posted after execution.
    Task {
        task: Arc<dyn WorkerTask>,
        completion: Option<Arc<Semaphore>>,
    },
    /// One-shot closure owned by the runtime.
    Closure(Box<dyn FnOnce(&mut Worker) + Send>),
}

impl Job {
    /// Wraps a closure as a job.
    #[must_use]
    pub fn closure(call: impl FnOnce(&mut Worker) + Send + 'static) -> Self {
        Job::Closure(Box::new(call))
    }

    /// Wraps a shared task without completion signalling.
    #[must_use]
    pub fn task(task: Arc<dyn WorkerTask>) -> Self {
        Job::Task {
            task,
            completion: None,
        }
    }

    /// Wraps a shared task that posts `completion` when it has run.
    #[must_use]
    pub fn task_with_completion(task: Arc<dyn WorkerTask>, completion: Arc<Semaphore>) -> Self {
        Job::Task {
            task,
            completion: Some(completion),
        }
    }

    pub(crate) fn run(self, worker: &mut Worker) {
        match self {
            Job::Task { task, completion } => {
                task.execute(worker);
                if let Some(completion) = completion {
                    completion.post();
                }
            }
            Job::Closure(call) => call(worker),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::Task { completion, .. } => f
                .debug_struct("Job::Task")
                .field("has_completion", &completion.is_some())
                .finish(),
            Job::Closure(_) => f.debug_struct("Job::Closure").finish(),
        }
    }
}

/// Submission mode for handle-based posting.
///
/// `Auto` from a foreign thread is equivalent to `Queued`; code that already runs on the target
/// worker holds `&mut Worker` and executes inline through [`Worker::execute_local`] instead of
/// going through a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteMode {
    Auto,
    Queued,
}

fn create_eventfd() -> SydResult<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(SydError::Io(format!(
            "create mailbox eventfd failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn create_raw_pipe() -> SydResult<(OwnedFd, OwnedFd)> {
    let mut fds = [0_i32; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
        return Err(SydError::Io(format!(
            "create mailbox message pipe failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((read, write))
}

/// Worker-side half: job queue, wake descriptor and raw-message pipe read end.
#[derive(Debug)]
pub struct Mailbox {
    receiver: Receiver<Job>,
    wake: Arc<OwnedFd>,
    raw_read: OwnedFd,
}

impl Mailbox {
    pub(crate) fn wake_fd(&self) -> RawFd {
        self.wake.as_raw_fd()
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.raw_read.as_raw_fd()
    }

    /// Pops the next queued job, if any.
    pub(crate) fn try_pop(&self) -> Option<Job> {
        match self.receiver.try_recv() {
            Ok(job) => Some(job),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Consumes the pending wake count so the eventfd can signal again.
    pub(crate) fn clear_wake(&self) {
        let mut counter = [0_u8; 8];
        let _ = unsafe {
            libc::read(
                self.wake.as_raw_fd(),
                counter.as_mut_ptr().cast(),
                counter.len(),
            )
        };
    }

    /// Drains every complete raw message currently buffered in the pipe.
    pub(crate) fn drain_raw(&self, out: &mut Vec<RawMessage>) {
        let mut bytes = [0_u8; RAW_MESSAGE_BYTES];
        loop {
            let read = unsafe {
                libc::read(
                    self.raw_read.as_raw_fd(),
                    bytes.as_mut_ptr().cast(),
                    bytes.len(),
                )
            };
            if read == RAW_MESSAGE_BYTES as isize {
                out.push(RawMessage::decode(&bytes));
            } else {
                return;
            }
        }
    }
}

/// Submitter-side half, cloneable across threads.
#[derive(Debug, Clone)]
pub struct MailboxHandle {
    sender: Sender<Job>,
    wake: Arc<OwnedFd>,
    raw_write: Arc<OwnedFd>,
}

impl MailboxHandle {
    /// Enqueues a job and wakes the worker.
    ///
    /// # Errors
    ///
    /// Returns `SydError::InvalidState` when the worker's loop has exited and the queue is gone.
    pub fn post(&self, job: Job) -> SydResult<()> {
        self.sender
            .send(job)
            .map_err(|_| SydError::InvalidState("worker mailbox is closed"))?;
        self.notify();
        Ok(())
    }

    /// Submits a raw message. Returns whether the record was written.
    ///
    /// Signal safety: performs exactly one `write` on a preallocated record. Must not log.
    pub fn post_message(&self, message: RawMessage) -> bool {
        let bytes = message.encode();
        let written = unsafe {
            libc::write(
                self.raw_write.as_raw_fd(),
                bytes.as_ptr().cast(),
                bytes.len(),
            )
        };
        if written != RAW_MESSAGE_BYTES as isize {
            return false;
        }
        self.notify();
        true
    }

    /// Wakes the worker without queueing anything. Signal-safe.
    pub fn notify(&self) {
        let one = 1_u64.to_ne_bytes();
        let _ = unsafe { libc::write(self.wake.as_raw_fd(), one.as_ptr().cast(), one.len()) };
    }
}

/// Creates a connected mailbox pair.
///
/// # Errors
///
/// Returns `SydError::Io` when the wake descriptor or message pipe cannot be created.
pub(crate) fn mailbox_pair() -> SydResult<(Mailbox, MailboxHandle)> {
    let (sender, receiver) = channel::<Job>();
    let wake = Arc::new(create_eventfd()?);
    let (raw_read, raw_write) = create_raw_pipe()?;
    let mailbox = Mailbox {
        receiver,
        wake: Arc::clone(&wake),
        raw_read,
    };
    let handle = MailboxHandle {
        sender,
        wake,
        raw_write: Arc::new(raw_write),
    };
    Ok((mailbox, handle))
}

#[cfg(test)]
mod tests {
    use super::{Job, MSG_SHUTDOWN, RawMessage, mailbox_pair};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn raw_message_record_round_trips() {
        let message = RawMessage {
            id: MSG_SHUTDOWN,
            arg1: -7,
            arg2: i64::MAX,
        };
        assert_that!(RawMessage::decode(&message.encode()), eq(message));
    }

    #[rstest]
    fn jobs_are_delivered_in_fifo_order() {
        let (mailbox, handle) = mailbox_pair().expect("mailbox pair must be creatable");
        for index in 0..3_i64 {
            handle
                .post(Job::closure(move |_worker| {
                    let _ = index;
                }))
                .expect("post must succeed while mailbox is open");
        }
        let mut popped = 0_usize;
        while mailbox.try_pop().is_some() {
            popped += 1;
        }
        assert_that!(popped, eq(3_usize));
    }

    #[rstest]
    fn raw_pipe_carries_multiple_records() {
        let (mailbox, handle) = mailbox_pair().expect("mailbox pair must be creatable");
        let first = RawMessage {
            id: 10,
            arg1: 1,
            arg2: 2,
        };
        let second = RawMessage {
            id: 11,
            arg1: 3,
            arg2: 4,
        };
        assert_that!(handle.post_message(first), eq(true));
        assert_that!(handle.post_message(second), eq(true));

        let mut drained = Vec::new();
        mailbox.drain_raw(&mut drained);
        assert_that!(&drained, eq(&vec![first, second]));
    }

    #[rstest]
    fn post_fails_after_receiver_is_dropped() {
        let (mailbox, handle) = mailbox_pair().expect("mailbox pair must be creatable");
        drop(mailbox);
        let result = handle.post(Job::closure(|_worker| {}));
        assert_that!(result.is_err(), eq(true));
    }
}

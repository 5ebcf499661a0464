//! Thin wrapper over the kernel readiness notification facility.
//!
//! Every worker owns one `Multiplexer`; the shared listener set is a second, process-wide
//! instance whose descriptor is registered *inside* each worker instance. Both of those needs
//! rule out readiness-library wrappers: registrations here carry an explicit level/edge mode
//! (the shared set must be level-triggered) and a foreign epoll descriptor must be registrable
//! like any socket.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use syd_common::error::{SydError, SydResult};

/// Opaque registration token returned with every readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

/// Readiness interests requested at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);

    #[must_use]
    pub fn is_readable(self) -> bool {
        (self.0 & Self::READABLE.0) != 0
    }

    #[must_use]
    pub fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE.0) != 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        Interest(self.0 | other.0)
    }
}

/// Edge- or level-triggered registration mode.
///
/// Per-worker connection descriptors use `Edge`. The shared listener descriptor must use
/// `Level`: each worker performs exactly one `accept` per wakeup, and only a level-triggered
/// registration re-wakes the next available worker while unaccepted connections remain queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Edge,
    Level,
}

/// One readiness event copied out of the kernel event buffer.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    token: Token,
    bits: u32,
}

impl ReadyEvent {
    #[must_use]
    pub fn token(self) -> Token {
        self.token
    }

    #[must_use]
    pub fn is_readable(self) -> bool {
        (self.bits & libc::EPOLLIN as u32) != 0
    }

    #[must_use]
    pub fn is_writable(self) -> bool {
        (self.bits & libc::EPOLLOUT as u32) != 0
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        (self.bits & libc::EPOLLERR as u32) != 0
    }

    #[must_use]
    pub fn is_hangup(self) -> bool {
        (self.bits & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32)) != 0
    }
}

/// Reusable buffer for `Multiplexer::wait` results.
pub struct ReadyEvents {
    raw: Vec<libc::epoll_event>,
    ready: Vec<ReadyEvent>,
}

impl ReadyEvents {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            raw: vec![libc::epoll_event { events: 0, u64: 0 }; capacity],
            ready: Vec::with_capacity(capacity),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ReadyEvent> {
        self.ready.iter()
    }
}

impl<'a> IntoIterator for &'a ReadyEvents {
    type Item = &'a ReadyEvent;
    type IntoIter = std::slice::Iter<'a, ReadyEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One epoll instance with explicit level/edge registration control.
#[derive(Debug)]
pub struct Multiplexer {
    epoll: OwnedFd,
}

impl Multiplexer {
    /// Creates a new epoll instance.
    ///
    /// # Errors
    ///
    /// Returns `SydError::Io` when the kernel refuses a new instance.
    pub fn new() -> SydResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(SydError::Io(format!(
                "create epoll instance failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            epoll: unsafe { <OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(fd) },
        })
    }

    fn control(&self, op: libc::c_int, fd: RawFd, event: Option<&mut libc::epoll_event>) -> SydResult<()> {
        let pointer = event.map_or(std::ptr::null_mut(), std::ptr::from_mut);
        if unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, pointer) } != 0 {
            return Err(SydError::Io(format!(
                "epoll_ctl(op={op}, fd={fd}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn event_bits(interest: Interest, trigger: Trigger) -> u32 {
        let mut bits = interest.0 | libc::EPOLLRDHUP as u32;
        if trigger == Trigger::Edge {
            bits |= libc::EPOLLET as u32;
        }
        bits
    }

    /// Registers `fd` with the requested interests, trigger mode and opaque token.
    ///
    /// # Errors
    ///
    /// Returns `SydError::Io` when the kernel rejects the registration.
    pub fn add(&self, fd: RawFd, interest: Interest, trigger: Trigger, token: Token) -> SydResult<()> {
        let mut event = libc::epoll_event {
            events: Self::event_bits(interest, trigger),
            u64: token.0 as u64,
        };
        self.control(libc::EPOLL_CTL_ADD, fd, Some(&mut event))
    }

    /// Replaces the interests of an already registered descriptor.
    ///
    /// # Errors
    ///
    /// Returns `SydError::Io` when the kernel rejects the modification.
    pub fn modify(&self, fd: RawFd, interest: Interest, trigger: Trigger, token: Token) -> SydResult<()> {
        let mut event = libc::epoll_event {
            events: Self::event_bits(interest, trigger),
            u64: token.0 as u64,
        };
        self.control(libc::EPOLL_CTL_MOD, fd, Some(&mut event))
    }

    /// Deregisters a descriptor.
    ///
    /// # Errors
    ///
    /// Returns `SydError::Io` when the descriptor was not registered.
    pub fn remove(&self, fd: RawFd) -> SydResult<()> {
        self.control(libc::EPOLL_CTL_DEL, fd, None)
    }

    /// Waits up to `timeout_ms` for readiness events and fills `events`.
    ///
    /// An interrupted wait (`EINTR`) reports zero events; every other failure surfaces as an
    /// error so the caller can decide whether the loop continues.
    ///
    /// # Errors
    ///
    /// Returns `SydError::Io` for wait failures other than interruption.
    pub fn wait(&self, events: &mut ReadyEvents, timeout_ms: i32) -> SydResult<usize> {
        events.ready.clear();
        let capacity = i32::try_from(events.raw.len()).unwrap_or(i32::MAX);
        let count = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.raw.as_mut_ptr(),
                capacity,
                timeout_ms,
            )
        };
        if count < 0 {
            let error = std::io::Error::last_os_error();
            if error.kind() == std::io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(SydError::Io(format!("epoll_wait failed: {error}")));
        }
        for slot in events.raw.iter().take(count.unsigned_abs() as usize) {
            events.ready.push(ReadyEvent {
                token: Token(usize::try_from(slot.u64).unwrap_or(usize::MAX)),
                bits: slot.events,
            });
        }
        Ok(events.ready.len())
    }
}

impl AsRawFd for Multiplexer {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}

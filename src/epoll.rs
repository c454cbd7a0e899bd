//! Thin façade over `epoll`, built directly on `libc::epoll_*` rather than
//! on a higher-level poller crate.
//!
//! `mio` (the teacher crate's usual choice for this job) always arms
//! descriptors edge-triggered; this reactor needs the edge/level bit to be
//! a per-call choice (spec §4.2, `trig_mode`), so the interest mask is
//! built by hand and passed straight to `epoll_ctl`.

use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{io, mem};

/// Interest mask for a descriptor registered with the demultiplexer.
///
/// A small hand-rolled bitmask rather than a `bitflags!`-generated type:
/// the set of flags is fixed and tiny, and the raw `u32` is what
/// `epoll_event.events` wants on the wire anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    pub const RDHUP: Interest = Interest(libc::EPOLLRDHUP as u32);
    pub const EDGE_TRIGGERED: Interest = Interest(libc::EPOLLET as u32);
    pub const ONESHOT: Interest = Interest(libc::EPOLLONESHOT as u32);

    #[inline]
    fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    #[inline]
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

/// One readiness notification.
///
/// Mirrors the exact on-wire layout of `libc::epoll_event` on the
/// platforms this crate targets -- `events: u32` followed by an 8-byte
/// data word, `#[repr(C, packed)]` so there's no trailing padding
/// `epoll_event` doesn't have either. `wait()` reinterprets the kernel's
/// output buffer as a slice of these directly; that cast is only sound
/// because the layouts match field-for-field, so this type and
/// `libc::epoll_event` must never drift apart.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Event {
    events: u32,
    data: u64,
}

impl Event {
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.data as RawFd
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.events & (libc::EPOLLIN as u32) != 0
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.events & (libc::EPOLLOUT as u32) != 0
    }

    #[inline]
    pub fn is_hangup(&self) -> bool {
        self.events & ((libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32) != 0
    }
}

/// Readiness demultiplexer: `add`/`modify`/`remove`/`wait` over one epoll
/// instance. Owned exclusively by the Reactor thread -- see the
/// concurrency model in the spec for why workers never touch this type
/// directly, only request mutations the Reactor performs on their behalf.
pub struct Demultiplexer {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
}

impl Demultiplexer {
    pub fn new(max_events: usize) -> io::Result<Self> {
        // SAFETY: epoll_create1 takes no pointers; a negative return is
        // the only failure signal and is handled below.
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epoll_fd, events: vec![unsafe { mem::zeroed() }; max_events] })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Option<Interest>) -> io::Result<()> {
        let mut ev: libc::epoll_event = unsafe { mem::zeroed() };
        if let Some(interest) = interest {
            ev.events = interest.bits();
            ev.u64 = fd as u64;
        }
        // SAFETY: `ev` is a valid, fully-initialized epoll_event (or
        // ignored entirely for EPOLL_CTL_DEL); `fd` is caller-owned.
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(interest))
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some(interest))
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    /// Blocks up to `timeout` (or indefinitely if `None`) and returns the
    /// events that fired. Interrupted waits are retried internally but
    /// never extend past the original deadline.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<&[Event]> {
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        };

        let deadline = timeout.map(|d| std::time::Instant::now() + d);
        loop {
            // SAFETY: `self.events` is a valid buffer of `epoll_event`
            // with `len()` capacity; no other thread touches this fd.
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    self.events.as_mut_ptr(),
                    self.events.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if n >= 0 {
                let n = n as usize;
                // SAFETY: `Event` is a `#[repr(C, packed)]` mirror of
                // `libc::epoll_event`'s exact field layout (see its doc
                // comment), and `n` is the count `epoll_wait` itself just
                // reported as initialized within `self.events`.
                let view: &[Event] = unsafe {
                    std::slice::from_raw_parts(self.events.as_ptr().cast(), n)
                };
                return Ok(view);
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                if let Some(deadline) = deadline {
                    if std::time::Instant::now() >= deadline {
                        return Ok(&[]);
                    }
                }
                continue;
            }
            return Err(err);
        }
    }
}

impl Drop for Demultiplexer {
    fn drop(&mut self) {
        // SAFETY: `epoll_fd` is owned exclusively by this struct.
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

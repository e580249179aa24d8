// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Thin wrapper over the Linux edge-triggered, one-shot readiness facility.
//!
//! `mio::Poll` (used by the sibling TCP transport's I/O thread) requires
//! `&mut self` on every `poll()` call, which makes it an owning, single-thread
//! abstraction. The dispatch loop here needs the opposite: one kernel
//! readiness object `epoll_wait`-ed concurrently by every worker thread. The
//! kernel supports that directly (multiple threads may block in
//! `epoll_wait()` on the same epoll fd), so this module talks to
//! `epoll_create1`/`epoll_ctl`/`epoll_wait` directly instead of going through
//! `mio`.

use std::io;
use std::os::unix::io::RawFd;

/// Readable.
pub const READABLE: u32 = libc::EPOLLIN as u32;
/// Writable.
pub const WRITABLE: u32 = libc::EPOLLOUT as u32;
/// Error condition (always implicitly reported by the kernel; listed
/// explicitly here so callers can mask it off when decoding events).
pub const ERROR: u32 = libc::EPOLLERR as u32;
/// Peer hung up.
pub const HANGUP: u32 = libc::EPOLLHUP as u32;
/// Urgent/priority data.
pub const PRIORITY: u32 = libc::EPOLLPRI as u32;
/// Edge-triggered delivery.
pub const EDGE_TRIGGERED: u32 = libc::EPOLLET as u32;
/// One-shot delivery: the kernel disarms interest after the first event.
pub const ONE_SHOT: u32 = libc::EPOLLONESHOT as u32;

/// One decoded readiness event: the fired mask and the 64-bit payload that
/// was attached at the most recent arming.
#[derive(Debug, Clone, Copy)]
pub struct RawEvent {
    pub mask: u32,
    pub payload: u64,
}

/// Sentinel payload for the internal wake-up fd. No real slot payload can
/// ever equal this: a handle is at most `OUTER_TABLES * SLOTS_PER_TABLE - 1`
/// and a `gen` is a `u32`, so the packed `(handle, gen)` payload never fills
/// every bit.
pub(crate) const WAKE_PAYLOAD: u64 = u64::MAX;

/// A single shared kernel readiness handle.
///
/// Cheap to share: `epoll_ctl`/`epoll_wait` are thread-safe kernel
/// operations on the same `epfd`, so `Kernel` only needs `&self` everywhere.
///
/// Carries its own wake-up `eventfd`, armed level-triggered (no
/// `ONE_SHOT`/`EDGE_TRIGGERED`) so that a single [`Kernel::wake`] call rouses
/// every worker currently parked in [`Kernel::wait_one`] — `epoll_wait`
/// wakes all threads blocked on the same `epfd` when a level-triggered
/// interest becomes ready, since this fd is not armed `EPOLLEXCLUSIVE`.
pub struct Kernel {
    epfd: RawFd,
    wake_fd: RawFd,
}

// SAFETY: `epfd` is a kernel object designed for concurrent use from many
// threads (arming, modifying, detaching and waiting are all safe to
// interleave across threads on the same epoll fd).
unsafe impl Send for Kernel {}
unsafe impl Sync for Kernel {}

impl Kernel {
    /// Create a new kernel readiness handle. `hint` sizes the kernel's
    /// internal interest-list hash table; modern epoll ignores the value
    /// beyond requiring it be positive, but the hint is still passed through
    /// for forward compatibility with older kernels.
    pub fn new(hint: usize) -> io::Result<Self> {
        // SAFETY: epoll_create1(0) has no preconditions; it either returns a
        // valid fd or -1/errno. `hint` is accepted for API symmetry with the
        // legacy `epoll_create(size)` call but unused by EPOLL_CLOEXEC-style
        // creation.
        let _ = hint;
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `eventfd(0, ...)` has no preconditions beyond the flags
        // being valid; it either returns a valid fd or -1/errno.
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: `epfd` was just created by this call and not yet
            // handed to anyone else.
            unsafe {
                libc::close(epfd);
            }
            return Err(err);
        }
        let kernel = Self { epfd, wake_fd };
        kernel.arm(wake_fd, READABLE, WAKE_PAYLOAD)?;
        Ok(kernel)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, payload: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: payload,
        };
        // SAFETY: `ev` is a fully-initialized, stack-local `epoll_event`;
        // `self.epfd` is a live epoll fd owned by this `Kernel`; `fd` is the
        // caller's to arm/modify/detach. `epoll_ctl` does not retain the
        // pointer past the call.
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Arm `fd` with the kernel (`EPOLL_CTL_ADD`).
    pub fn arm(&self, fd: RawFd, events: u32, payload: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, payload)
    }

    /// Re-arm `fd` with a (possibly updated) event mask (`EPOLL_CTL_MOD`).
    pub fn modify(&self, fd: RawFd, events: u32, payload: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, payload)
    }

    /// Detach `fd` from the kernel (`EPOLL_CTL_DEL`).
    pub fn detach(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Block for exactly one event, with no timeout. Tolerates
    /// interrupted-system-call by retrying; never returns on a timeout since
    /// none is requested.
    pub fn wait_one(&self) -> io::Result<RawEvent> {
        loop {
            let mut ev = libc::epoll_event { events: 0, u64: 0 };
            // SAFETY: `&mut ev` is a valid pointer to one stack-local
            // `epoll_event`; `maxevents` (1) matches the buffer length;
            // timeout -1 blocks indefinitely. `self.epfd` is a live epoll fd.
            let ret = unsafe { libc::epoll_wait(self.epfd, &mut ev, 1, -1) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if ret == 0 {
                // No timeout was requested; treat a spurious zero as a retry.
                continue;
            }
            return Ok(RawEvent {
                mask: ev.events,
                // SAFETY: `u64` is the active field of the `epoll_data` union
                // because that's the only field this module ever writes.
                payload: unsafe { ev.u64 },
            });
        }
    }

    /// Rouse every worker currently parked in [`Kernel::wait_one`]. Safe to
    /// call with no workers parked (the counter just accumulates).
    pub fn wake(&self) {
        let one: u64 = 1;
        // SAFETY: `&one` points at 8 live bytes, matching `eventfd`'s
        // required write size; the fd is open for the lifetime of `self`.
        unsafe {
            libc::write(self.wake_fd, &one as *const u64 as *const _, 8);
        }
    }

    /// Drain the wake counter after observing [`WAKE_PAYLOAD`]. Only one
    /// racing worker actually reads a nonzero value; the rest see `EAGAIN`
    /// (the fd is non-blocking), which is not an error here.
    pub(crate) fn drain_wake(&self) {
        let mut buf: u64 = 0;
        // SAFETY: `&mut buf` points at 8 writable bytes, matching
        // `eventfd`'s required read size.
        unsafe {
            libc::read(self.wake_fd, &mut buf as *mut u64 as *mut _, 8);
        }
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        // SAFETY: `self.epfd`/`self.wake_fd` are owned exclusively by this
        // `Kernel` and have not yet been closed.
        unsafe {
            libc::close(self.epfd);
            libc::close(self.wake_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        assert_eq!(ret, 0, "pipe2 failed: {}", io::Error::last_os_error());
        (fds[0], fds[1])
    }

    #[test]
    fn arm_and_fire_readable() {
        let kernel = Kernel::new(8).expect("create kernel");
        let (r, w) = pipe_pair();
        kernel
            .arm(r, READABLE | ONE_SHOT, 42)
            .expect("arm readable");

        unsafe {
            libc::write(w, b"x".as_ptr() as *const _, 1);
        }

        let ev = kernel.wait_one().expect("wait_one");
        assert_eq!(ev.payload, 42);
        assert_ne!(ev.mask & READABLE, 0);

        kernel.detach(r).expect("detach");
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn modify_updates_interest() {
        let kernel = Kernel::new(8).expect("create kernel");
        let (r, w) = pipe_pair();
        kernel.arm(r, READABLE | ONE_SHOT, 1).expect("arm");
        kernel
            .modify(r, READABLE | WRITABLE | ONE_SHOT, 2)
            .expect("modify");
        kernel.detach(r).expect("detach");
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}

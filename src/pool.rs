// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The pool object: owns the kernel readiness handle, the slot table, the
//! worker roster, and the poller-death registry, and exposes the
//! registration API described in the component design.

use parking_lot::{Condvar, Mutex};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{PoolError, Result};
use crate::handler::{DispatchEvent, Handler};
use crate::kernel::{self, Kernel};
use crate::slot::{Handle, OuterBucket, SlotTable};
use crate::{debug, info, warn};

/// Maximum number of worker threads a pool can run concurrently.
pub const MAX_THREADS: usize = 32;

/// Tri-valued interest update used by [`Pool::register`] and
/// [`Pool::select_on`]: enable the bit, clear it, or leave it unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    /// Enable the corresponding readiness bit.
    Enable,
    /// Clear the corresponding readiness bit.
    Disable,
    /// Leave the bit as it currently is.
    Unchanged,
}

/// Construction parameters for [`Pool::new`].
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Sizing hint passed to the kernel readiness handle.
    pub hint_count: usize,
    /// Desired worker count for the initial [`Pool::dispatch`] call.
    pub worker_count: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            hint_count: 1024,
            worker_count: 4,
        }
    }
}

/// The always-on bits applied to every registered slot, matching the
/// spec's `{error, hangup, priority, one-shot}` base mask.
const BASE_EVENTS: u32 = kernel::ERROR
    | kernel::HANGUP
    | kernel::PRIORITY
    | kernel::ONE_SHOT
    | kernel::EDGE_TRIGGERED;

/// Fields protected by the pool mutex: the worker roster, outer-table
/// allocation bookkeeping that isn't already lock-free via `ArcSwapOption`,
/// the poller-death registry, and the destroy/thread-count counters.
pub(crate) struct PoolState {
    /// `roster[i]` is 0 if worker `i+1` is dead/never started, otherwise a
    /// nonzero spawn epoch identifying the live worker occupying that slot.
    roster: [u64; MAX_THREADS],
    active_thread_count: usize,
    event_thread_count: usize,
    poller_gen: u64,
    destroy: bool,
    poller_death: Vec<Handle>,
    poller_death_sliced: bool,
    dispatch_called: bool,
}

impl PoolState {
    fn new() -> Self {
        Self {
            roster: [0; MAX_THREADS],
            active_thread_count: 0,
            event_thread_count: 0,
            poller_gen: 0,
            destroy: false,
            poller_death: Vec::new(),
            poller_death_sliced: false,
            dispatch_called: false,
        }
    }
}

/// The pool object described in §4.2 of the spec.
pub struct Pool {
    kernel: Kernel,
    table: SlotTable,
    state: Mutex<PoolState>,
    cond: Condvar,
    next_epoch: AtomicU64,
}

impl Pool {
    /// Create a new pool: kernel readiness handle, pool mutex/condvar, and
    /// the first outer bucket, all eagerly allocated.
    pub fn new(config: PoolConfig) -> Result<Arc<Self>> {
        let kernel = Kernel::new(config.hint_count).map_err(PoolError::KernelArmingFailure)?;
        let table = SlotTable::new();
        table.preallocate_first_bucket();
        debug!("pool created with hint_count={}", config.hint_count);
        Ok(Arc::new(Self {
            kernel,
            table,
            state: Mutex::new(PoolState::new()),
            cond: Condvar::new(),
            next_epoch: AtomicU64::new(0),
        }))
    }

    fn encode_events(want_read: Want, want_write: Want, previous: u32) -> u32 {
        let mut events = previous;
        apply_want(&mut events, kernel::READABLE, want_read);
        apply_want(&mut events, kernel::WRITABLE, want_write);
        events
    }

    fn payload(handle: Handle, gen: u32) -> u64 {
        (handle.raw() as u64) | ((gen as u64) << 32)
    }

    fn decode_payload(payload: u64) -> (Handle, u32) {
        let raw = (payload & 0xFFFF_FFFF) as u32;
        let gen = (payload >> 32) as u32;
        (crate::slot::Handle::from_raw(raw), gen)
    }

    fn cell(&self, handle: Handle) -> Option<Arc<OuterBucket>> {
        self.table.cell(handle)
    }

    /// Register `fd` for readiness notifications.
    ///
    /// `want_read`/`want_write` follow the tri-valued contract shared with
    /// [`Pool::select_on`]. Returns the handle on success.
    pub fn register(
        self: &Arc<Self>,
        fd: RawFd,
        handler: Arc<dyn Handler>,
        want_read: Want,
        want_write: Want,
        notify_on_poller_death: bool,
    ) -> Result<Handle> {
        let events = Self::encode_events(want_read, want_write, BASE_EVENTS);

        let handle = {
            let mut st = self.state.lock();
            if st.destroy {
                return Err(PoolError::PoolClosed);
            }
            let handle = self
                .table
                .allocate(fd, events, handler, notify_on_poller_death)
                .ok_or(PoolError::CapacityExhausted)?;
            if notify_on_poller_death {
                st.poller_death.push(handle);
            }
            handle
        };

        let gen = {
            let bucket = self.cell(handle).expect("just-allocated bucket present");
            bucket.slots[handle_inner(handle)].inner.lock().gen
        };

        if let Err(e) = self.kernel.arm(fd, events, Self::payload(handle, gen)) {
            warn!("kernel arm failed for fd={}: {}", fd, e);
            self.release(handle);
            return Err(PoolError::KernelArmingFailure(e));
        }

        debug!("registered fd={} as handle={:?} gen={}", fd, handle, gen);
        Ok(handle)
    }

    /// Update interest for an already-registered `fd`.
    ///
    /// If a worker currently has this slot's handler in flight
    /// (`in_handler > 0`), the update is deferred: the next re-arm (from
    /// [`Pool::handled`]) picks it up, and no kernel call is made here.
    pub fn select_on(
        self: &Arc<Self>,
        handle: Handle,
        fd: RawFd,
        want_read: Want,
        want_write: Want,
    ) -> Result<()> {
        let bucket = self.cell(handle).ok_or(PoolError::InvalidHandle)?;
        let cell = &bucket.slots[handle_inner(handle)];
        cell.refcount.fetch_add(1, Ordering::AcqRel);

        let rearm = {
            let mut inner = cell.inner.lock();
            if inner.fd != fd {
                drop(inner);
                self.release(handle);
                return Err(PoolError::InvalidHandle);
            }
            inner.events = Self::encode_events(want_read, want_write, inner.events);
            if inner.in_handler > 0 {
                None
            } else {
                Some((inner.events, inner.gen))
            }
        };

        if let Some((events, gen)) = rearm {
            if let Err(e) = self.kernel.modify(fd, events, Self::payload(handle, gen)) {
                self.release(handle);
                return Err(PoolError::KernelArmingFailure(e));
            }
        }

        self.release(handle);
        Ok(())
    }

    fn unregister_inner(self: &Arc<Self>, handle: Handle, fd: RawFd, close: bool) -> Result<()> {
        let bucket = self.cell(handle).ok_or(PoolError::InvalidHandle)?;
        let cell = &bucket.slots[handle_inner(handle)];
        cell.refcount.fetch_add(1, Ordering::AcqRel);

        {
            let mut inner = cell.inner.lock();
            if inner.fd != fd {
                drop(inner);
                self.release(handle);
                return Err(PoolError::InvalidHandle);
            }
            if let Err(e) = self.kernel.detach(fd) {
                // Per the error-handling design, a failed detach still lets
                // the slot be reclaimed safely: `gen` is bumped below so any
                // late kernel delivery is filtered as stale.
                warn!("kernel detach failed for fd={}: {}", fd, e);
            }
            inner.do_close = close;
            inner.gen = inner.gen.wrapping_add(1);
        }

        // Drop the lookup reference and the registration's own reference.
        self.release(handle);
        self.release(handle);
        Ok(())
    }

    /// Detach `fd` from the kernel and drop the registration, without
    /// closing `fd`. A negative/absent handle is a no-op (the safe shutdown
    /// path described in the spec).
    pub fn unregister(self: &Arc<Self>, handle: Option<Handle>, fd: RawFd) -> Result<()> {
        let Some(handle) = handle else {
            return Ok(());
        };
        self.unregister_inner(handle, fd, false)
    }

    /// As [`Pool::unregister`], but closes `fd` once the last reference to
    /// the slot drops.
    pub fn unregister_close(self: &Arc<Self>, handle: Option<Handle>, fd: RawFd) -> Result<()> {
        let Some(handle) = handle else {
            return Ok(());
        };
        self.unregister_inner(handle, fd, true)
    }

    /// Called by the registrant after its handler returns. Re-arms the
    /// kernel with the latest `events` once `in_handler` returns to zero;
    /// a generation mismatch means the slot was unregistered mid-handler
    /// and the call is a silent no-op.
    pub fn handled(self: &Arc<Self>, handle: Handle, fd: RawFd, gen: u32) -> Result<()> {
        let bucket = self.cell(handle).ok_or(PoolError::InvalidHandle)?;
        let cell = &bucket.slots[handle_inner(handle)];
        cell.refcount.fetch_add(1, Ordering::AcqRel);

        let rearm = {
            let mut inner = cell.inner.lock();
            if inner.fd != fd {
                drop(inner);
                self.release(handle);
                return Err(PoolError::InvalidHandle);
            }
            inner.in_handler = inner.in_handler.saturating_sub(1);
            if inner.gen != gen {
                None
            } else if inner.in_handler == 0 {
                Some((inner.fd, inner.events, inner.gen))
            } else {
                None
            }
        };

        if let Some((fd, events, gen)) = rearm {
            if let Err(e) = self.kernel.modify(fd, events, Self::payload(handle, gen)) {
                warn!("kernel re-arm failed for fd={}: {}", fd, e);
            }
        }

        self.release(handle);
        Ok(())
    }

    /// Drop a reference, deallocating the slot (and closing its `fd` if
    /// `do_close` was set) once it reaches zero.
    pub(crate) fn release(self: &Arc<Self>, handle: Handle) {
        let Some(bucket) = self.cell(handle) else {
            return;
        };
        let cell = &bucket.slots[handle_inner(handle)];
        if cell.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let mut st = self.state.lock();
        if let Some((do_close, fd)) = dealloc_locked(&mut st, &bucket, cell, handle) {
            drop(st);
            if do_close && fd >= 0 {
                // SAFETY: `fd` was captured under the slot lock right before
                // the slot was marked free; nobody else can have started
                // using it as a different registration yet because `gen`
                // was bumped first.
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }

    /// As [`Pool::release`], but for callers that already hold the pool
    /// mutex (the poller-death retirement path).
    fn release_locked(&self, st: &mut PoolState, handle: Handle) {
        let Some(bucket) = self.table.cell(handle) else {
            return;
        };
        let cell = &bucket.slots[handle_inner(handle)];
        if cell.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if let Some((do_close, fd)) = dealloc_locked(st, &bucket, cell, handle) {
            if do_close && fd >= 0 {
                // SAFETY: see `Pool::release`.
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }

    /// Spawn `worker_count` workers (clamped to `[1, MAX_THREADS]`). Worker
    /// 1 is joinable and this call blocks until it exits; every other
    /// worker is detached.
    pub fn dispatch(self: &Arc<Self>, worker_count: usize) {
        let n = worker_count.clamp(1, MAX_THREADS);
        let mut worker1 = None;
        {
            let mut st = self.state.lock();
            st.event_thread_count = n;
            st.dispatch_called = true;
            for idx in 1..=n {
                let handle = self.spawn_worker(&mut st, idx);
                if idx == 1 {
                    worker1 = Some(handle);
                }
            }
        }
        if let Some(jh) = worker1 {
            let _ = jh.join();
        }
    }

    /// Grow or shrink the live worker count. Growing beyond the worker
    /// count reached by the most recent [`Pool::dispatch`] call is only
    /// honored once `dispatch()` has actually run (worker 1 alive);
    /// shrinking always just lowers the target and lets the excess workers
    /// retire cooperatively.
    pub fn reconfigure_threads(self: &Arc<Self>, worker_count: usize) {
        let n = worker_count.min(MAX_THREADS);
        let mut st = self.state.lock();
        let old = st.event_thread_count;
        st.event_thread_count = n;
        if n > old && st.dispatch_called {
            for idx in (old + 1)..=n {
                if st.roster[idx - 1] == 0 {
                    let jh = self.spawn_worker(&mut st, idx);
                    drop(jh); // detached: its JoinHandle is discarded
                }
            }
        }
        drop(st);
        // Workers parked in an idle `epoll_wait` only re-check
        // `event_thread_count` after returning from `wait_one`; a shrink
        // needs to rouse them even with no FD activity.
        self.kernel.wake();
    }

    fn spawn_worker(
        self: &Arc<Self>,
        st: &mut PoolState,
        idx: usize,
    ) -> std::thread::JoinHandle<()> {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        st.roster[idx - 1] = epoch;
        st.active_thread_count += 1;
        let pool = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("evpoll-worker-{idx}"))
            .spawn(move || worker_loop(pool, idx))
            .expect("spawn worker thread")
    }

    /// Set the destroy flag (subsequent `register` calls fail) and, once no
    /// workers remain, tear the pool down. Safe to call repeatedly: the
    /// flag is set on every call regardless of outcome, so the usual
    /// sequence is `pool_destroy()` (fails while workers are draining) ->
    /// `reconfigure_threads(0)` -> `pool_destroy()` (succeeds).
    pub fn pool_destroy(self: Arc<Self>) -> Result<()> {
        let mut st = self.state.lock();
        st.destroy = true;
        let active = st.active_thread_count;
        drop(st);
        self.kernel.wake();
        if active != 0 {
            debug!("pool_destroy deferred: {} workers still active", active);
            return Err(PoolError::PoolClosed);
        }
        info!("pool destroyed");
        Ok(())
        // `self` drops here; once the last `Arc<Pool>` clone is gone,
        // `Kernel`'s `Drop` closes the epoll fd.
    }
}

fn apply_want(events: &mut u32, bit: u32, want: Want) {
    match want {
        Want::Enable => *events |= bit,
        Want::Disable => *events &= !bit,
        Want::Unchanged => {}
    }
}

fn handle_inner(handle: Handle) -> usize {
    handle.raw() as usize % crate::slot::SLOTS_PER_TABLE
}

/// Deallocate a slot whose refcount was just observed to reach zero.
///
/// Must be called with the pool mutex held. Re-checks the refcount under
/// the lock before actually freeing: the poller-death retirement path can
/// race a reference back up to 1 between the caller's `fetch_sub` and this
/// function acquiring the pool mutex (see `Pool::release`'s doc comment on
/// `dealloc_locked`'s re-check).
fn dealloc_locked(
    st: &mut PoolState,
    bucket: &OuterBucket,
    cell: &crate::slot::SlotCell,
    handle: Handle,
) -> Option<(bool, RawFd)> {
    if cell.refcount.load(Ordering::Acquire) != 0 {
        return None;
    }
    let mut inner = cell.inner.lock();
    if inner.is_free() {
        return None;
    }
    let do_close = inner.do_close;
    let fd = inner.fd;
    let was_notifying = inner.notify_on_poller_death;
    inner.mark_free();
    drop(inner);
    bucket.slots_used.fetch_sub(1, Ordering::AcqRel);
    if was_notifying {
        st.poller_death.retain(|&h| h != handle);
    }
    debug!("slot {:?} deallocated (fd={}, do_close={})", handle, fd, do_close);
    Some((do_close, fd))
}

/// Body of a single worker thread: wait for one kernel event, validate and
/// dispatch it, or retire once this worker's 1-based index exceeds the
/// configured thread count.
fn worker_loop(pool: Arc<Pool>, index: usize) {
    loop {
        {
            let st = pool.state.lock();
            if index > st.event_thread_count {
                drop(st);
                retire(&pool, index);
                return;
            }
        }

        match pool.kernel.wait_one() {
            Ok(event) if event.payload == kernel::WAKE_PAYLOAD => {
                pool.kernel.drain_wake();
                continue;
            }
            Ok(event) => {
                let (handle, gen) = Pool::decode_payload(event.payload);
                dispatch_one(&pool, handle, gen, event.mask);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("kernel wait_one error: {}", e);
                continue;
            }
        }
    }
}

fn dispatch_one(pool: &Arc<Pool>, handle: Handle, gen: u32, mask: u32) {
    let Some(bucket) = pool.cell(handle) else {
        return;
    };
    let cell = &bucket.slots[handle_inner(handle)];
    cell.refcount.fetch_add(1, Ordering::AcqRel);

    let chosen = {
        let mut inner = cell.inner.lock();
        if inner.is_free() || inner.gen != gen {
            None
        } else if inner.in_handler > 0 {
            None
        } else if inner.handled_error {
            // Error already delivered once for this arming: suppress
            // further events until select_on/re-registration reactivates
            // it. `in_handler` is deliberately left untouched since no
            // `handled()` call will ever arrive for this suppressed event.
            None
        } else {
            let is_err = mask & (kernel::ERROR | kernel::HANGUP) != 0;
            inner.handled_error = is_err;
            inner.in_handler += 1;
            Some((inner.handler.clone(), inner.fd))
        }
    };

    if let Some((Some(handler), fd)) = chosen {
        let event = DispatchEvent {
            fd,
            handle,
            gen,
            readable: mask & (kernel::READABLE | kernel::PRIORITY) != 0,
            writable: mask & kernel::WRITABLE != 0,
            error: mask & (kernel::ERROR | kernel::HANGUP) != 0,
            poller_died: false,
        };
        handler.handle(&event);
    }

    pool.release(handle);
}

/// Worker retirement: splice the poller-death registry out, notify every
/// registrant wanting a terminal callback, then splice it back.
fn retire(pool: &Arc<Pool>, index: usize) {
    let local = {
        let mut st = pool.state.lock();
        while st.poller_death_sliced {
            pool.cond.wait(&mut st);
        }
        st.roster[index - 1] = 0;
        st.active_thread_count -= 1;
        st.poller_gen += 1;
        let gen_at_retirement = st.poller_gen;

        let handles = st.poller_death.clone();
        for &h in &handles {
            if let Some(bucket) = pool.table.cell(h) {
                bucket.slots[handle_inner(h)]
                    .refcount
                    .fetch_add(1, Ordering::AcqRel);
            }
        }
        st.poller_death_sliced = true;
        pool.cond.notify_all();
        info!(
            "worker {} retiring, notifying {} poller-death registrants",
            index,
            handles.len()
        );
        (handles, gen_at_retirement)
    };
    let (handles, gen_at_retirement) = local;

    for &h in &handles {
        let snapshot = pool.cell(h).and_then(|bucket| {
            let inner = bucket.slots[handle_inner(h)].inner.lock();
            inner.handler.clone().map(|handler| (handler, inner.fd))
        });
        if let Some((handler, fd)) = snapshot {
            let event = DispatchEvent {
                fd,
                handle: h,
                gen: gen_at_retirement as u32,
                readable: false,
                writable: false,
                error: false,
                poller_died: true,
            };
            handler.handle(&event);
        }
    }

    let mut st = pool.state.lock();
    for &h in &handles {
        pool.release_locked(&mut st, h);
    }
    st.poller_death_sliced = false;
    pool.cond.notify_all();
}

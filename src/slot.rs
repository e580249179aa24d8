// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Two-level, lazily-grown slot table.
//!
//! The upper index selects an outer bucket (allocated lazily, never freed
//! until the pool itself is dropped); the lower index selects a slot within
//! it. The handle exposed to callers is `outer * SLOTS_PER_TABLE + inner`.
//!
//! A bucket, once allocated, is published through an [`ArcSwapOption`] so
//! dispatch-time lookups can snapshot it without taking the pool mutex —
//! only bucket *creation* (`None` -> `Some`) is serialized by the caller
//! holding the pool mutex. The outer vector itself is preallocated to its
//! full length ([`OUTER_TABLES`]) at construction, so indices never move
//! and no resize can invalidate a snapshot.

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::handler::Handler;
use std::sync::Arc;

/// Outer-table width (`T` in the spec).
pub const OUTER_TABLES: usize = 1024;
/// Inner-table width (`S` in the spec).
pub const SLOTS_PER_TABLE: usize = 1024;

/// Sentinel meaning "this slot is free".
pub(crate) const FREE_FD: RawFd = -1;

/// Stable integer handle for a slot's current identity.
///
/// Two slots never share a handle at the same time, but a handle is reused
/// (with a bumped [`SlotInner::gen`]) once its slot is deallocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    fn from_parts(outer: usize, inner: usize) -> Self {
        Self((outer * SLOTS_PER_TABLE + inner) as u32)
    }

    fn outer(self) -> usize {
        self.0 as usize / SLOTS_PER_TABLE
    }

    fn inner(self) -> usize {
        self.0 as usize % SLOTS_PER_TABLE
    }

    /// The raw integer value, for logging or FFI boundaries.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Reconstruct a handle from a raw value previously obtained via
    /// [`Handle::raw`] (e.g. unpacked from an epoll payload).
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// Per-FD bookkeeping, covered by the slot's own mutex (everything except
/// [`SlotCell::refcount`], which is atomic by design so lookups don't need
/// the slot lock just to bump a reference).
pub(crate) struct SlotInner {
    pub fd: RawFd,
    pub gen: u32,
    pub events: u32,
    pub handler: Option<Arc<dyn Handler>>,
    pub do_close: bool,
    pub in_handler: u32,
    pub handled_error: bool,
    pub notify_on_poller_death: bool,
}

impl SlotInner {
    fn free(gen: u32) -> Self {
        Self {
            fd: FREE_FD,
            gen,
            events: 0,
            handler: None,
            do_close: false,
            in_handler: 0,
            handled_error: false,
            notify_on_poller_death: false,
        }
    }

    pub fn is_free(&self) -> bool {
        self.fd == FREE_FD
    }

    /// Reset to the free state, bumping `gen` so any late kernel delivery
    /// against the old identity is recognized as stale.
    pub(crate) fn mark_free(&mut self) {
        self.fd = FREE_FD;
        self.gen = self.gen.wrapping_add(1);
        self.events = 0;
        self.handler = None;
        self.do_close = false;
        self.in_handler = 0;
        self.handled_error = false;
        self.notify_on_poller_death = false;
    }
}

/// One addressable slot cell: a lock around the mutable bookkeeping plus an
/// atomic reference count.
pub(crate) struct SlotCell {
    pub inner: Mutex<SlotInner>,
    pub refcount: AtomicU32,
}

impl SlotCell {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner::free(0)),
            refcount: AtomicU32::new(0),
        }
    }
}

/// A lazily-allocated bucket of [`SLOTS_PER_TABLE`] slots.
pub(crate) struct OuterBucket {
    pub slots: Box<[SlotCell]>,
    /// Best-effort occupancy count, used only to skip fully-occupied
    /// buckets during allocation scans; always mutated while the pool mutex
    /// is held.
    pub slots_used: std::sync::atomic::AtomicUsize,
}

impl OuterBucket {
    fn new() -> Self {
        let slots = (0..SLOTS_PER_TABLE).map(|_| SlotCell::new()).collect();
        Self {
            slots,
            slots_used: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

/// The two-level table itself. All mutation of *which* buckets exist is the
/// caller's responsibility to serialize (the pool mutex, per
/// `crate::pool`); reads of an already-published bucket need no lock.
pub(crate) struct SlotTable {
    outer: Vec<ArcSwapOption<OuterBucket>>,
}

impl SlotTable {
    pub fn new() -> Self {
        let outer = (0..OUTER_TABLES).map(|_| ArcSwapOption::empty()).collect();
        Self { outer }
    }

    /// Eagerly allocate the first outer bucket, matching the spec's pool
    /// construction contract.
    pub fn preallocate_first_bucket(&self) {
        self.outer[0].store(Some(Arc::new(OuterBucket::new())));
    }

    /// Snapshot the bucket a handle addresses, if it has been allocated.
    pub fn bucket(&self, handle: Handle) -> Option<Arc<OuterBucket>> {
        self.outer.get(handle.outer())?;
        self.outer[handle.outer()].load_full()
    }

    pub fn cell(&self, handle: Handle) -> Option<Arc<OuterBucket>> {
        self.bucket(handle)
    }

    /// Find a free slot and initialize it. Must be called with the pool
    /// mutex held (see `crate::pool::Pool::register`): this scans outer
    /// buckets in order, lazily creating one if every allocated bucket
    /// looks full, then linearly scans for `fd == -1`.
    ///
    /// On success the returned slot has `refcount == 1` (the registration's
    /// own reference) and its `inner` already populated.
    pub fn allocate(
        &self,
        fd: RawFd,
        events: u32,
        handler: Arc<dyn Handler>,
        notify_on_poller_death: bool,
    ) -> Option<Handle> {
        for outer_idx in 0..OUTER_TABLES {
            let bucket = match self.outer[outer_idx].load_full() {
                Some(b) => b,
                None => {
                    let fresh = Arc::new(OuterBucket::new());
                    self.outer[outer_idx].store(Some(fresh.clone()));
                    fresh
                }
            };

            if bucket.slots_used.load(Ordering::Acquire) >= SLOTS_PER_TABLE {
                continue;
            }

            for inner_idx in 0..SLOTS_PER_TABLE {
                let cell = &bucket.slots[inner_idx];
                let mut guard = cell.inner.lock();
                if !guard.is_free() {
                    continue;
                }
                let next_gen = guard.gen.wrapping_add(1);
                *guard = SlotInner {
                    fd,
                    gen: next_gen,
                    events,
                    handler: Some(handler),
                    do_close: false,
                    in_handler: 0,
                    handled_error: false,
                    notify_on_poller_death,
                };
                drop(guard);
                cell.refcount.store(1, Ordering::Release);
                bucket.slots_used.fetch_add(1, Ordering::AcqRel);
                return Some(Handle::from_parts(outer_idx, inner_idx));
            }
        }
        None
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

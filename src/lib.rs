// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A multi-threaded, edge-triggered, one-shot readiness-event demultiplexer.
//!
//! [`Pool`] wraps a single shared Linux `epoll` readiness handle and a
//! two-level slot table, and lets any number of worker threads drain it
//! concurrently. Each registered file descriptor gets a stable [`Handle`]
//! that survives across `select_on`/`handled` updates and is only retired
//! (with a bumped generation) once explicitly unregistered.
//!
//! ```ignore
//! use hdds_evpoll::{Pool, PoolConfig, Want};
//! use std::sync::Arc;
//!
//! let pool = Pool::new(PoolConfig::default())?;
//! let handle = pool.register(fd, Arc::new(|ev: &_| {
//!     // handle readiness, then:
//!     // pool.handled(ev.handle, ev.fd, ev.gen)?;
//! }), Want::Enable, Want::Unchanged, false)?;
//! # Ok::<(), hdds_evpoll::PoolError>(())
//! ```
//!
//! Worker threads are spawned with [`Pool::dispatch`] and resized live with
//! [`Pool::reconfigure_threads`]; registrants that asked for it are notified
//! with a `poller_died` event when the last worker retires.

pub mod error;
pub mod handler;
pub mod kernel;
pub mod logging;
pub mod pool;
pub mod slot;

pub use error::{PoolError, Result};
pub use handler::{DispatchEvent, Handler};
pub use kernel::{RawEvent, ERROR, HANGUP, PRIORITY, READABLE, WRITABLE};
pub use pool::{Pool, PoolConfig, Want, MAX_THREADS};
pub use slot::{Handle, OUTER_TABLES, SLOTS_PER_TABLE};

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the readiness-event pool.

use std::fmt;

/// Result type for pool operations.
pub type Result<T> = core::result::Result<T, PoolError>;

/// Errors surfaced to callers of the pool's public API.
///
/// `StaleDispatch` (generation mismatch or slot reuse observed inside the
/// dispatch loop) is deliberately not a variant here: it is recovered from
/// internally and never returned to a caller.
#[derive(Debug)]
pub enum PoolError {
    /// Registration attempted after [`crate::pool::Pool::pool_destroy`] set
    /// the destroy flag.
    PoolClosed,
    /// No free slot could be found or allocated in the slot table.
    CapacityExhausted,
    /// The handle is out of range, or the `fd` passed alongside it does not
    /// match the slot's current occupant.
    InvalidHandle,
    /// The kernel readiness facility rejected an arm/modify/detach request.
    KernelArmingFailure(std::io::Error),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolClosed => write!(f, "pool is closing, registration refused"),
            Self::CapacityExhausted => write!(f, "no free slot available in the slot table"),
            Self::InvalidHandle => write!(f, "handle is unknown, out of range, or fd mismatch"),
            Self::KernelArmingFailure(e) => write!(f, "kernel readiness facility error: {e}"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::KernelArmingFailure(e) => Some(e),
            _ => None,
        }
    }
}

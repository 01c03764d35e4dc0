//! Allocator front ends, generic over where the bytes come from.
//!
//! ## Basic Types
//!
//! ### [`Allocator`]
//!
//! The interface the rest of a program codes against: allocate with an
//! optional call site, deallocate by pointer alone, and query or report the
//! leak tracker.
//!
//! ### [`PoolAllocator`]
//!
//! An [`Allocator`] backed by a [`Pool`] — the implementation meant for
//! production use.
//!
//! ### [`SystemAllocator`]
//!
//! An [`Allocator`] that forwards every request straight to the OS shim,
//! one mapping per allocation. Useful as a baseline and for ruling the pool
//! out when chasing a corruption.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::HashMap;
use std::io;

use log::{error, warn};
use spin::Mutex;

use crate::error::AllocError;
use crate::os::{self, Counters};
use crate::pool::{Pool, DEFAULT_ALIGNMENT, MAX_ALIGNMENT};
use crate::tracker::{AllocSite, Tracker};

/// A general allocator: the pool's public surface behind a trait so callers
/// can swap implementations.
pub trait Allocator {
    /// Allocate `size` bytes at `alignment`, optionally recording the call
    /// site for leak reports.
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        site: Option<AllocSite>,
    ) -> Result<NonNull<u8>, AllocError>;

    /// The nothrow path: `None` instead of an error.
    fn try_allocate(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        self.allocate(size, alignment, None).ok()
    }

    /// Release a pointer previously returned by [`allocate`](Self::allocate).
    fn deallocate(&self, pointer: *mut u8);

    /// Start reporting allocations to the leak tracker.
    fn enable_leak_detection(&self, detailed: bool);

    /// Write a leak report to stderr.
    fn report_leaks(&self);

    /// Bytes currently outstanding, headers included.
    fn current_used_bytes(&self) -> usize;
}

/// An [`Allocator`] that maps every allocation directly from the OS.
pub struct SystemAllocator {
    tracking: AtomicBool,
    counters: Counters,
    mappings: Mutex<HashMap<usize, usize>>,
}

impl SystemAllocator {
    pub fn new() -> Self {
        SystemAllocator {
            tracking: AtomicBool::new(false),
            counters: Counters::new(),
            mappings: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for SystemAllocator {
    fn default() -> Self {
        SystemAllocator::new()
    }
}

impl Allocator for SystemAllocator {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        site: Option<AllocSite>,
    ) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let alignment = if alignment == 0 {
            DEFAULT_ALIGNMENT
        } else {
            alignment
        };
        if !alignment.is_power_of_two() || alignment > MAX_ALIGNMENT {
            return Err(AllocError::InvalidAlignment { alignment });
        }

        let pointer = os::os_allocate(size, alignment).map_err(|err| AllocError::OutOfMemory {
            requested: err.requested,
        })?;

        self.counters.charge(size);
        os::process_counters().charge(size);
        self.mappings.lock().insert(pointer.as_ptr() as usize, size);

        if self.tracking.load(Ordering::Relaxed) {
            Tracker::global().track_allocation(
                pointer.as_ptr(),
                size,
                site.unwrap_or(AllocSite::UNKNOWN),
                pointer.as_ptr(),
            );
        }
        Ok(pointer)
    }

    fn deallocate(&self, pointer: *mut u8) {
        if pointer.is_null() {
            return;
        }
        let size = match self.mappings.lock().remove(&(pointer as usize)) {
            Some(size) => size,
            None => {
                warn!("system allocator: untracked pointer {:p} ignored", pointer);
                return;
            }
        };

        if self.tracking.load(Ordering::Relaxed) {
            Tracker::global().track_deallocation(pointer);
        }
        self.counters.discharge(size);
        os::process_counters().discharge(size);
        // The pointer came out of our own map, so it is a valid mapping base.
        os::os_deallocate(unsafe { NonNull::new_unchecked(pointer) }, size);
    }

    fn enable_leak_detection(&self, detailed: bool) {
        Tracker::global().enable(detailed);
        self.tracking.store(true, Ordering::Relaxed);
    }

    fn report_leaks(&self) {
        if let Err(err) = Tracker::global().report_leaks(io::stderr()) {
            error!("leak report failed: {}", err);
        }
    }

    fn current_used_bytes(&self) -> usize {
        self.counters.used_bytes()
    }
}

impl Drop for SystemAllocator {
    fn drop(&mut self) {
        let used = self.counters.used_bytes();
        let ops = self.counters.net_ops();
        if used != 0 || ops != 0 {
            eprintln!(
                "[tiered-alloc] system allocator teardown imbalance: {} bytes outstanding, {} net operations",
                used, ops
            );
        }
    }
}

/// An [`Allocator`] backed by a [`Pool`].
pub struct PoolAllocator {
    pool: Pool,
}

impl PoolAllocator {
    pub fn new() -> Self {
        PoolAllocator { pool: Pool::new() }
    }

    /// The pool behind this allocator, for pool-specific operations such as
    /// [`Pool::flush_thread_cache`].
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl Default for PoolAllocator {
    fn default() -> Self {
        PoolAllocator::new()
    }
}

impl Allocator for PoolAllocator {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        site: Option<AllocSite>,
    ) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        self.pool
            .allocate_traced(size, alignment, site.unwrap_or(AllocSite::UNKNOWN))
    }

    fn deallocate(&self, pointer: *mut u8) {
        self.pool.deallocate(pointer);
    }

    fn enable_leak_detection(&self, detailed: bool) {
        self.pool.enable_leak_tracking(detailed);
    }

    fn report_leaks(&self) {
        if let Err(err) = self.pool.report_leaks(io::stderr()) {
            error!("leak report failed: {}", err);
        }
    }

    fn current_used_bytes(&self) -> usize {
        self.pool.current_used_bytes()
    }
}

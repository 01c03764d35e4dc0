//! A tiered, thread-aware memory pool built directly on anonymous virtual
//! memory.
//!
//! The pool serves requests from four tiers, picked by size:
//!
//! | Tier | Band | Strategy |
//! |---|---|---|
//! | small | up to 1 MiB | 64 size classes, thread-local caches, lock-free global stacks |
//! | medium | up to 512 MiB | buddy system over ten power-of-two orders, asynchronous coalescing |
//! | large | up to 1 GiB | one mapping per allocation |
//! | huge | above 1 GiB | one mapping per allocation |
//!
//! Every returned pointer is preceded by a routing record (or, on the
//! oversized-alignment path, a sentinel-tagged envelope), so
//! [`Pool::deallocate`] needs nothing but the pointer.
//!
//! ```
//! use tiered_alloc::{Pool, DEFAULT_ALIGNMENT};
//!
//! let pool = Pool::new();
//! let ptr = pool.allocate(1024, DEFAULT_ALIGNMENT).unwrap();
//! unsafe { ptr.as_ptr().write_bytes(0, 1024) };
//! pool.deallocate(ptr.as_ptr());
//! assert_eq!(pool.current_used_bytes(), 0);
//! ```
//!
//! For a drop-in allocator object, see [`PoolAllocator`] and the
//! [`Allocator`] trait; [`SystemAllocator`] provides the same interface
//! with one OS mapping per allocation.

mod allocators;
mod direct;
mod error;
mod medium;
mod pool;
mod size_class;
mod small;
mod tagged;
mod tracker;

pub mod os;

pub use allocators::{Allocator, PoolAllocator, SystemAllocator};
pub use error::AllocError;
pub use pool::{Pool, DEFAULT_ALIGNMENT, MAX_ALIGNMENT};
pub use tracker::{AllocSite, Tracker};

/// Allocate from `$pool` with the call site recorded for leak reports.
///
/// Expands to [`Pool::allocate_traced`] with `file!()` / `line!()` filled
/// in, which is as close as a function can get to the preprocessor-era
/// `ALLOCATE(size)` convention.
#[macro_export]
macro_rules! alloc_here {
    ($pool:expr, $size:expr) => {
        $pool.allocate_traced(
            $size,
            $crate::DEFAULT_ALIGNMENT,
            $crate::AllocSite {
                file: file!(),
                line: line!(),
            },
        )
    };
}

/// [`alloc_here!`] with an explicit alignment.
#[macro_export]
macro_rules! alloc_aligned_here {
    ($pool:expr, $size:expr, $alignment:expr) => {
        $pool.allocate_traced(
            $size,
            $alignment,
            $crate::AllocSite {
                file: file!(),
                line: line!(),
            },
        )
    };
}

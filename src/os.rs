//! The virtual-memory shim: page-aligned anonymous mappings and the
//! process-wide accounting counters.
//!
//! Everything above this module deals in blocks and headers; this module is
//! the only place that talks to the kernel. It exposes exactly two
//! operations, [`os_allocate`] and [`os_deallocate`], plus a [`Counters`]
//! pair that the dispatcher charges once per outstanding user allocation.

use core::fmt;
use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use errno::{errno, Errno};
use log::warn;

/// Largest alignment [`os_allocate`] accepts, and the ceiling the dispatcher
/// enforces on user-requested alignment.
pub const MAX_OS_ALIGNMENT: usize = 64 * 1024;

/// A refused or failed mapping, with the `errno` the kernel reported.
#[derive(Debug, Clone, Copy)]
pub struct MmapError {
    pub errno: Errno,
    pub requested: usize,
}

impl fmt::Display for MmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mapping of {} bytes failed: {}",
            self.requested, self.errno
        )
    }
}

impl std::error::Error for MmapError {}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// The OS page size, resolved once via `sysconf` and cached.
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let resolved = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    PAGE_SIZE.store(resolved, Ordering::Relaxed);
    resolved
}

/// Round `value` up to the next multiple of `align`; `align` must be a
/// power of two.
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    let mask = align - 1;
    (value + mask) & !mask
}

unsafe fn map_anonymous(size: usize, huge: bool) -> *mut u8 {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    #[cfg(target_os = "linux")]
    if huge {
        flags |= libc::MAP_HUGETLB;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = huge;
    let ptr = libc::mmap(
        null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        flags,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        null_mut()
    } else {
        ptr as *mut u8
    }
}

/// Request a page-aligned anonymous mapping of at least `size` bytes whose
/// base address is aligned to `alignment`.
///
/// Alignments up to the page size come for free. Above the page size a
/// huge-page mapping is attempted first (huge pages are aligned to at least
/// 2 MiB, which covers every alignment this crate accepts); if the kernel
/// has no huge pages configured, the request falls back to over-mapping on
/// normal pages and trimming the misaligned head and tail.
pub fn os_allocate(size: usize, alignment: usize) -> Result<NonNull<u8>, MmapError> {
    debug_assert!(alignment.is_power_of_two() && alignment <= MAX_OS_ALIGNMENT);

    let page = page_size();
    let to_map = align_up(size.max(1), page);

    if alignment <= page {
        let ptr = unsafe { map_anonymous(to_map, false) };
        return NonNull::new(ptr).ok_or_else(|| MmapError {
            errno: errno(),
            requested: to_map,
        });
    }

    // Huge pages only when the mapping is a whole number of them, so the
    // matching munmap stays legal.
    const HUGE_PAGE_SIZE: usize = 2 << 20;
    if to_map % HUGE_PAGE_SIZE == 0 {
        if let Some(ptr) = NonNull::new(unsafe { map_anonymous(to_map, true) }) {
            return Ok(ptr);
        }
    }

    let padded = to_map.checked_add(alignment).ok_or(MmapError {
        errno: Errno(libc::EINVAL),
        requested: size,
    })?;
    let raw = unsafe { map_anonymous(padded, false) };
    let raw = NonNull::new(raw).ok_or_else(|| MmapError {
        errno: errno(),
        requested: padded,
    })?;

    let base = raw.as_ptr() as usize;
    let aligned = align_up(base, alignment);
    let head = aligned - base;
    let tail = padded - head - to_map;
    unsafe {
        if head > 0 {
            libc::munmap(base as *mut libc::c_void, head);
        }
        if tail > 0 {
            libc::munmap((aligned + to_map) as *mut libc::c_void, tail);
        }
        Ok(NonNull::new_unchecked(aligned as *mut u8))
    }
}

/// Return a mapping obtained from [`os_allocate`] to the kernel. `size` must
/// be the size originally requested.
pub fn os_deallocate(ptr: NonNull<u8>, size: usize) -> bool {
    let to_unmap = align_up(size.max(1), page_size());
    let rc = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, to_unmap) };
    if rc != 0 {
        warn!(
            "munmap of {} bytes at {:p} failed: {}",
            to_unmap,
            ptr.as_ptr(),
            errno()
        );
        return false;
    }
    true
}

/// An outstanding-bytes / net-operations counter pair.
///
/// `used_bytes` is the sum of header-plus-payload sizes of every allocation
/// not yet freed; `net_ops` is allocations minus deallocations. Both must
/// return to their starting value once every pointer has been freed exactly
/// once.
#[derive(Debug)]
pub struct Counters {
    used: AtomicU64,
    ops: AtomicI64,
}

impl Counters {
    pub const fn new() -> Self {
        Counters {
            used: AtomicU64::new(0),
            ops: AtomicI64::new(0),
        }
    }

    pub(crate) fn charge(&self, bytes: usize) {
        self.used.fetch_add(bytes as u64, Ordering::SeqCst);
        self.ops.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn discharge(&self, bytes: usize) {
        self.used.fetch_sub(bytes as u64, Ordering::SeqCst);
        self.ops.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::SeqCst) as usize
    }

    pub fn net_ops(&self) -> i64 {
        self.ops.load(Ordering::SeqCst)
    }
}

impl Default for Counters {
    fn default() -> Self {
        Counters::new()
    }
}

static PROCESS_COUNTERS: Counters = Counters::new();

/// The process-wide counter pair maintained alongside each pool's own.
pub fn process_counters() -> &'static Counters {
    &PROCESS_COUNTERS
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_roundtrip() {
        let ptr = os_allocate(10_000, 8).expect("mapping should succeed");
        unsafe {
            ptr.as_ptr().write(0xAB);
            ptr.as_ptr().add(9_999).write(0xCD);
            assert_eq!(*ptr.as_ptr(), 0xAB);
        }
        assert!(os_deallocate(ptr, 10_000));
    }

    #[test]
    fn test_page_alignment() {
        let page = page_size();
        let ptr = os_allocate(1, 8).expect("mapping should succeed");
        assert_eq!(ptr.as_ptr() as usize % page, 0);
        assert!(os_deallocate(ptr, 1));
    }

    #[test]
    fn test_oversized_alignment() {
        let ptr = os_allocate(4096, MAX_OS_ALIGNMENT).expect("mapping should succeed");
        assert_eq!(ptr.as_ptr() as usize % MAX_OS_ALIGNMENT, 0);
        unsafe { ptr.as_ptr().write_bytes(0x5A, 4096) };
        assert!(os_deallocate(ptr, 4096));
    }

    #[test]
    fn test_counters_balance() {
        let counters = Counters::new();
        counters.charge(128);
        counters.charge(64);
        assert_eq!(counters.used_bytes(), 192);
        assert_eq!(counters.net_ops(), 2);
        counters.discharge(64);
        counters.discharge(128);
        assert_eq!(counters.used_bytes(), 0);
        assert_eq!(counters.net_ops(), 0);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }
}

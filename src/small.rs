//! The small tier: requests up to 1 MiB, served from 64 fixed size classes.
//!
//! Every block is prefixed by a 64-byte [`SmallHeader`]. Freed blocks park
//! in the freeing thread's local cache first — no synchronisation at all —
//! and spill to the per-class global [`TaggedStack`] once the thread has
//! accumulated [`FLUSH_THRESHOLD`] deallocations. Allocation tries the
//! thread cache, then the global stack, and finally slices a fresh OS chunk
//! into blocks, publishing the tail of the chunk in a single exchange.
//!
//! Thread caches drain themselves when their thread exits: the cache is a
//! `thread_local!` value whose `Drop` pushes every parked block back to the
//! global stacks, so blocks cannot be stranded by short-lived threads.

use core::cell::RefCell;
use core::mem::size_of;
use core::ptr::{self, null_mut, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use log::{debug, error};
use spin::Mutex;
use static_assertions::const_assert;

use crate::error::AllocError;
use crate::os::{self, align_up};
use crate::size_class::{class_for, class_size, CLASS_COUNT};
use crate::tagged::{Link, TaggedStack};

pub(crate) const SMALL_MAGIC: u32 = 0x534D_4853; // "SMHS"
pub(crate) const SMALL_HEADER_SIZE: usize = size_of::<SmallHeader>();

/// Deallocations a thread accumulates before its cache spills to the
/// global stacks.
const FLUSH_THRESHOLD: usize = 256;
/// Fresh chunks are sliced into at least this many blocks.
const BLOCKS_PER_CHUNK: usize = 128;
const MIN_CHUNK_BYTES: usize = 1 << 20;

/// Prefix of every small block. The `next` link threads the block into a
/// thread cache or a global stack and is only valid while `is_free` holds.
#[repr(C, align(64))]
pub(crate) struct SmallHeader {
    magic: u32,
    class_index: u32,
    block_size: u32,
    is_free: AtomicBool,
    /// Set while the block is parked in a thread cache, so a second free
    /// from the same thread cannot thread the block into a cycle.
    in_tls: AtomicBool,
    _pad0: [u8; 2],
    next: AtomicPtr<SmallHeader>,
    _pad1: [u8; 40],
}

const_assert!(size_of::<SmallHeader>() == 64);

impl Link for SmallHeader {
    fn next_link(&self) -> &AtomicPtr<SmallHeader> {
        &self.next
    }
}

impl SmallHeader {
    pub(crate) fn footprint(&self) -> usize {
        SMALL_HEADER_SIZE + self.block_size as usize
    }
}

pub(crate) unsafe fn payload_of(header: *mut SmallHeader) -> *mut u8 {
    (header as *mut u8).add(SMALL_HEADER_SIZE)
}

/// Distance between consecutive blocks in a chunk. Rounded up so every
/// header keeps the 64-byte alignment the tagged stacks rely on.
fn block_stride(class: usize) -> usize {
    align_up(SMALL_HEADER_SIZE + class_size(class), 64)
}

/// State shared by every handle to a small tier: one global stack per size
/// class plus the registry of raw OS chunks backing them.
pub(crate) struct SmallShared {
    classes: [TaggedStack<SmallHeader>; CLASS_COUNT],
    chunks: Mutex<Vec<(usize, usize)>>,
    destructing: AtomicBool,
}

impl SmallShared {
    fn new() -> Self {
        const EMPTY: TaggedStack<SmallHeader> = TaggedStack::new();
        SmallShared {
            classes: [EMPTY; CLASS_COUNT],
            chunks: Mutex::new(Vec::new()),
            destructing: AtomicBool::new(false),
        }
    }
}

/// Per-thread free-block cache: one singly-linked list per size class.
struct ThreadCache {
    shared: Arc<SmallShared>,
    heads: [*mut SmallHeader; CLASS_COUNT],
    pending_frees: usize,
}

impl ThreadCache {
    fn new(shared: Arc<SmallShared>) -> Self {
        ThreadCache {
            shared,
            heads: [null_mut(); CLASS_COUNT],
            pending_frees: 0,
        }
    }

    fn pop(&mut self, class: usize) -> *mut SmallHeader {
        let head = self.heads[class];
        if head.is_null() {
            return null_mut();
        }
        unsafe {
            self.heads[class] = (*head).next.load(Ordering::Relaxed);
            (*head).in_tls.store(false, Ordering::Relaxed);
        }
        head
    }

    fn push(&mut self, class: usize, header: *mut SmallHeader) {
        unsafe {
            (*header).next.store(self.heads[class], Ordering::Relaxed);
        }
        self.heads[class] = header;
        self.pending_frees += 1;
    }

    /// Move every parked block onto the global stacks.
    fn flush(&mut self) {
        if self.shared.destructing.load(Ordering::Acquire) {
            // The chunks these blocks live in are being unmapped; forget
            // them rather than publish dangling pointers.
            self.heads = [null_mut(); CLASS_COUNT];
            self.pending_frees = 0;
            return;
        }
        for class in 0..CLASS_COUNT {
            let head = self.heads[class];
            if head.is_null() {
                continue;
            }
            unsafe {
                // Clear the in-TLS mark along the chain before it becomes
                // visible to other threads, and locate the tail.
                let mut tail = head;
                loop {
                    (*tail).in_tls.store(false, Ordering::Relaxed);
                    let next = (*tail).next.load(Ordering::Relaxed);
                    if next.is_null() {
                        break;
                    }
                    tail = next;
                }
                self.shared.classes[class].push_chain(head, tail);
            }
            self.heads[class] = null_mut();
        }
        self.pending_frees = 0;
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        self.flush();
    }
}

thread_local! {
    static THREAD_CACHE: RefCell<Option<ThreadCache>> = RefCell::new(None);
}

/// Run `f` against this thread's cache for `shared`, binding or rebinding
/// the thread-local slot as needed. Returns `None` when thread-local storage
/// is already being torn down.
fn with_cache<R>(shared: &Arc<SmallShared>, f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
    THREAD_CACHE
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.as_mut() {
                Some(cache) if Arc::ptr_eq(&cache.shared, shared) => f(cache),
                _ => {
                    // A different pool owned this slot; its Drop flushes the
                    // old contents back where they belong.
                    slot.take();
                    let mut cache = ThreadCache::new(Arc::clone(shared));
                    let result = f(&mut cache);
                    *slot = Some(cache);
                    result
                }
            }
        })
        .ok()
}

pub(crate) struct SmallTier {
    shared: Arc<SmallShared>,
}

impl SmallTier {
    pub(crate) fn new() -> Self {
        SmallTier {
            shared: Arc::new(SmallShared::new()),
        }
    }

    /// Allocate a block whose payload holds `bytes`. Returns the payload
    /// pointer and the bytes charged against the pool counters.
    pub(crate) fn allocate(&self, bytes: usize) -> Result<(NonNull<u8>, usize), AllocError> {
        let class = class_for(bytes).ok_or(AllocError::SizeOverflow)?;

        // 1) Thread cache: no synchronisation.
        let cached = with_cache(&self.shared, |cache| cache.pop(class)).unwrap_or(null_mut());
        if !cached.is_null() {
            return Ok(unsafe { self.finish(cached) });
        }

        // 2) Global stack.
        let popped = unsafe { self.shared.classes[class].pop() };
        if !popped.is_null() {
            return Ok(unsafe { self.finish(popped) });
        }

        // 3) Slice a fresh chunk.
        self.grow(class)
    }

    unsafe fn finish(&self, header: *mut SmallHeader) -> (NonNull<u8>, usize) {
        (*header).is_free.store(false, Ordering::Relaxed);
        (*header).in_tls.store(false, Ordering::Relaxed);
        (*header).magic = SMALL_MAGIC;
        let charged = (*header).footprint();
        (NonNull::new_unchecked(payload_of(header)), charged)
    }

    fn grow(&self, class: usize) -> Result<(NonNull<u8>, usize), AllocError> {
        let stride = block_stride(class);
        let chunk_bytes = MIN_CHUNK_BYTES.max(stride * BLOCKS_PER_CHUNK);

        let chunk = {
            let mut chunks = self.shared.chunks.lock();
            let ptr = os::os_allocate(chunk_bytes, 64).map_err(|err| AllocError::OutOfMemory {
                requested: err.requested,
            })?;
            chunks.push((ptr.as_ptr() as usize, chunk_bytes));
            ptr
        };
        debug!(
            "small tier: new {} byte chunk for class {} ({} byte blocks)",
            chunk_bytes,
            class,
            class_size(class)
        );

        let count = chunk_bytes / stride;
        let base = chunk.as_ptr();
        let first = base as *mut SmallHeader;
        let mut previous: *mut SmallHeader = null_mut();
        unsafe {
            for index in 0..count {
                let header = base.add(index * stride) as *mut SmallHeader;
                ptr::write(
                    header,
                    SmallHeader {
                        magic: SMALL_MAGIC,
                        class_index: class as u32,
                        block_size: class_size(class) as u32,
                        is_free: AtomicBool::new(true),
                        in_tls: AtomicBool::new(false),
                        _pad0: [0; 2],
                        next: AtomicPtr::new(null_mut()),
                        _pad1: [0; 40],
                    },
                );
                if !previous.is_null() {
                    (*previous).next.store(header, Ordering::Relaxed);
                }
                previous = header;
            }

            // Publish everything but the first block as one pre-linked
            // segment; the first goes straight to the caller.
            if count > 1 {
                let second = base.add(stride) as *mut SmallHeader;
                self.shared.classes[class].push_chain(second, previous);
            }

            Ok(self.finish(first))
        }
    }

    /// Return a block to the tier. `false` means the free was rejected
    /// (double free or corrupted header) and nothing was charged back.
    pub(crate) fn deallocate(&self, header: *mut SmallHeader) -> bool {
        unsafe {
            if (*header)
                .is_free
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                // Double free.
                return false;
            }
            if (*header).magic != SMALL_MAGIC {
                error!(
                    "small tier: invalid magic on deallocation of {:p}; leaking block",
                    header
                );
                return false;
            }
            if (*header).in_tls.load(Ordering::Relaxed) {
                // Same-thread double free that somehow beat the is_free
                // exchange; the block is already parked.
                return false;
            }

            (*header).magic = 0;
            (*header).in_tls.store(true, Ordering::Relaxed);
            let class = (*header).class_index as usize;

            let parked = with_cache(&self.shared, |cache| {
                cache.push(class, header);
                if cache.pending_frees >= FLUSH_THRESHOLD {
                    cache.flush();
                }
            })
            .is_some();

            if !parked {
                // Thread-local storage is gone (thread exit); bypass the
                // cache and publish directly.
                (*header).in_tls.store(false, Ordering::Relaxed);
                if !self.shared.destructing.load(Ordering::Acquire) {
                    self.shared.classes[class].push(header);
                }
            }
        }
        true
    }

    /// Spill the calling thread's cache onto the global stacks.
    pub(crate) fn flush_thread_cache(&self) {
        with_cache(&self.shared, |cache| cache.flush());
    }

    /// Tear the tier down: flush the current thread, clear every global
    /// stack, and return all chunks to the OS.
    pub(crate) fn release_all(&self) {
        self.shared.destructing.store(true, Ordering::Release);
        self.flush_thread_cache();

        for stack in &self.shared.classes {
            stack.take_all();
        }

        let mut chunks = self.shared.chunks.lock();
        for &(base, bytes) in chunks.iter() {
            if let Some(ptr) = NonNull::new(base as *mut u8) {
                os::os_deallocate(ptr, bytes);
            }
        }
        chunks.clear();
    }

    #[cfg(test)]
    fn chunk_count(&self) -> usize {
        self.shared.chunks.lock().len()
    }
}

//! The medium tier: a buddy system of ten power-of-two orders, 1 MiB to
//! 512 MiB, with lock-free per-order free lists and an asynchronous
//! coalescer.
//!
//! Allocation scans the target order upwards, splitting a larger block down
//! when one is found. Deallocation never merges synchronously: validated
//! blocks are queued on a fixed-size ring buffer consumed by a single
//! detached worker thread, spawned on demand behind a self-latching
//! activity flag. When the ring is full the freeing thread merges inline.
//!
//! The buddy of a block at offset `o` within its chunk sits at
//! `o ^ (1 MiB << order)`. Merging removes the buddy from its free list only
//! when it is the current head of that list; anything deeper is left alone,
//! which can forgo a merge but can never merge a block that is in use.

use core::mem::size_of;
use core::ptr::{self, null_mut, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use spin::Mutex;
use static_assertions::const_assert;

use crate::error::AllocError;
use crate::os;
use crate::tagged::{Link, TaggedStack};

pub(crate) const MEDIUM_MAGIC: u32 = 0x4D4D_4853; // "MMHS"
pub(crate) const MEDIUM_HEADER_SIZE: usize = size_of::<MediumHeader>();

/// Smallest buddy block: 1 MiB.
pub(crate) const MIN_BLOCK_BYTES: usize = 1 << 20;
/// Orders 0..=9 cover 1 MiB through 512 MiB.
pub(crate) const ORDER_COUNT: usize = 10;

const MERGE_QUEUE_SLOTS: usize = 128;

/// Prefix of every medium block. `block_size` is the full buddy footprint
/// (header included), so it is always `1 MiB << order` and doubles on merge.
#[repr(C, align(64))]
pub(crate) struct MediumHeader {
    magic: u32,
    _reserved: u32,
    block_size: AtomicUsize,
    is_free: AtomicBool,
    _pad0: [u8; 7],
    next: AtomicPtr<MediumHeader>,
    _pad1: [u8; 32],
}

const_assert!(size_of::<MediumHeader>() == 64);

impl Link for MediumHeader {
    fn next_link(&self) -> &AtomicPtr<MediumHeader> {
        &self.next
    }
}

impl MediumHeader {
    pub(crate) fn footprint(&self) -> usize {
        self.block_size.load(Ordering::Relaxed)
    }
}

pub(crate) unsafe fn payload_of(header: *mut MediumHeader) -> *mut u8 {
    (header as *mut u8).add(MEDIUM_HEADER_SIZE)
}

pub(crate) fn order_size(order: usize) -> usize {
    MIN_BLOCK_BYTES << order
}

/// Smallest order whose payload capacity holds `bytes`, or `None` when even
/// order 9 cannot.
pub(crate) fn order_for(bytes: usize) -> Option<usize> {
    let total = bytes.checked_add(MEDIUM_HEADER_SIZE)?;
    let mut order = 0;
    let mut capacity = MIN_BLOCK_BYTES;
    while capacity < total {
        if order == ORDER_COUNT - 1 {
            return None;
        }
        capacity <<= 1;
        order += 1;
    }
    Some(order)
}

fn order_of_footprint(footprint: usize) -> usize {
    debug_assert!(footprint.is_power_of_two() && footprint >= MIN_BLOCK_BYTES);
    (footprint / MIN_BLOCK_BYTES).trailing_zeros() as usize
}

/// Fixed-size multi-producer, single-consumer ring of merge requests.
///
/// Each slot packs `{header pointer, order}` into one word (headers are
/// 64-byte aligned, orders fit in the low bits; zero means "empty").
/// Producers reserve a slot by advancing `tail` with a compare-exchange and
/// then publish into it; the lone consumer advances `head` with plain
/// stores, spinning past a slot whose producer has reserved but not yet
/// published.
struct MergeQueue {
    slots: [AtomicU64; MERGE_QUEUE_SLOTS],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl MergeQueue {
    fn new() -> Self {
        const EMPTY: AtomicU64 = AtomicU64::new(0);
        MergeQueue {
            slots: [EMPTY; MERGE_QUEUE_SLOTS],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Returns false when the ring is full.
    fn enqueue(&self, header: *mut MediumHeader, order: usize) -> bool {
        debug_assert_eq!(header as usize % 64, 0);
        let request = header as u64 | order as u64;
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let next = (tail + 1) % MERGE_QUEUE_SLOTS;
            if next == self.head.load(Ordering::Acquire) {
                return false;
            }
            match self.tail.compare_exchange_weak(
                tail,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.slots[tail].store(request, Ordering::Release);
                    return true;
                }
                Err(actual) => tail = actual,
            }
        }
    }

    /// Single-consumer dequeue.
    fn dequeue(&self) -> Option<(*mut MediumHeader, usize)> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        let mut request = self.slots[head].swap(0, Ordering::Acquire);
        while request == 0 {
            // The producer has reserved this slot but not published yet.
            core::hint::spin_loop();
            request = self.slots[head].swap(0, Ordering::Acquire);
        }
        self.head
            .store((head + 1) % MERGE_QUEUE_SLOTS, Ordering::Release);
        let header = (request & !63) as *mut MediumHeader;
        let order = (request & 63) as usize;
        Some((header, order))
    }
}

pub(crate) struct MediumShared {
    orders: [TaggedStack<MediumHeader>; ORDER_COUNT],
    /// Advisory bitmask of orders that have recently been non-empty; one bit
    /// per order. Set after a push, cleared when a pop drains the list.
    level_mask: AtomicU16,
    queue: MergeQueue,
    coalescer_active: AtomicBool,
    chunks: Mutex<Vec<(usize, usize)>>,
    destructing: AtomicBool,
}

impl MediumShared {
    fn new() -> Self {
        const EMPTY: TaggedStack<MediumHeader> = TaggedStack::new();
        MediumShared {
            orders: [EMPTY; ORDER_COUNT],
            level_mask: AtomicU16::new(0),
            queue: MergeQueue::new(),
            coalescer_active: AtomicBool::new(false),
            chunks: Mutex::new(Vec::new()),
            destructing: AtomicBool::new(false),
        }
    }

    fn pop(&self, order: usize) -> *mut MediumHeader {
        let stack = &self.orders[order];
        let block = unsafe { stack.pop() };
        if !block.is_null() && stack.is_empty() {
            self.level_mask
                .fetch_and(!(1u16 << order), Ordering::AcqRel);
        }
        block
    }

    /// # Safety
    ///
    /// `block` must point to a block of footprint `order_size(order)` that
    /// no other thread currently owns.
    unsafe fn push_block(&self, block: *mut MediumHeader, order: usize) {
        (*block).magic = MEDIUM_MAGIC;
        (*block)
            .block_size
            .store(order_size(order), Ordering::Relaxed);
        (*block).is_free.store(true, Ordering::Release);
        self.orders[order].push(block);
        self.level_mask.fetch_or(1u16 << order, Ordering::AcqRel);
    }

    /// Halve `block` repeatedly from `from` down to `to`, pushing each right
    /// half at its order. Returns the left half at order `to`.
    unsafe fn split(
        &self,
        block: *mut MediumHeader,
        from: usize,
        to: usize,
    ) -> *mut MediumHeader {
        for order in (to..from).rev() {
            let half = order_size(order);
            let right = (block as *mut u8).add(half) as *mut MediumHeader;
            ptr::write(
                right,
                MediumHeader {
                    magic: MEDIUM_MAGIC,
                    _reserved: 0,
                    block_size: AtomicUsize::new(half),
                    is_free: AtomicBool::new(false),
                    _pad0: [0; 7],
                    next: AtomicPtr::new(null_mut()),
                    _pad1: [0; 32],
                },
            );
            self.push_block(right, order);
            (*block).block_size.store(half, Ordering::Relaxed);
        }
        block
    }

    /// Attempt the buddy merge chain for a freed block, then put the result
    /// (merged or not) back on a free list.
    unsafe fn try_merge(&self, mut block: *mut MediumHeader, mut order: usize) {
        // Identify the owning chunk; chunks are few, a linear scan is fine.
        let (chunk_base, chunk_bytes) = {
            let chunks = self.chunks.lock();
            let addr = block as usize;
            match chunks
                .iter()
                .find(|&&(base, bytes)| addr >= base && addr < base + bytes)
            {
                Some(&found) => found,
                None => {
                    warn!(
                        "medium tier: merge request for {:p} outside any chunk",
                        block
                    );
                    return;
                }
            }
        };

        while order < ORDER_COUNT - 1 {
            let size = order_size(order);
            let offset = block as usize - chunk_base;
            let buddy_offset = offset ^ size;
            if buddy_offset + size > chunk_bytes {
                break;
            }
            let buddy = (chunk_base + buddy_offset) as *mut MediumHeader;

            if !(*buddy).is_free.load(Ordering::Acquire)
                || (*buddy).block_size.load(Ordering::Relaxed) != size
            {
                break;
            }
            // Remove the buddy only when it heads its free list. Giving up
            // here costs a merge opportunity, never correctness.
            if !self.orders[order].steal_head(buddy) {
                break;
            }
            // The buddy is ours now; re-check that it did not change hands
            // between the freeness probe and the removal.
            if !(*buddy).is_free.load(Ordering::Acquire)
                || (*buddy).block_size.load(Ordering::Relaxed) != size
            {
                self.push_block(buddy, order);
                break;
            }

            block = (block as usize).min(buddy as usize) as *mut MediumHeader;
            order += 1;
            (*block)
                .block_size
                .store(order_size(order), Ordering::Relaxed);
            debug!("medium tier: merged buddies up to order {}", order);
        }

        self.push_block(block, order);
    }
}

/// Body of the detached coalescer thread.
fn coalescer_main(shared: Arc<MediumShared>) {
    loop {
        if shared.destructing.load(Ordering::Acquire) {
            // Teardown owns every block from here on; just drain.
            while shared.queue.dequeue().is_some() {}
            shared.coalescer_active.store(false, Ordering::Release);
            return;
        }
        match shared.queue.dequeue() {
            Some((block, order)) => unsafe { shared.try_merge(block, order) },
            None => {
                shared.coalescer_active.store(false, Ordering::Release);
                if shared.queue.is_empty() {
                    return;
                }
                // Requests raced the latch release. Take the latch back and
                // keep going, unless a fresh worker already did.
                if shared.coalescer_active.swap(true, Ordering::AcqRel) {
                    return;
                }
            }
        }
    }
}

pub(crate) struct MediumTier {
    shared: Arc<MediumShared>,
}

impl MediumTier {
    pub(crate) fn new() -> Self {
        MediumTier {
            shared: Arc::new(MediumShared::new()),
        }
    }

    /// Allocate a block whose payload holds `bytes`. Returns the payload
    /// pointer and the bytes charged against the pool counters.
    pub(crate) fn allocate(&self, bytes: usize) -> Result<(NonNull<u8>, usize), AllocError> {
        let target = order_for(bytes).ok_or(AllocError::SizeOverflow)?;

        loop {
            for order in target..ORDER_COUNT {
                let block = self.shared.pop(order);
                if block.is_null() {
                    continue;
                }
                let block = if order > target {
                    unsafe { self.shared.split(block, order, target) }
                } else {
                    block
                };
                return Ok(unsafe { self.finish(block, target) });
            }

            let fresh = self.new_chunk(target)?;
            // If blocks reappeared at a usable order while we were mapping,
            // queue the fresh one and rescan; first-come requests should not
            // be starved by the thread that happened to grow the tier.
            let mask = self.shared.level_mask.load(Ordering::Acquire);
            if mask & (u16::MAX << target) != 0 {
                unsafe { self.shared.push_block(fresh, target) };
                continue;
            }
            return Ok(unsafe { self.finish(fresh, target) });
        }
    }

    unsafe fn finish(&self, block: *mut MediumHeader, order: usize) -> (NonNull<u8>, usize) {
        (*block).magic = MEDIUM_MAGIC;
        (*block).is_free.store(false, Ordering::Relaxed);
        (*block)
            .block_size
            .store(order_size(order), Ordering::Relaxed);
        (*block).next.store(null_mut(), Ordering::Relaxed);
        (NonNull::new_unchecked(payload_of(block)), order_size(order))
    }

    fn new_chunk(&self, order: usize) -> Result<*mut MediumHeader, AllocError> {
        let bytes = order_size(order);
        let chunk = {
            let mut chunks = self.shared.chunks.lock();
            let ptr = os::os_allocate(bytes, 64).map_err(|err| AllocError::OutOfMemory {
                requested: err.requested,
            })?;
            chunks.push((ptr.as_ptr() as usize, bytes));
            ptr
        };
        debug!("medium tier: new {} byte chunk at order {}", bytes, order);

        let header = chunk.as_ptr() as *mut MediumHeader;
        unsafe {
            ptr::write(
                header,
                MediumHeader {
                    magic: MEDIUM_MAGIC,
                    _reserved: 0,
                    block_size: AtomicUsize::new(bytes),
                    is_free: AtomicBool::new(false),
                    _pad0: [0; 7],
                    next: AtomicPtr::new(null_mut()),
                    _pad1: [0; 32],
                },
            );
        }
        Ok(header)
    }

    /// Return a block to the tier. The merge itself happens asynchronously;
    /// `false` means the free was rejected (double free or corrupted
    /// header).
    pub(crate) fn deallocate(&self, header: *mut MediumHeader) -> bool {
        unsafe {
            if (*header)
                .is_free
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                return false;
            }
            if (*header).magic != MEDIUM_MAGIC {
                error!(
                    "medium tier: invalid magic on deallocation of {:p}; leaking block",
                    header
                );
                return false;
            }

            let order = order_of_footprint((*header).block_size.load(Ordering::Relaxed));

            if self.shared.destructing.load(Ordering::Acquire) {
                // Teardown is draining the lists; the chunk sweep reclaims
                // this block.
                return true;
            }

            if !self.shared.queue.enqueue(header, order) {
                // Ring full: the worker is behind, merge on this thread.
                self.shared.try_merge(header, order);
                return true;
            }
        }
        self.ensure_coalescer();
        true
    }

    fn ensure_coalescer(&self) {
        let shared = &self.shared;
        if shared.coalescer_active.load(Ordering::Acquire) {
            return;
        }
        if shared.coalescer_active.swap(true, Ordering::AcqRel) {
            return;
        }
        let worker_shared = Arc::clone(shared);
        let spawned = std::thread::Builder::new()
            .name("tiered-alloc-coalescer".into())
            .spawn(move || coalescer_main(worker_shared));
        if spawned.is_err() {
            // No worker; requests stay queued until the next deallocation
            // retries the spawn, and inline merging covers a full ring.
            warn!("medium tier: failed to spawn coalescer thread");
            shared.coalescer_active.store(false, Ordering::Release);
        }
    }

    /// Tear the tier down: quiesce the coalescer, clear every free list, and
    /// return all chunks to the OS.
    pub(crate) fn release_all(&self) {
        self.shared.destructing.store(true, Ordering::Release);
        while self.shared.coalescer_active.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        while self.shared.queue.dequeue().is_some() {}

        for stack in &self.shared.orders {
            stack.take_all();
        }
        self.shared.level_mask.store(0, Ordering::Release);

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

    #[cfg(test)]
    fn order_list_nonempty(&self, order: usize) -> bool {
        !self.shared.orders[order].is_empty()
    }
}

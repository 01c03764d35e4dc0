//! The direct tiers: one OS mapping per allocation.
//!
//! Large (512 MiB to 1 GiB) and Huge (above 1 GiB) requests share this
//! implementation; the two tiers differ only in their magic word and label,
//! which keeps the dispatch sentinel and diagnostics able to tell the bands
//! apart. Every allocation is a single contiguous mapping prefixed by a
//! [`DirectHeader`]; a mutex-protected list of active blocks exists solely
//! so teardown can sweep whatever was never freed.

use core::mem::size_of;
use core::ptr::{self, NonNull};

use log::error;
use spin::Mutex;
use static_assertions::const_assert;

use crate::error::AllocError;
use crate::os;

pub(crate) const LARGE_MAGIC: u32 = 0x4C4D_4853; // "LMHS"
pub(crate) const HUGE_MAGIC: u32 = 0x484D_4853; // "HMHS"
pub(crate) const DIRECT_HEADER_SIZE: usize = size_of::<DirectHeader>();

/// Prefix of every direct block. No `next` link: these blocks are never on
/// a free list.
#[repr(C, align(64))]
pub(crate) struct DirectHeader {
    magic: u32,
    _reserved: u32,
    block_size: usize,
    _pad: [u8; 48],
}

const_assert!(size_of::<DirectHeader>() == 64);

impl DirectHeader {
    pub(crate) fn footprint(&self) -> usize {
        DIRECT_HEADER_SIZE + self.block_size
    }
}

pub(crate) unsafe fn payload_of(header: *mut DirectHeader) -> *mut u8 {
    (header as *mut u8).add(DIRECT_HEADER_SIZE)
}

pub(crate) struct DirectTier {
    label: &'static str,
    magic: u32,
    active: Mutex<Vec<(usize, usize)>>,
}

impl DirectTier {
    pub(crate) fn large() -> Self {
        DirectTier::new("large", LARGE_MAGIC)
    }

    pub(crate) fn huge() -> Self {
        DirectTier::new("huge", HUGE_MAGIC)
    }

    fn new(label: &'static str, magic: u32) -> Self {
        DirectTier {
            label,
            magic,
            active: Mutex::new(Vec::new()),
        }
    }

    /// Map a fresh block whose payload holds `bytes`. Returns the payload
    /// pointer and the bytes charged against the pool counters.
    pub(crate) fn allocate(&self, bytes: usize) -> Result<(NonNull<u8>, usize), AllocError> {
        let total = bytes
            .checked_add(DIRECT_HEADER_SIZE)
            .ok_or(AllocError::SizeOverflow)?;
        let mapping = os::os_allocate(total, 64).map_err(|err| AllocError::OutOfMemory {
            requested: err.requested,
        })?;

        let header = mapping.as_ptr() as *mut DirectHeader;
        unsafe {
            ptr::write(
                header,
                DirectHeader {
                    magic: self.magic,
                    _reserved: 0,
                    block_size: bytes,
                    _pad: [0; 48],
                },
            );
            self.active.lock().push((header as usize, total));
            Ok((NonNull::new_unchecked(payload_of(header)), total))
        }
    }

    /// Unmap a block. `false` means the header did not carry this tier's
    /// magic and the free was skipped.
    pub(crate) fn deallocate(&self, header: *mut DirectHeader) -> bool {
        unsafe {
            if (*header).magic != self.magic {
                error!(
                    "{} tier: invalid magic on deallocation of {:p}; leaking block",
                    self.label, header
                );
                return false;
            }
            (*header).magic = 0;

            let recorded = {
                let mut active = self.active.lock();
                match active.iter().position(|&(addr, _)| addr == header as usize) {
                    Some(index) => Some(active.swap_remove(index).1),
                    None => None,
                }
            };

            let total = recorded.unwrap_or(DIRECT_HEADER_SIZE + (*header).block_size);
            os::os_deallocate(NonNull::new_unchecked(header as *mut u8), total);
        }
        true
    }

    /// Unmap every block still on the active list.
    pub(crate) fn release_all(&self) {
        let mut active = self.active.lock();
        for &(addr, total) in active.iter() {
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                os::os_deallocate(ptr, total);
            }
        }
        active.clear();
    }

    #[cfg(test)]
    fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn header_of(payload: NonNull<u8>) -> *mut DirectHeader {
        unsafe { payload.as_ptr().sub(DIRECT_HEADER_SIZE) as *mut DirectHeader }
    }

    #[test]
    fn test_roundtrip() {
        let tier = DirectTier::large();
        let (payload, charged) = tier.allocate(4 * 1024 * 1024).unwrap();
        assert_eq!(charged, DIRECT_HEADER_SIZE + 4 * 1024 * 1024);
        assert_eq!(tier.active_count(), 1);
        unsafe {
            payload.as_ptr().write(b'A');
            payload.as_ptr().add(4 * 1024 * 1024 - 1).write(b'Z');
        }
        assert!(tier.deallocate(header_of(payload)));
        assert_eq!(tier.active_count(), 0);
    }

    #[test]
    fn test_magic_mismatch_is_skipped() {
        let tier = DirectTier::large();
        let other = DirectTier::huge();
        let (payload, _) = tier.allocate(1024).unwrap();
        let header = header_of(payload);
        // The huge tier refuses a block carrying the large magic.
        assert!(!other.deallocate(header));
        assert!(tier.deallocate(header));
    }

    #[test]
    fn test_release_sweeps_leftovers() {
        let tier = DirectTier::huge();
        let _ = tier.allocate(1024).unwrap();
        let _ = tier.allocate(2048).unwrap();
        assert_eq!(tier.active_count(), 2);
        tier.release_all();
        assert_eq!(tier.active_count(), 0);
    }
}

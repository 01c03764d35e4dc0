//! The leak tracker: a pointer → allocation-record map the pool reports
//! into when tracking is enabled.
//!
//! The tracker is deliberately orthogonal to the tiers: it never owns
//! memory, it only remembers what the dispatcher told it. One process-wide
//! instance exists so reports survive the pool that produced them.

use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::OnceLock;

use spin::Mutex;

/// Where an allocation came from, captured by the [`alloc_here!`] macros or
/// passed explicitly.
///
/// [`alloc_here!`]: crate::alloc_here
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocSite {
    pub file: &'static str,
    pub line: u32,
}

impl AllocSite {
    pub const UNKNOWN: AllocSite = AllocSite {
        file: "<unknown>",
        line: 0,
    };
}

#[derive(Debug, Clone, Copy)]
struct Record {
    size: usize,
    site: AllocSite,
    raw: usize,
}

pub struct Tracker {
    enabled: AtomicBool,
    detailed: AtomicBool,
    map: Mutex<HashMap<usize, Record>>,
}

impl Tracker {
    fn new() -> Self {
        Tracker {
            enabled: AtomicBool::new(false),
            detailed: AtomicBool::new(false),
            map: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide tracker instance.
    pub fn global() -> &'static Tracker {
        static TRACKER: OnceLock<Tracker> = OnceLock::new();
        TRACKER.get_or_init(Tracker::new)
    }

    pub fn enable(&self, detailed: bool) {
        self.detailed.store(detailed, Ordering::Relaxed);
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Stop admitting new allocations into the map. Deallocations of
    /// already-tracked pointers keep being honoured so the map drains
    /// rather than fossilises.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn track_allocation(
        &self,
        user_pointer: *mut u8,
        size: usize,
        site: AllocSite,
        raw_pointer: *mut u8,
    ) {
        if !self.is_enabled() || user_pointer.is_null() {
            return;
        }
        let raw = if raw_pointer.is_null() {
            user_pointer as usize
        } else {
            raw_pointer as usize
        };
        self.map
            .lock()
            .insert(user_pointer as usize, Record { size, site, raw });
    }

    pub fn track_deallocation(&self, user_pointer: *mut u8) {
        if user_pointer.is_null() {
            return;
        }
        self.map.lock().remove(&(user_pointer as usize));
    }

    /// The raw block backing `user_pointer`, if it is being tracked.
    pub fn find_raw(&self, user_pointer: *mut u8) -> Option<*mut u8> {
        self.map
            .lock()
            .get(&(user_pointer as usize))
            .map(|record| record.raw as *mut u8)
    }

    /// Sum of tracked allocation sizes.
    pub fn current_bytes(&self) -> usize {
        self.map.lock().values().map(|record| record.size).sum()
    }

    pub fn tracked_count(&self) -> usize {
        self.map.lock().len()
    }

    /// Write a leak report for every allocation still in the map.
    pub fn report_leaks<W: Write>(&self, mut output: W) -> io::Result<()> {
        let leaks: Vec<(usize, Record)> = {
            let map = self.map.lock();
            let mut leaks: Vec<_> = map.iter().map(|(&ptr, &record)| (ptr, record)).collect();
            leaks.sort_by_key(|&(ptr, _)| ptr);
            leaks
        };

        if leaks.is_empty() {
            return writeln!(output, "No memory leaks detected.");
        }

        let detailed = self.detailed.load(Ordering::Relaxed);
        writeln!(output, "=== Memory Leak Report ===")?;
        writeln!(output, "Total leaks: {}", leaks.len())?;
        for (pointer, record) in leaks {
            write!(
                output,
                "Leaked {} bytes at {:#x}",
                record.size, pointer
            )?;
            if detailed && record.site != AllocSite::UNKNOWN {
                write!(
                    output,
                    " (allocated at {}:{})",
                    record.site.file, record.site.line
                )?;
            }
            writeln!(output)?;
        }
        writeln!(output, "=== End of Report ===")
    }
}

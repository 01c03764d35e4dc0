use std::sync::Arc;
use std::time::Duration;

use tiered_alloc::{Pool, DEFAULT_ALIGNMENT};

use rand::distributions::{Distribution, Uniform};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use test_log::test;

fn seeded_rng() -> rand::rngs::StdRng {
    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    rand::rngs::StdRng::seed_from_u64(seed)
}

/// Churn the pool with mixed sizes and alignments, free half at random to
/// punch holes, refill, then free everything. The books must balance.
#[test]
fn test_fragmentation_churn() {
    let pool = Pool::new();
    let mut rng = seeded_rng();

    let small_sizes = Uniform::new_inclusive(16usize, 256);
    let medium_sizes = Uniform::new_inclusive(257usize, 4096);
    let large_sizes = Uniform::new_inclusive(4097usize, 16384);
    let alignments = [8usize, 16, 32, 64, 128, 256];

    let mut live: Vec<*mut u8> = Vec::with_capacity(2_000);
    for index in 0..1_200 {
        let size = match index % 3 {
            0 => small_sizes.sample(&mut rng),
            1 => medium_sizes.sample(&mut rng),
            _ => large_sizes.sample(&mut rng),
        };
        let alignment = *alignments.choose(&mut rng).unwrap();
        let pointer = pool
            .try_allocate(size, alignment)
            .expect("churn allocation failed");
        assert_eq!(pointer.as_ptr() as usize % alignment, 0);
        unsafe { pointer.as_ptr().write_bytes(0x5C, size) };
        live.push(pointer.as_ptr());
    }

    live.shuffle(&mut rng);
    let half = live.len() / 2;
    for pointer in live.drain(..half) {
        pool.deallocate(pointer);
    }

    for refill in 0..600usize {
        let size = (refill * 37) % 1024 + 1;
        let pointer = pool.allocate(size, DEFAULT_ALIGNMENT).unwrap();
        live.push(pointer.as_ptr());
    }

    for pointer in live {
        pool.deallocate(pointer);
    }
    assert_eq!(pool.current_used_bytes(), 0);
    assert_eq!(pool.net_operations(), 0);
}

/// Allocate/free cycles on several threads at once, with micro-sleeps to
/// shuffle the interleavings. No crash, and the books balance at the end.
#[test]
fn test_multithreaded_stress() {
    const THREADS: usize = 4;
    const CYCLES: usize = 5_000;

    let pool = Arc::new(Pool::new());
    let base_seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using base seed {}", base_seed);

    let mut handles = Vec::new();
    for thread_index in 0..THREADS {
        let pool = Arc::clone(&pool);
        handles.push(std::thread::spawn(move || {
            let mut rng =
                rand::rngs::StdRng::seed_from_u64(base_seed.wrapping_add(thread_index as u64));
            for cycle in 0..CYCLES {
                let size = rng.gen_range(1..=2048);
                let pointer = pool
                    .allocate(size, DEFAULT_ALIGNMENT)
                    .expect("stress allocation failed");
                unsafe {
                    pointer.as_ptr().write(thread_index as u8);
                    pointer.as_ptr().add(size - 1).write(cycle as u8);
                }
                if cycle % 512 == 0 {
                    std::thread::sleep(Duration::from_micros(rng.gen_range(0..50)));
                }
                pool.deallocate(pointer.as_ptr());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pool.current_used_bytes(), 0);
    assert_eq!(pool.net_operations(), 0);
}

/// Buddy-tier churn: block sizes measured in MiB, freed and refilled in
/// random order so splits and merges both happen.
#[test]
fn test_medium_churn() {
    let pool = Pool::new();
    let mut rng = seeded_rng();
    let sizes_mib = [1usize, 2, 4, 8, 16];

    let mut live: Vec<*mut u8> = Vec::new();
    for index in 0..60 {
        let size = sizes_mib[index % sizes_mib.len()] << 20;
        let pointer = pool
            .try_allocate(size, DEFAULT_ALIGNMENT)
            .expect("medium churn allocation failed");
        unsafe {
            pointer.as_ptr().write(0xBD);
            pointer.as_ptr().add(size - 1).write(0xDB);
        }
        live.push(pointer.as_ptr());
    }

    live.shuffle(&mut rng);
    let half = live.len() / 2;
    for pointer in live.drain(..half) {
        pool.deallocate(pointer);
    }

    for _ in 0..30 {
        let size = rng.gen_range(1usize..=4) << 20;
        let pointer = pool
            .try_allocate(size, DEFAULT_ALIGNMENT)
            .expect("medium refill allocation failed");
        live.push(pointer.as_ptr());
    }

    for pointer in live {
        pool.deallocate(pointer);
    }
    assert_eq!(pool.current_used_bytes(), 0);
    assert_eq!(pool.net_operations(), 0);
}

/// Freeing the same pointer twice from one thread must not disturb later
/// allocations or the counters.
#[test]
fn test_double_free_churn() {
    let pool = Pool::new();
    let mut rng = seeded_rng();

    for _ in 0..200 {
        let size = rng.gen_range(1usize..=1024);
        let pointer = pool.allocate(size, DEFAULT_ALIGNMENT).unwrap();
        pool.deallocate(pointer.as_ptr());
        pool.deallocate(pointer.as_ptr());
    }

    // Everything above is balanced, and the pool still works.
    let probe = pool.allocate(4096, DEFAULT_ALIGNMENT).unwrap();
    unsafe { probe.as_ptr().write_bytes(0xF0, 4096) };
    pool.deallocate(probe.as_ptr());

    assert_eq!(pool.current_used_bytes(), 0);
    assert_eq!(pool.net_operations(), 0);
}

/// Cross-thread frees: one thread allocates, others free, books balance.
#[test]
fn test_producer_consumer_frees() {
    const BATCH: usize = 512;

    let pool = Arc::new(Pool::new());
    let mut rng = seeded_rng();

    let mut batch: Vec<usize> = Vec::with_capacity(BATCH);
    for _ in 0..BATCH {
        let size = rng.gen_range(1usize..=512);
        let pointer = pool.allocate(size, DEFAULT_ALIGNMENT).unwrap();
        batch.push(pointer.as_ptr() as usize);
    }

    let mut handles = Vec::new();
    for chunk in batch.chunks(BATCH / 4) {
        let pool = Arc::clone(&pool);
        let chunk: Vec<usize> = chunk.to_vec();
        handles.push(std::thread::spawn(move || {
            for address in chunk {
                pool.deallocate(address as *mut u8);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pool.current_used_bytes(), 0);
    assert_eq!(pool.net_operations(), 0);
}

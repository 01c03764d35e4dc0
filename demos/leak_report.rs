//! An example program that enables leak tracking, leaks a block on purpose,
//! and prints the tracker's report.

use tiered_alloc::{alloc_aligned_here, alloc_here, Pool};

fn main() {
    env_logger::init();

    let pool = Pool::new();
    pool.enable_leak_tracking(true);

    let first = alloc_here!(pool, 1024).unwrap();
    let aligned = alloc_aligned_here!(pool, 256, 64).unwrap();
    let leaked = alloc_here!(pool, 512).unwrap();

    pool.deallocate(first.as_ptr());
    pool.deallocate(aligned.as_ptr());
    // `leaked` is intentionally never freed.

    println!("Outstanding bytes: {}", pool.current_used_bytes());
    pool.report_leaks(std::io::stdout()).unwrap();

    // Clean up so the pool's teardown report stays quiet.
    pool.deallocate(leaked.as_ptr());
}

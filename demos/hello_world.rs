use tiered_alloc::{Pool, DEFAULT_ALIGNMENT};

fn main() {
    env_logger::init();
    println!("Hello, World!");

    let pool = Pool::new();

    let greeting = pool.allocate(64, DEFAULT_ALIGNMENT).unwrap();
    unsafe {
        let message = b"hello from the pool";
        core::ptr::copy_nonoverlapping(message.as_ptr(), greeting.as_ptr(), message.len());
        let text = core::str::from_utf8_unchecked(core::slice::from_raw_parts(
            greeting.as_ptr(),
            message.len(),
        ));
        println!("Got a string: {}", text);
    }
    pool.deallocate(greeting.as_ptr());

    // One allocation from each tier band.
    for size in [512usize, 3 << 20, 520 << 20] {
        match pool.try_allocate(size, DEFAULT_ALIGNMENT) {
            Some(pointer) => {
                unsafe { pointer.as_ptr().write(1) };
                println!("Allocated {} bytes at {:p}", size, pointer.as_ptr());
                pool.deallocate(pointer.as_ptr());
            }
            None => println!("Allocation of {} bytes refused", size),
        }
    }

    println!("Outstanding bytes: {}", pool.current_used_bytes());
}

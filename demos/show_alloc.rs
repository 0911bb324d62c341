//! Runs a few sample allocation sequences and prints the memory map after
//! each step.
//!
//! Run with `RUST_LOG=debug` to see the allocator's own log.

use zone_allocator::pages::OsPages;
use zone_allocator::RawAlloc;

fn show(allocator: &RawAlloc<OsPages>, step: &str) {
    println!("{}", step);
    print!("{}", allocator);
}

fn main() -> Result<(), zone_allocator::Error> {
    env_logger::init();
    let mut allocator = RawAlloc::new(OsPages::default());

    let first = allocator.allocate(48)?;
    let second = allocator.allocate(64)?;
    show(&allocator, "allocate(48), allocate(64)");

    allocator.free(first.as_ptr())?;
    show(&allocator, "free(first)");

    allocator.free(second.as_ptr())?;
    show(&allocator, "free(second)");

    let third = allocator.allocate(12)?;
    show(&allocator, "allocate(12)");

    // Misuse is reported, not acted on
    if let Err(err) = allocator.free(second.as_ptr()) {
        println!("second free of the same pointer: {}", err);
    }

    let mut p = allocator.allocate(0)?;
    for size in [64, 256, 2048, 256] {
        p = allocator.resize(p.as_ptr(), size)?;
        println!("resize to {} -> {:p}", size, p);
    }
    show(&allocator, "after resizing");

    let small = allocator.allocate(4096)?;
    let large = allocator.allocate(4097)?;
    show(&allocator, "allocate(4096), allocate(4097)");

    for ptr in [third, p, small, large] {
        allocator.free(ptr.as_ptr())?;
    }
    show(&allocator, "everything freed");

    let (validity, stats) = allocator.stats();
    println!("Validity: {:?}", validity);
    println!("Stats:    {:?}", stats);
    Ok(())
}

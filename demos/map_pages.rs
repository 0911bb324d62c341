//! This is a very minimal example to show using a PageSource directly.

use zone_allocator::pages::{OsPages, PageSource};

fn main() {
    #[cfg(feature = "use_libc")]
    println!("Using libc");
    #[cfg(not(feature = "use_libc"))]
    println!("Using assembly syscalls");

    let mut pages = OsPages::default();
    let page_size = pages.page_size();
    println!("Page size: {}", page_size);

    unsafe {
        let p = pages.map(8).unwrap();
        println!("Mapped: ({:p}={}, {})", p, p.as_ptr() as usize, page_size);
        pages.unmap(p, 8).unwrap();
    }
    println!("Mapped pages now: {}", pages.mapped_pages());
}

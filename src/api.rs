//! C entry points over a process-wide [`UnixAllocator`].
//!
//! These keep their own allocator instance, separate from whatever
//! `#[global_allocator]` the Rust side uses. Misuse is reported on standard
//! error, once, from here (the allocator only returns the error) and the call
//! becomes a no-op; nothing here aborts.

use core::ffi::c_void;
use core::fmt::Write;
use core::ptr::null_mut;

use crate::allocators::UnixAllocator;
use crate::error::Error;
use crate::report::FdWriter;

static ALLOCATOR: UnixAllocator = UnixAllocator::new();

fn write_failure<W: Write>(out: &mut W, call: &str, err: Error) {
    let _ = writeln!(out, "{}(): {}", call, err);
}

fn report(call: &str, err: Error) {
    write_failure(&mut FdWriter::stderr(), call, err);
}

/// Allocate `size` bytes. Returns null only if the OS refuses memory.
#[no_mangle]
pub extern "C" fn ft_malloc(size: usize) -> *mut c_void {
    match ALLOCATOR.allocate(size) {
        Ok(ptr) => ptr.as_ptr() as *mut c_void,
        Err(err) => {
            report("malloc", err);
            null_mut()
        }
    }
}

/// Free a pointer from `ft_malloc`/`ft_realloc`. Null is ignored.
///
/// # Safety
///
/// `ptr` must not be used after this call.
#[no_mangle]
pub unsafe extern "C" fn ft_free(ptr: *mut c_void) {
    if let Err(err) = ALLOCATOR.free(ptr as *mut u8) {
        report("free", err);
    }
}

/// Resize an allocation. On null return, `ptr` is untouched.
///
/// # Safety
///
/// When a different pointer comes back, `ptr` must not be used again.
#[no_mangle]
pub unsafe extern "C" fn ft_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    match ALLOCATOR.resize(ptr as *mut u8, size) {
        Ok(new) => new.as_ptr() as *mut c_void,
        Err(err) => {
            report("realloc", err);
            null_mut()
        }
    }
}

/// Print every zone and chunk to standard output.
#[no_mangle]
pub extern "C" fn show_alloc_mem() {
    let _ = ALLOCATOR.dump(&mut FdWriter::stdout());
}

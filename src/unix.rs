//! Raw system calls, for builds without `libc`.
//!
//! Only x86-64 Linux is supported here; everything else should use the
//! `use_libc` feature.

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("raw syscalls are only implemented for x86-64 Linux; enable the `use_libc` feature");

use core::arch::asm;
use core::fmt;

//============================================================
// System call numbers

const SYS_WRITE: usize = 1;
const SYS_MMAP: usize = 9;
const SYS_MUNMAP: usize = 11;

//============================================================
// Flags for protection

pub const PROT_READ: usize = 0x01; // pages can be read
pub const PROT_WRITE: usize = 0x02; // pages can be written

//============================================================
// Flags contain sharing type and options.

pub const MAP_PRIVATE: usize = 0x02; // changes are private
pub const MAP_ANONYMOUS: usize = 0x20; // not backed by any file

/// A failed system call, carrying the errno the kernel returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallError {
    pub errno: usize,
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "syscall failed with errno {}", self.errno)
    }
}

pub type MmapError = SyscallError;

unsafe fn syscall6(
    number: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    a6: usize,
) -> isize {
    let ret: isize;
    asm!(
        "syscall",
        inlateout("rax") number as isize => ret,
        in("rdi") a1,
        in("rsi") a2,
        in("rdx") a3,
        in("r10") a4,
        in("r8") a5,
        in("r9") a6,
        lateout("rcx") _,
        lateout("r11") _,
        options(nostack),
    );
    ret
}

// The kernel reports errors as values in -4095..=-1.
fn check(ret: isize) -> Result<usize, SyscallError> {
    if (-4095..0).contains(&ret) {
        Err(SyscallError {
            errno: ret.unsigned_abs(),
        })
    } else {
        Ok(ret as usize)
    }
}

/// # Safety
///
/// This is a raw `mmap(2)`; see its man page.
pub unsafe fn mmap(
    addr: *mut u8,
    len: usize,
    prot: usize,
    flags: usize,
    fd: isize,
    offset: usize,
) -> Result<*mut u8, MmapError> {
    let ret = syscall6(SYS_MMAP, addr as usize, len, prot, flags, fd as usize, offset);
    check(ret).map(|p| p as *mut u8)
}

/// # Safety
///
/// `addr..addr + len` must be a mapping nothing references any more.
pub unsafe fn munmap(addr: *mut u8, len: usize) -> Result<(), MmapError> {
    check(syscall6(SYS_MUNMAP, addr as usize, len, 0, 0, 0, 0)).map(|_| ())
}

/// Write `buf` to the file descriptor `fd`, returning how much was written.
pub fn write(fd: usize, buf: &[u8]) -> Result<usize, SyscallError> {
    unsafe {
        check(syscall6(
            SYS_WRITE,
            fd,
            buf.as_ptr() as usize,
            buf.len(),
            0,
            0,
            0,
        ))
    }
}

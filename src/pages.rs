//! Where the allocator's memory comes from.
//!
//! [`PageSource`] abstracts over the calls to the OS that map and unmap
//! anonymous memory. Two OS-backed implementations exist, selected by the
//! `use_libc` feature, plus [`ToyPages`], which carves "mappings" out of a
//! caller-provided buffer and is mainly useful for testing.

use core::fmt;
use core::ptr::{null_mut, NonNull};

#[cfg(feature = "use_libc")]
use errno::Errno;

use crate::round_up;
#[cfg(not(feature = "use_libc"))]
use crate::unix::{self, mmap, munmap, MmapError};

pub trait PageSource {
    type Err: fmt::Display;

    /// The granularity of mappings. Zones are sized in whole pages.
    fn page_size(&self) -> usize;

    /// Map at least `size` bytes of fresh read/write memory.
    ///
    /// # Safety
    ///
    /// The returned memory must be available and untracked by any other rust
    /// code, including the allocator itself. `size` must be non-zero.
    unsafe fn map(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Give a mapping back.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must describe a whole mapping previously returned by
    /// `map` on this source, and nothing may reference it afterwards.
    unsafe fn unmap(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), Self::Err>;
}

/// LibcPages uses virtual memory from `mmap` to back zones.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct LibcPages {
    // Just for tracking, not really needed
    pages: usize,
    maps: usize,
}

#[cfg(feature = "use_libc")]
impl LibcPages {
    /// Number of pages currently mapped through this source.
    pub fn mapped_pages(&self) -> usize {
        self.pages
    }

    /// Number of successful `mmap` calls so far.
    pub fn maps(&self) -> usize {
        self.maps
    }
}

#[cfg(feature = "use_libc")]
impl PageSource for LibcPages {
    type Err = Errno;

    fn page_size(&self) -> usize {
        sysconf::page::pagesize()
    }

    unsafe fn map(&mut self, size: usize) -> Result<NonNull<u8>, Errno> {
        let pagesize = self.page_size();
        let to_allocate = round_up(size, pagesize).ok_or(Errno(libc::ENOMEM))?;

        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            // Amount of memory to allocate
            to_allocate,
            // We want read/write access to this memory
            libc::PROT_WRITE | libc::PROT_READ,
            // MAP_ANON: no file behind it. MAP_PRIVATE: not shared with
            // any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }

        let ptr = NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))?;
        self.pages += to_allocate / pagesize;
        self.maps += 1;

        Ok(ptr)
    }

    unsafe fn unmap(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), Errno> {
        if libc::munmap(ptr.as_ptr() as *mut libc::c_void, size) == -1 {
            return Err(errno::errno());
        }
        let pagesize = self.page_size();
        let pages = round_up(size, pagesize).map_or(0, |bytes| bytes / pagesize);
        self.pages = self.pages.saturating_sub(pages);
        Ok(())
    }
}

/// SyscallPages maps memory with raw `mmap` system calls.
#[cfg(not(feature = "use_libc"))]
#[derive(Default)]
pub struct SyscallPages {
    // Just for tracking, not really needed
    pages: usize,
    maps: usize,
}

#[cfg(not(feature = "use_libc"))]
impl SyscallPages {
    /// Page size is 4 kb "on most architectures"
    pub const PAGE_SIZE: usize = 4096;

    pub fn mapped_pages(&self) -> usize {
        self.pages
    }

    pub fn maps(&self) -> usize {
        self.maps
    }
}

#[cfg(not(feature = "use_libc"))]
impl PageSource for SyscallPages {
    type Err = MmapError;

    fn page_size(&self) -> usize {
        Self::PAGE_SIZE
    }

    unsafe fn map(&mut self, size: usize) -> Result<NonNull<u8>, MmapError> {
        // ENOMEM, as the kernel would answer for a length this big
        let to_allocate = round_up(size, Self::PAGE_SIZE).ok_or(MmapError { errno: 12 })?;

        let ptr = mmap(
            null_mut(),
            to_allocate,
            unix::PROT_WRITE | unix::PROT_READ,
            unix::MAP_ANONYMOUS | unix::MAP_PRIVATE,
            -1,
            0,
        )?;

        // ENOMEM
        let ptr = NonNull::new(ptr).ok_or(MmapError { errno: 12 })?;
        self.pages += to_allocate / Self::PAGE_SIZE;
        self.maps += 1;

        Ok(ptr)
    }

    unsafe fn unmap(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), MmapError> {
        munmap(ptr.as_ptr(), size)?;
        let pages = round_up(size, Self::PAGE_SIZE).map_or(0, |bytes| bytes / Self::PAGE_SIZE);
        self.pages = self.pages.saturating_sub(pages);
        Ok(())
    }
}

/// The page source the process-wide allocator uses.
#[cfg(feature = "use_libc")]
pub type OsPages = LibcPages;
#[cfg(not(feature = "use_libc"))]
pub type OsPages = SyscallPages;

/// A "heap" of borrowed bytes that hands out page-aligned slices of itself.
///
/// Mappings are never reused: `unmap` only counts. Running off the end of
/// the buffer is how tests simulate the OS refusing a mapping; setting
/// `refuse_unmap` makes every `unmap` fail instead.
pub struct ToyPages<'heap> {
    pub page_size: usize,
    /// Bytes of `heap` consumed so far, including alignment padding.
    pub used: usize,
    pub maps: usize,
    pub unmaps: usize,
    pub refuse_unmap: bool,
    heap: &'heap mut [u8],
}

impl<'heap> ToyPages<'heap> {
    pub fn new(heap: &'heap mut [u8]) -> Self {
        ToyPages::with_page_size(heap, 4096)
    }

    pub fn with_page_size(heap: &'heap mut [u8], page_size: usize) -> Self {
        assert!(
            page_size.is_power_of_two() && page_size >= crate::ALIGN,
            "page size must be a power of two of at least ALIGN"
        );
        ToyPages {
            page_size,
            used: 0,
            maps: 0,
            unmaps: 0,
            refuse_unmap: false,
            heap,
        }
    }

    /// The full range of the backing buffer.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.heap.as_ptr() as usize;
        addr >= start && addr < start + self.heap.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToyPagesError {
    /// The buffer cannot fit `requested` more bytes. `requested` is `None`
    /// when the page-rounded size does not even fit in a `usize`.
    Exhausted {
        requested: Option<usize>,
        available: usize,
    },
    /// `refuse_unmap` was set.
    UnmapRefused { addr: usize },
}

impl fmt::Display for ToyPagesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ToyPagesError::Exhausted {
                requested: Some(requested),
                available,
            } => write!(
                f,
                "toy heap exhausted: {} bytes requested, {} available",
                requested, available
            ),
            ToyPagesError::Exhausted {
                requested: None,
                available,
            } => write!(
                f,
                "toy heap exhausted: request overflows, {} available",
                available
            ),
            ToyPagesError::UnmapRefused { addr } => write!(f, "unmap of {:#x} refused", addr),
        }
    }
}

impl<'heap> PageSource for ToyPages<'heap> {
    type Err = ToyPagesError;

    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn map(&mut self, size: usize) -> Result<NonNull<u8>, ToyPagesError> {
        let base = self.heap.as_mut_ptr() as usize;
        // Mappings start on a page boundary, just like real ones.
        let start = round_up(base + self.used, self.page_size)
            .map_or(self.heap.len(), |aligned| aligned - base);
        let available = self.heap.len().saturating_sub(start);
        let allocating = match round_up(size, self.page_size) {
            Some(allocating) if allocating <= available => allocating,
            requested => return Err(ToyPagesError::Exhausted { requested, available }),
        };

        let ptr = self.heap.as_mut_ptr().add(start);
        // Fresh anonymous mappings read as zeroes.
        core::ptr::write_bytes(ptr, 0, allocating);
        self.used = start + allocating;
        self.maps += 1;
        Ok(NonNull::new_unchecked(ptr))
    }

    unsafe fn unmap(&mut self, ptr: NonNull<u8>, _size: usize) -> Result<(), ToyPagesError> {
        if self.refuse_unmap {
            return Err(ToyPagesError::UnmapRefused {
                addr: ptr.as_ptr() as usize,
            });
        }
        self.unmaps += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_toy_pages_are_page_aligned() {
        let mut heap = vec![0u8; 64 * 1024];
        let mut pages = ToyPages::with_page_size(&mut heap, 1024);

        let first = unsafe { pages.map(10).unwrap() };
        let second = unsafe { pages.map(1500).unwrap() };
        assert_eq!(first.as_ptr() as usize % 1024, 0);
        assert_eq!(second.as_ptr() as usize % 1024, 0);
        assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, 1024);
        assert_eq!(pages.maps, 2);
    }

    #[test]
    fn test_toy_pages_overflow() {
        let mut heap = vec![0u8; 16 * 1024];
        let mut pages = ToyPages::with_page_size(&mut heap, 1024);

        let err = unsafe { pages.map(64 * 1024).unwrap_err() };
        match err {
            ToyPagesError::Exhausted {
                requested,
                available,
            } => {
                assert_eq!(requested, Some(64 * 1024));
                assert!(available <= 16 * 1024);
            }
            other => panic!("unexpected error {:?}", other),
        }
        // A failed map consumes nothing.
        assert_eq!(pages.used, 0);
        assert_eq!(pages.maps, 0);

        // Sizes that cannot be rounded to a page fail the same way.
        let err = unsafe { pages.map(usize::MAX - 100).unwrap_err() };
        assert!(matches!(err, ToyPagesError::Exhausted { requested: None, .. }));
        assert_eq!(pages.maps, 0);
    }

    #[test]
    fn test_toy_pages_refuse_unmap() {
        let mut heap = vec![0u8; 16 * 1024];
        let mut pages = ToyPages::with_page_size(&mut heap, 1024);
        let ptr = unsafe { pages.map(100).unwrap() };

        pages.refuse_unmap = true;
        assert_eq!(
            unsafe { pages.unmap(ptr, 100) },
            Err(ToyPagesError::UnmapRefused {
                addr: ptr.as_ptr() as usize
            })
        );
        assert_eq!(pages.unmaps, 0);

        pages.refuse_unmap = false;
        assert_eq!(unsafe { pages.unmap(ptr, 100) }, Ok(()));
        assert_eq!(pages.unmaps, 1);
    }

    #[cfg(feature = "use_libc")]
    #[test]
    fn test_libc_pages_round_trip() {
        let mut pages = LibcPages::default();
        let page_size = pages.page_size();
        assert!(page_size.is_power_of_two());

        unsafe {
            let ptr = pages.map(page_size + 1).unwrap();
            assert_eq!(ptr.as_ptr() as usize % page_size, 0);
            assert_eq!(pages.mapped_pages(), 2);
            ptr.as_ptr().write_bytes(0xAB, page_size + 1);
            pages.unmap(ptr, page_size + 1).unwrap();

            assert_eq!(pages.map(usize::MAX - 100), Err(Errno(libc::ENOMEM)));
        }
        assert_eq!(pages.mapped_pages(), 0);
        assert_eq!(pages.maps(), 1);
    }
}

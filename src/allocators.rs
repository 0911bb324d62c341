//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded zone allocator: it owns the tiny and
//! small zone lists and the list of large mappings, and implements allocate,
//! free, resize and dump on top of them. It is an ordinary value; drop it and
//! its memory is simply leaked (it never unmaps zones).
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! A `UnixAllocator` wraps a `RawAlloc` over OS pages in a spin lock, so a
//! single instance can live in a `static` and be installed as the global
//! allocator.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::ptr::{self, null_mut, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

use log::{debug, error, trace, warn};
use spin::{Mutex, MutexGuard};

use crate::chunk::{check_large, check_zone, Chunk, ChunkList, ChunkState, Stats, Validity, HEADER_SIZE};
use crate::error::Error;
use crate::pages::{OsPages, PageSource};
use crate::zone::{Zone, ZoneList};
use crate::{align_up, SizeClass, ALIGN};

/// Which bookkeeping a validated pointer falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// A chunk inside a tiny or small zone.
    Zone(Zone),
    /// A dedicated large mapping.
    Large,
}

/// A single-threaded zone allocator drawing its memory from `P`.
///
/// Note: It never returns tiny or small zones to the OS; only large mappings
/// are unmapped when freed.
pub struct RawAlloc<P> {
    pub pages: P,
    tiny: ZoneList,
    small: ZoneList,
    large: ChunkList,
}

// The lists only point into memory this allocator mapped, so the whole
// structure can move between threads as one piece.
unsafe impl<P: Send> Send for RawAlloc<P> {}

impl<P: PageSource + Default> Default for RawAlloc<P> {
    fn default() -> Self {
        RawAlloc::new(P::default())
    }
}

impl<P: PageSource> RawAlloc<P> {
    pub const fn new(pages: P) -> Self {
        RawAlloc {
            pages,
            tiny: ZoneList::new(),
            small: ZoneList::new(),
            large: ChunkList::new(),
        }
    }

    pub fn zones(&self, class: SizeClass) -> Option<&ZoneList> {
        match class {
            SizeClass::Tiny => Some(&self.tiny),
            SizeClass::Small => Some(&self.small),
            SizeClass::Large => None,
        }
    }

    /// The dedicated large mappings, in creation order.
    pub fn large(&self) -> &ChunkList {
        &self.large
    }

    /// Get statistics on this allocator, and verify the validity of every
    /// chunk list.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();
        for zone in self.tiny.iter().chain(self.small.iter()) {
            stats.zones += 1;
            check_zone(zone.first(), zone.area(), &mut validity, &mut stats);
        }
        check_large(&self.large, &mut validity, &mut stats);
        (validity, stats)
    }

    ////////////////////////////////////////////////////////////
    // Allocation

    /// Allocate `size` bytes. The returned pointer is aligned to `ALIGN`.
    ///
    /// Zero is a valid size: it gets its own (empty) chunk and a unique
    /// pointer.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        let size = align_up(size).ok_or(Error::MapFailed { size })?;
        let chunk = match SizeClass::of(size) {
            SizeClass::Large => self.allocate_large(size)?,
            class => self.allocate_in_zone(class, size)?,
        };
        debug!("Allocated {} bytes at {:p}", size, chunk.payload());
        Ok(chunk.payload())
    }

    fn allocate_in_zone(&mut self, class: SizeClass, size: usize) -> Result<Chunk, Error> {
        let (pages, zones) = match class {
            SizeClass::Tiny => (&mut self.pages, &mut self.tiny),
            SizeClass::Small => (&mut self.pages, &mut self.small),
            SizeClass::Large => unreachable!("large requests do not use zones"),
        };

        // First zone whose estimate says there's room, and which really does
        // have a chunk for us.
        for zone in zones.candidates(size) {
            if let Some(chunk) = zone.take_chunk(size) {
                return Ok(chunk);
            }
            trace!(
                "Zone at {:#x} claims {} free bytes but has no room for {}",
                zone.addr(),
                zone.free_space(),
                size
            );
        }

        let max_payload = class.max_payload().unwrap_or(size);
        let zone = match Zone::create(pages, max_payload) {
            Ok(zone) => zone,
            Err(err) => {
                debug!("mmap(): {} zone for {} bytes: {}", class.label(), size, err);
                return Err(Error::MapFailed { size });
            }
        };
        debug!(
            "Created {} zone at {:#x}, {} bytes",
            class.label(),
            zone.addr(),
            zone.size()
        );
        zones.push_back(zone);

        // A fresh zone holds CHUNKS_PER_ZONE chunks of the class maximum.
        zone.take_chunk(size).ok_or(Error::MapFailed { size })
    }

    fn allocate_large(&mut self, size: usize) -> Result<Chunk, Error> {
        let total = size.checked_add(HEADER_SIZE).ok_or(Error::MapFailed { size })?;
        let base = match unsafe { self.pages.map(total) } {
            Ok(base) => base,
            Err(err) => {
                debug!("mmap(): large chunk of {} bytes: {}", size, err);
                return Err(Error::MapFailed { size });
            }
        };
        let chunk = unsafe { Chunk::write(base, size, None, None, ChunkState::Live) };
        self.large.push_back(chunk);
        Ok(chunk)
    }

    ////////////////////////////////////////////////////////////
    // Validation

    /// Recover the chunk behind a payload pointer handed out earlier.
    ///
    /// Rejects pointers that are misaligned, that fall in a zone but before
    /// its first possible payload, that are in no zone and are not the start
    /// of a tracked large mapping, or whose header fails the canary check.
    /// Freed chunks pass; callers check the state themselves.
    pub fn validate(&self, ptr: NonNull<u8>) -> Result<(Chunk, Owner), Error> {
        let addr = ptr.as_ptr() as usize;
        let invalid = Error::InvalidPointer { addr };
        if addr % ALIGN != 0 {
            return Err(invalid);
        }

        let zone = self.tiny.locate(addr).or_else(|| self.small.locate(addr));
        let zone = match zone {
            Some(zone) => zone,
            None => {
                // Only ever look at headers we know exist.
                let chunk = self.large.find(ptr).ok_or(invalid)?;
                if !chunk.canary_intact() {
                    return Err(invalid);
                }
                return Ok((chunk, Owner::Large));
            }
        };

        let area = zone.area();
        if addr < area.start + HEADER_SIZE {
            return Err(invalid);
        }
        // The header lies inside the zone, so reading it is fine.
        let chunk = unsafe { Chunk::probe(ptr) }.ok_or(invalid)?;
        if chunk.size() > area.end - addr {
            return Err(invalid);
        }
        Ok((chunk, Owner::Zone(zone)))
    }

    ////////////////////////////////////////////////////////////
    // Deallocation

    /// Free a pointer returned by `allocate` or `resize`. Null is a no-op.
    ///
    /// Invalid pointers and double frees are returned as errors, for the
    /// caller to report; the allocator is left untouched in both cases.
    pub fn free(&mut self, ptr: *mut u8) -> Result<(), Error> {
        let ptr = match NonNull::new(ptr) {
            None => return Ok(()),
            Some(p) => p,
        };
        let (chunk, owner) = self.validate(ptr)?;
        if chunk.is_free() {
            return Err(Error::DoubleFree {
                addr: ptr.as_ptr() as usize,
            });
        }

        match owner {
            Owner::Zone(zone) => {
                zone.release(chunk);
                chunk.mark_free();
                chunk.coalesce();
            }
            Owner::Large => self.free_large(chunk)?,
        }
        debug!("Freed {:p}", ptr);
        Ok(())
    }

    fn free_large(&mut self, chunk: Chunk) -> Result<(), Error> {
        self.large.unlink(chunk);
        chunk.mark_free();
        let total = chunk.size() + HEADER_SIZE;
        let base = chunk.header_ptr();
        // The list no longer knows about this mapping whether or not the
        // unmap succeeds.
        if let Err(err) = unsafe { self.pages.unmap(base, total) } {
            debug!("munmap(): {:p}: {}", base, err);
            return Err(Error::UnmapFailed {
                addr: base.as_ptr() as usize,
                size: total,
            });
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////
    // Resizing

    /// Resize the allocation at `ptr` to `size` bytes.
    ///
    /// A null `ptr` behaves like `allocate(size)`. On error the original
    /// allocation is untouched and still valid.
    ///
    /// Shrinking always happens in place. Growing happens in place when the
    /// following chunk is free and big enough; otherwise the payload moves
    /// to a new chunk.
    pub fn resize(&mut self, ptr: *mut u8, size: usize) -> Result<NonNull<u8>, Error> {
        let ptr = match NonNull::new(ptr) {
            None => return self.allocate(size),
            Some(p) => p,
        };
        let (chunk, owner) = self.validate(ptr)?;
        if chunk.is_free() {
            return Err(Error::DoubleFree {
                addr: ptr.as_ptr() as usize,
            });
        }
        let size = match align_up(size) {
            Some(size) => size,
            None => return Err(Error::MapFailed { size }),
        };

        if chunk.size() >= size {
            // A large mapping cannot host a second chunk; it just keeps its
            // slack.
            if let Owner::Zone(_) = owner {
                chunk.split(size);
            }
            trace!("Shrunk {:p} in place to {}", ptr, chunk.size());
            return Ok(ptr);
        }

        if let Owner::Zone(_) = owner {
            let fits_forward = chunk
                .next()
                .filter(|next| next.is_free())
                .map_or(false, |next| chunk.size() + HEADER_SIZE + next.size() >= size);
            if fits_forward {
                chunk.merge_next();
                chunk.split(size);
                trace!("Grew {:p} in place to {}", ptr, chunk.size());
                return Ok(ptr);
            }
        }

        let new_ptr = self.allocate(size)?;
        let moved = unsafe { Chunk::from_payload(new_ptr) };
        let count = chunk.size().min(size);
        // Never write past the new chunk, whatever the old one held.
        assert!(
            moved.size() >= count,
            "destination chunk of {} bytes cannot take {}",
            moved.size(),
            count
        );
        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), count) };
        trace!("Moved {} bytes from {:p} to {:p}", count, ptr, new_ptr);

        if let Err(err) = self.free(ptr.as_ptr()) {
            // Only a failed unmap of a large original can land here; the
            // data has already moved.
            warn!("realloc(): releasing the old block: {}", err);
        }
        Ok(new_ptr)
    }

    ////////////////////////////////////////////////////////////
    // Reporting

    /// Write a human-readable map of every zone and chunk to `out`.
    pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        crate::report::write_report(self, out)
    }
}

impl<P: PageSource> fmt::Display for RawAlloc<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dump(f)
    }
}

/// A lock around a RawAlloc, initialized on first use, so that it can live
/// in a `static`.
///
/// The lock only serializes access; the allocator itself is not designed for
/// concurrent use, and none of its operations may be re-entered (for example
/// from a logger that allocates while the lock is held).
pub struct GenericAllocator<P> {
    // Values:
    // - 0: Untouched
    // - 1: Initialization in progress
    // - 2: Initialized
    init: AtomicU8,
    raw: UnsafeCell<MaybeUninit<Mutex<RawAlloc<P>>>>,
}

// All access to `raw` goes through `init` and the mutex.
unsafe impl<P: Send> Sync for GenericAllocator<P> {}

impl<P: PageSource + Default> Default for GenericAllocator<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> GenericAllocator<P> {
    pub const fn new() -> Self {
        GenericAllocator {
            init: AtomicU8::new(0),
            raw: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

impl<P: PageSource + Default> GenericAllocator<P> {
    /// Get a reference to the underlying RawAlloc.
    ///
    /// # Safety
    ///
    /// This is unsafe because it blocks allocation while the mutex guard is in
    /// place.
    pub unsafe fn get_raw(&self) -> MutexGuard<RawAlloc<P>> {
        // The plan:
        // - If initializing hasn't yet started (0):
        //   - Mark it as initializing (1), then initialize, then mark it as fully initialized (2)
        // - If it has started but not completed (1):
        //   - Enter a spin loop until it is fully initialized (2)
        // - If it finished initializing (2):
        //   - Continue
        let state = self
            .init
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);

        match state {
            Err(2) => {}
            Ok(0) => {
                let slot: &mut MaybeUninit<Mutex<RawAlloc<P>>> = &mut *self.raw.get();
                let mx: &Mutex<RawAlloc<P>> = slot.write(Mutex::new(RawAlloc::default()));

                // Let other threads know that the mutex and raw allocator are now initialized,
                // and they are free to use the mutex to access the raw allocator
                self.init.store(2, Ordering::SeqCst);
                return mx.lock();
            }
            Err(1) => loop {
                // Hint to the processor that we're in a spin loop
                core::hint::spin_loop();
                match self.init.load(Ordering::SeqCst) {
                    1 => continue,
                    2 => break,
                    state => panic!("Unexpected state {}", state),
                }
            },
            Ok(v) => panic!("Unexpected OK state loaded: {}", v),
            Err(v) => panic!("Unexpected Err state loaded: {}", v),
        }

        let slot: &MaybeUninit<Mutex<RawAlloc<P>>> = &*self.raw.get();
        slot.assume_init_ref().lock()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        unsafe { self.get_raw().stats() }
    }
}

/// The process-wide allocator over OS pages.
///
/// ```no_run
/// use zone_allocator::UnixAllocator;
///
/// #[global_allocator]
/// static ALLOCATOR: UnixAllocator = UnixAllocator::new();
///
/// fn main() {
///     let v: Vec<u32> = (0..1000).collect();
///     assert_eq!(v.len(), 1000);
/// }
/// ```
///
/// When installed as the global allocator, any installed logger must not
/// allocate, or it will deadlock on the allocator's own lock.
#[derive(Default)]
pub struct UnixAllocator {
    alloc: GenericAllocator<OsPages>,
}

impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }

    /// # Safety
    ///
    /// See [`RawAlloc::free`]; additionally `ptr` must not be in use after.
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<(), Error> {
        self.alloc.get_raw().free(ptr)
    }

    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, Error> {
        unsafe { self.alloc.get_raw().allocate(size) }
    }

    /// # Safety
    ///
    /// On success, `ptr` may no longer be used unless it was returned.
    pub unsafe fn resize(&self, ptr: *mut u8, size: usize) -> Result<NonNull<u8>, Error> {
        self.alloc.get_raw().resize(ptr, size)
    }

    pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        unsafe { self.alloc.get_raw().dump(out) }
    }
}

// Failures are logged here, after the lock is released, since `GlobalAlloc`
// has no way to hand them back.
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return null_mut();
        }
        match self.allocate(layout.size()) {
            Ok(p) => p.as_ptr(),
            Err(err) => {
                error!("malloc(): {}", err);
                null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Err(err) = self.free(ptr) {
            error!("free(): {}", err);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGN {
            return null_mut();
        }
        match self.resize(ptr, new_size) {
            Ok(p) => p.as_ptr(),
            Err(err) => {
                error!("realloc(): {}", err);
                null_mut()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::pages::ToyPages;
    use crate::{SMALL_MAX, TINY_MAX};
    use test_log::test;

    fn heap() -> Vec<u8> {
        vec![0u8; 4 << 20]
    }

    fn assert_valid<P: PageSource>(allocator: &RawAlloc<P>) -> Stats {
        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        stats
    }

    #[test]
    fn test_basic() {
        let mut heap = heap();
        let mut allocator = RawAlloc::new(ToyPages::new(&mut heap));

        let a = allocator.allocate(48).unwrap();
        let b = allocator.allocate(64).unwrap();
        let c = allocator.allocate(224).unwrap();
        assert_valid(&allocator);

        // Tiny chunks are packed back to back
        assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + 48 + HEADER_SIZE);
        // 224 bytes is small, so it lives in another zone
        assert_eq!(allocator.zones(SizeClass::Tiny).unwrap().len(), 1);
        assert_eq!(allocator.zones(SizeClass::Small).unwrap().len(), 1);
        assert_eq!(allocator.pages.maps, 2);

        allocator.free(b.as_ptr()).unwrap();
        let stats = assert_valid(&allocator);
        assert_eq!(stats.free_chunks, 1);
        assert_eq!(stats.live_bytes, 48 + 224);

        // 32 bytes fit in b's old slot; not enough left over to split
        let d = allocator.allocate(32).unwrap();
        assert_eq!(d, b);
        allocator.free(a.as_ptr()).unwrap();
        allocator.free(c.as_ptr()).unwrap();
        allocator.free(d.as_ptr()).unwrap();

        let stats = assert_valid(&allocator);
        assert_eq!(stats.live_chunks, 0);
        // Both zones collapsed to a single free chunk each
        assert_eq!(stats.free_chunks, 2);
    }

    #[test]
    fn test_alignment() {
        let mut heap = heap();
        let mut allocator = RawAlloc::new(ToyPages::new(&mut heap));
        for size in [0, 1, 7, 15, 16, 17, 100, 128, 129, 1000, 4096, 4097, 10000] {
            let p = allocator.allocate(size).unwrap();
            assert_eq!(p.as_ptr() as usize % ALIGN, 0, "size {}", size);
        }
        assert_valid(&allocator);
    }

    #[test]
    fn test_large_round_trip() {
        let mut heap = heap();
        let mut allocator = RawAlloc::new(ToyPages::new(&mut heap));

        let small = allocator.allocate(SMALL_MAX).unwrap();
        let large = allocator.allocate(SMALL_MAX + 1).unwrap();
        assert!(allocator.zones(SizeClass::Small).unwrap().locate(small.as_ptr() as usize).is_some());
        assert_eq!(allocator.large().len(), 1);
        assert_eq!(allocator.large().first().unwrap().payload(), large);

        allocator.free(large.as_ptr()).unwrap();
        assert!(allocator.large().is_empty());
        assert_eq!(allocator.pages.unmaps, 1);

        // The mapping is gone; the pointer is now unknown.
        assert_eq!(
            allocator.free(large.as_ptr()),
            Err(Error::InvalidPointer {
                addr: large.as_ptr() as usize
            })
        );
    }

    #[test]
    fn test_huge_requests_fail_cleanly() {
        let mut heap = heap();
        let mut allocator = RawAlloc::new(ToyPages::new(&mut heap));
        let a = allocator.allocate(64).unwrap();

        for size in [usize::MAX, usize::MAX - 100, usize::MAX - 4096, usize::MAX / 2] {
            assert!(matches!(allocator.allocate(size), Err(Error::MapFailed { .. })));
            assert!(matches!(
                allocator.resize(a.as_ptr(), size),
                Err(Error::MapFailed { .. })
            ));
        }
        assert_eq!(allocator.pages.maps, 1);
        let (chunk, _) = allocator.validate(a).unwrap();
        assert_eq!(chunk.state(), ChunkState::Live);
        assert_valid(&allocator);
    }

    #[cfg(feature = "use_libc")]
    #[test]
    fn test_huge_requests_fail_on_os_pages() {
        let mut allocator = RawAlloc::new(OsPages::default());
        let a = allocator.allocate(64).unwrap();
        for size in [usize::MAX - 100, usize::MAX - 4096] {
            assert!(matches!(allocator.allocate(size), Err(Error::MapFailed { .. })));
            assert!(matches!(
                allocator.resize(a.as_ptr(), size),
                Err(Error::MapFailed { .. })
            ));
        }
        allocator.free(a.as_ptr()).unwrap();
    }

    #[test]
    fn test_unmap_failure_still_forgets_mapping() {
        let mut heap = heap();
        let mut allocator = RawAlloc::new(ToyPages::new(&mut heap));
        let large = allocator.allocate(SMALL_MAX * 2).unwrap();
        let header = large.as_ptr() as usize - HEADER_SIZE;

        allocator.pages.refuse_unmap = true;
        assert_eq!(
            allocator.free(large.as_ptr()),
            Err(Error::UnmapFailed {
                addr: header,
                size: SMALL_MAX * 2 + HEADER_SIZE,
            })
        );
        assert!(allocator.large().is_empty());
        assert_eq!(allocator.pages.unmaps, 0);
        let stats = assert_valid(&allocator);
        assert_eq!(stats.large_chunks, 0);
    }

    #[test]
    fn test_resize_moves_despite_unmap_failure() {
        let mut heap = heap();
        let mut allocator = RawAlloc::new(ToyPages::new(&mut heap));
        let large = allocator.allocate(SMALL_MAX * 2).unwrap();
        unsafe { large.as_ptr().write_bytes(0x5A, SMALL_MAX * 2) };

        allocator.pages.refuse_unmap = true;
        let moved = allocator.resize(large.as_ptr(), SMALL_MAX * 4).unwrap();
        assert_ne!(moved, large);
        assert_eq!(unsafe { moved.as_ptr().add(SMALL_MAX * 2 - 1).read() }, 0x5A);
        assert_eq!(allocator.large().len(), 1);
        assert_eq!(allocator.large().first().map(|c| c.payload()), Some(moved));
        assert_valid(&allocator);
    }

    #[test]
    fn test_double_free() {
        let mut heap = heap();
        let mut allocator = RawAlloc::new(ToyPages::new(&mut heap));
        let a = allocator.allocate(TINY_MAX).unwrap();
        let _b = allocator.allocate(TINY_MAX).unwrap();

        allocator.free(a.as_ptr()).unwrap();
        let before = allocator.to_string();
        assert_eq!(
            allocator.free(a.as_ptr()),
            Err(Error::DoubleFree {
                addr: a.as_ptr() as usize
            })
        );
        assert_eq!(allocator.to_string(), before);
    }

    #[test]
    fn test_invalid_pointers() {
        let mut heap = heap();
        let mut allocator = RawAlloc::new(ToyPages::new(&mut heap));
        let a = allocator.allocate(64).unwrap();
        let before = allocator.to_string();

        let mut local = [0u64; 8];
        let foreign = local.as_mut_ptr() as *mut u8;
        assert!(matches!(allocator.free(foreign), Err(Error::InvalidPointer { .. })));
        assert!(matches!(allocator.resize(foreign, 8), Err(Error::InvalidPointer { .. })));

        // Misaligned and mid-payload pointers into a live chunk
        let inside = unsafe { a.as_ptr().add(1) };
        assert!(matches!(allocator.free(inside), Err(Error::InvalidPointer { .. })));
        let inside = unsafe { a.as_ptr().add(32) };
        assert!(matches!(allocator.free(inside), Err(Error::InvalidPointer { .. })));

        assert_eq!(allocator.to_string(), before);
        allocator.free(a.as_ptr()).unwrap();
    }

    #[test]
    fn test_free_null_is_noop() {
        let mut heap = heap();
        let mut allocator = RawAlloc::new(ToyPages::new(&mut heap));
        assert_eq!(allocator.free(null_mut()), Ok(()));
        assert_eq!(allocator.pages.maps, 0);
    }

    #[test]
    fn test_map_failure() {
        // Room for a tiny zone, not for a small one
        let mut heap = vec![0u8; 64 * 1024];
        let mut allocator = RawAlloc::new(ToyPages::new(&mut heap));

        let a = allocator.allocate(16).unwrap();
        assert_eq!(
            allocator.allocate(2048),
            Err(Error::MapFailed { size: 2048 })
        );
        assert_eq!(
            allocator.allocate(1 << 20),
            Err(Error::MapFailed { size: 1 << 20 })
        );
        // A failed resize leaves the original alone
        unsafe { a.as_ptr().write_bytes(7, 16) };
        assert!(allocator.resize(a.as_ptr(), 1 << 20).is_err());
        let (chunk, _) = allocator.validate(a).unwrap();
        assert_eq!(chunk.state(), ChunkState::Live);
        assert_eq!(unsafe { *a.as_ptr().add(15) }, 7);
        assert_valid(&allocator);
    }

    #[test]
    fn test_resize_in_place() {
        let mut heap = heap();
        let mut allocator = RawAlloc::new(ToyPages::new(&mut heap));
        let a = allocator.allocate(512).unwrap();
        let b = allocator.allocate(512).unwrap();
        let _c = allocator.allocate(512).unwrap();

        // Shrink: same pointer, leftover becomes a free chunk
        assert_eq!(allocator.resize(a.as_ptr(), 256).unwrap(), a);
        let stats = assert_valid(&allocator);
        assert_eq!(stats.free_chunks, 1);

        // Grow back into the leftover
        assert_eq!(allocator.resize(a.as_ptr(), 512).unwrap(), a);
        let stats = assert_valid(&allocator);
        assert_eq!(stats.free_chunks, 0);

        // Free b, then grow a across it
        allocator.free(b.as_ptr()).unwrap();
        assert_eq!(allocator.resize(a.as_ptr(), 800).unwrap(), a);
        let (chunk, _) = allocator.validate(a).unwrap();
        assert_eq!(chunk.size(), 800);
        assert_valid(&allocator);
    }

    #[test]
    fn test_resize_moves_and_copies() {
        let mut heap = heap();
        let mut allocator = RawAlloc::new(ToyPages::new(&mut heap));
        let a = allocator.allocate(64).unwrap();
        let _fence = allocator.allocate(64).unwrap();
        for i in 0..64 {
            unsafe { a.as_ptr().add(i).write(i as u8) };
        }

        let moved = allocator.resize(a.as_ptr(), 96).unwrap();
        assert_ne!(moved, a);
        for i in 0..64 {
            assert_eq!(unsafe { moved.as_ptr().add(i).read() }, i as u8);
        }
        // The old chunk was freed
        let (old, _) = allocator.validate(a).unwrap();
        assert!(old.is_free());
        assert_valid(&allocator);
    }

    #[test]
    fn test_resize_free_chunk_is_rejected() {
        let mut heap = heap();
        let mut allocator = RawAlloc::new(ToyPages::new(&mut heap));
        let a = allocator.allocate(64).unwrap();
        let _b = allocator.allocate(64).unwrap();
        allocator.free(a.as_ptr()).unwrap();
        assert!(matches!(
            allocator.resize(a.as_ptr(), 32),
            Err(Error::DoubleFree { .. })
        ));
    }

    #[test]
    fn test_large_shrink_keeps_mapping() {
        let mut heap = heap();
        let mut allocator = RawAlloc::new(ToyPages::new(&mut heap));
        let a = allocator.allocate(3 * SMALL_MAX).unwrap();
        assert_eq!(allocator.resize(a.as_ptr(), 64).unwrap(), a);
        assert_eq!(allocator.large().len(), 1);
        assert_eq!(allocator.large().first().unwrap().size(), 3 * SMALL_MAX);
        allocator.free(a.as_ptr()).unwrap();
        assert!(allocator.large().is_empty());
    }

    #[test]
    fn test_global_allocator_wrapper() {
        static ALLOCATOR: UnixAllocator = UnixAllocator::new();

        unsafe {
            let layout = Layout::from_size_align(100, 8).unwrap();
            let p = ALLOCATOR.alloc(layout);
            assert!(!p.is_null());
            p.write_bytes(0x5a, 100);

            let q = ALLOCATOR.realloc(p, layout, 5000);
            assert!(!q.is_null());
            assert_eq!(q.add(99).read(), 0x5a);

            ALLOCATOR.dealloc(q, Layout::from_size_align(5000, 8).unwrap());

            let too_aligned = Layout::from_size_align(64, 4096).unwrap();
            assert!(ALLOCATOR.alloc(too_aligned).is_null());
        }
        let (validity, stats) = ALLOCATOR.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.live_chunks, 0);
        assert_eq!(stats.large_chunks, 0);
    }
}

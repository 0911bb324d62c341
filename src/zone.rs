use core::ops::Range;
use core::ptr::{self, NonNull};

use static_assertions::const_assert;

use crate::chunk::{first_fit, Chunk, ChunkIter, ChunkState, Search, HEADER_SIZE};
use crate::pages::PageSource;
use crate::{round_up, ALIGN, CHUNKS_PER_ZONE};

/// The header at the start of every zone mapping. Chunks follow it directly.
#[repr(C, align(16))]
pub struct ZoneHeader {
    /// Size of the whole mapping, header included.
    size: usize,
    /// Bytes believed to be available. See [`Zone::free_space`].
    free_space: usize,
    first: Option<Chunk>,
    next: Option<Zone>,
}

pub const ZONE_HEADER_SIZE: usize = core::mem::size_of::<ZoneHeader>();
const_assert!(ZONE_HEADER_SIZE % ALIGN == 0);

/// Bytes to map for a zone serving payloads of up to `max_payload` bytes.
pub fn zone_size(max_payload: usize, page_size: usize) -> Option<usize> {
    let chunks = max_payload
        .checked_add(HEADER_SIZE)?
        .checked_mul(CHUNKS_PER_ZONE)?;
    round_up(chunks.checked_add(ZONE_HEADER_SIZE)?, page_size)
}

/// A handle to a zone header at the start of a mapping.
///
/// Same rules as [`Chunk`]: constructing one is unsafe, using one is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zone {
    header: NonNull<ZoneHeader>,
}

impl Zone {
    /// Map a new, empty zone for payloads of up to `max_payload` bytes.
    pub fn create<P: PageSource>(pages: &mut P, max_payload: usize) -> Result<Zone, P::Err> {
        // An unrepresentable size is left for the page source to refuse.
        let size = zone_size(max_payload, pages.page_size()).unwrap_or(usize::MAX);
        unsafe {
            let base = pages.map(size)?;
            let header: NonNull<ZoneHeader> = base.cast();
            ptr::write(
                header.as_ptr(),
                ZoneHeader {
                    size,
                    free_space: size - ZONE_HEADER_SIZE,
                    first: None,
                    next: None,
                },
            );
            Ok(Zone { header })
        }
    }

    fn header_view(&self) -> &ZoneHeader {
        unsafe { self.header.as_ref() }
    }

    fn raw(&self) -> *mut ZoneHeader {
        self.header.as_ptr()
    }

    pub fn addr(&self) -> usize {
        self.header.as_ptr() as usize
    }

    /// Size of the whole mapping.
    pub fn size(&self) -> usize {
        self.header_view().size
    }

    /// The free byte count the zone search goes by.
    ///
    /// This is only an estimate: it drops when a chunk is bump-allocated and
    /// rises on every free, whether or not the freed bytes could hold the
    /// next request. A zone may claim room it cannot deliver in one piece.
    pub fn free_space(&self) -> usize {
        self.header_view().free_space
    }

    pub fn first(&self) -> Option<Chunk> {
        self.header_view().first
    }

    pub fn next(&self) -> Option<Zone> {
        self.header_view().next
    }

    fn set_next(&self, next: Option<Zone>) {
        unsafe { (*self.raw()).next = next }
    }

    fn set_free_space(&self, free_space: usize) {
        unsafe { (*self.raw()).free_space = free_space }
    }

    /// Where chunks start.
    fn data(&self) -> *mut u8 {
        unsafe { (self.raw() as *mut u8).add(ZONE_HEADER_SIZE) }
    }

    /// The address range chunks may occupy.
    pub fn area(&self) -> Range<usize> {
        self.data() as usize..self.addr() + self.size()
    }

    /// Whether `addr` could be a payload pointer from this zone. The end is
    /// included: a zero-sized payload may sit right at it.
    pub fn contains(&self, addr: usize) -> bool {
        let area = self.area();
        addr >= area.start && addr <= area.end
    }

    pub fn chunks(&self) -> ChunkIter {
        ChunkIter::new(self.first())
    }

    /// Hand out a live chunk of at least `size` bytes from this zone.
    ///
    /// The first free chunk that fits is reused (and split if it is much
    /// bigger). Failing that, a new chunk is placed after the last one, as
    /// long as it fits inside the mapping.
    pub fn take_chunk(&self, size: usize) -> Option<Chunk> {
        match first_fit(self.first(), size) {
            Search::Found(chunk) => {
                chunk.split(size);
                chunk.mark_live();
                Some(chunk)
            }
            Search::Exhausted { last } => self.bump(last, size),
        }
    }

    fn bump(&self, last: Option<Chunk>, size: usize) -> Option<Chunk> {
        let at = match last {
            None => self.data(),
            Some(last) => unsafe { last.payload().as_ptr().add(last.size()) },
        };
        let end = (at as usize).checked_add(HEADER_SIZE)?.checked_add(size)?;
        if end > self.area().end {
            return None;
        }

        let chunk = unsafe {
            Chunk::write(
                NonNull::new_unchecked(at),
                size,
                last,
                None,
                ChunkState::Live,
            )
        };
        match last {
            Some(last) => last.set_next(Some(chunk)),
            None => unsafe { (*self.raw()).first = Some(chunk) },
        }
        self.set_free_space(self.free_space().saturating_sub(size + HEADER_SIZE));
        Some(chunk)
    }

    /// Account for `chunk` having been freed.
    pub fn release(&self, chunk: Chunk) {
        self.set_free_space(self.free_space() + chunk.size() + HEADER_SIZE);
    }
}

pub struct ZoneIter {
    next: Option<Zone>,
}

impl Iterator for ZoneIter {
    type Item = Zone;

    fn next(&mut self) -> Option<Zone> {
        let zone = self.next.take()?;
        self.next = zone.next();
        Some(zone)
    }
}

/// The zones of one size class, in creation order.
#[derive(Default)]
pub struct ZoneList {
    first: Option<Zone>,
}

impl ZoneList {
    pub const fn new() -> Self {
        ZoneList { first: None }
    }

    pub fn first(&self) -> Option<Zone> {
        self.first
    }

    pub fn iter(&self) -> ZoneIter {
        ZoneIter { next: self.first }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn push_back(&mut self, zone: Zone) {
        zone.set_next(None);
        match self.iter().last() {
            None => self.first = Some(zone),
            Some(last) => last.set_next(Some(zone)),
        }
    }

    /// The zone whose chunk area contains `addr`.
    pub fn locate(&self, addr: usize) -> Option<Zone> {
        self.iter().find(|z| z.contains(addr))
    }

    /// Zones whose free-space estimate admits a chunk of `size` bytes.
    pub fn candidates(&self, size: usize) -> impl Iterator<Item = Zone> {
        let needed = size.saturating_add(HEADER_SIZE);
        self.iter().filter(move |z| z.free_space() >= needed)
    }
}

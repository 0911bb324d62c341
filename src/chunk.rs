use core::ops::Range;
use core::ptr::{self, NonNull};

use log::trace;
use static_assertions::const_assert;

use crate::ALIGN;

/// Whether a chunk's payload currently belongs to a caller.
///
/// Neither discriminant is zero, so freshly mapped (zeroed) memory never
/// reads as a valid state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkState {
    Live = 0x4c,
    Free = 0x46,
}

impl ChunkState {
    pub fn from_byte(byte: u8) -> Option<ChunkState> {
        match byte {
            0x4c => Some(ChunkState::Live),
            0x46 => Some(ChunkState::Free),
            _ => None,
        }
    }
}

/// The header in front of every payload.
///
/// `next` and `prev` link the chunks of a zone in address order. For large
/// chunks they link the (non-adjacent) dedicated mappings instead.
#[repr(C, align(16))]
pub struct ChunkHeader {
    size: usize,
    next: Option<Chunk>,
    prev: Option<Chunk>,
    canary: usize,
    state: ChunkState,
}

/// Bytes taken by a header. Payloads start this far past their header.
pub const HEADER_SIZE: usize = core::mem::size_of::<ChunkHeader>();
const_assert!(HEADER_SIZE % ALIGN == 0);

// The canary is the payload address shifted up a byte. It only has to be
// reproducible from the address; it is a plausibility check, not a secret.
const fn seal(addr: usize) -> usize {
    addr << 8
}

const fn unseal(canary: usize) -> usize {
    canary >> 8
}

/// A handle to a chunk header living in mapped memory.
///
/// Invariant: `header` points at an initialized `ChunkHeader` inside memory
/// the allocator owns. All constructors are unsafe for that reason; once a
/// handle exists, reading through it is safe.
///
/// Unlike a `Box`, this is `Copy`: chunk lists are doubly linked, so several
/// handles to the same header exist at once. Mutation goes through raw
/// pointer writes and never hands out references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    header: NonNull<ChunkHeader>,
}

impl Chunk {
    /// Write a fresh header at `at`, with its canary sealed.
    ///
    /// # Safety
    ///
    /// `at` must be aligned to `ALIGN` and point to at least
    /// `HEADER_SIZE + size` bytes the allocator owns and nothing else uses.
    pub unsafe fn write(
        at: NonNull<u8>,
        size: usize,
        prev: Option<Chunk>,
        next: Option<Chunk>,
        state: ChunkState,
    ) -> Chunk {
        let header: NonNull<ChunkHeader> = at.cast();
        let payload = at.as_ptr().add(HEADER_SIZE) as usize;
        ptr::write(
            header.as_ptr(),
            ChunkHeader {
                size,
                next,
                prev,
                canary: seal(payload),
                state,
            },
        );
        Chunk { header }
    }

    /// Recover the chunk owning `payload`, trusting the caller completely.
    ///
    /// # Safety
    ///
    /// `payload` must be a payload pointer previously produced by this
    /// allocator whose chunk is still tracked.
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Chunk {
        let header = payload.as_ptr().sub(HEADER_SIZE) as *mut ChunkHeader;
        Chunk {
            header: NonNull::new_unchecked(header),
        }
    }

    /// Check whether the header in front of `payload` looks like one of ours.
    ///
    /// The canary has to match the payload address and the state byte has to
    /// decode. A self-consistent forgery still passes.
    ///
    /// # Safety
    ///
    /// The `HEADER_SIZE` bytes before `payload` must be readable.
    pub unsafe fn probe(payload: NonNull<u8>) -> Option<Chunk> {
        let header = payload.as_ptr().sub(HEADER_SIZE) as *const ChunkHeader;
        let canary = ptr::addr_of!((*header).canary).read();
        if unseal(canary) != unseal(seal(payload.as_ptr() as usize)) {
            return None;
        }
        // Read the raw byte: an arbitrary byte is not a valid `ChunkState`.
        let state = ptr::addr_of!((*header).state).cast::<u8>().read();
        ChunkState::from_byte(state)?;
        Some(Chunk {
            header: NonNull::new_unchecked(header as *mut ChunkHeader),
        })
    }

    fn header_view(&self) -> &ChunkHeader {
        unsafe { self.header.as_ref() }
    }

    fn raw(&self) -> *mut ChunkHeader {
        self.header.as_ptr()
    }

    /// The address of the header, which is where the chunk starts.
    pub fn addr(&self) -> usize {
        self.header.as_ptr() as usize
    }

    pub fn header_ptr(&self) -> NonNull<u8> {
        self.header.cast()
    }

    pub fn payload(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.header.as_ptr() as *mut u8).add(HEADER_SIZE)) }
    }

    /// The payload's address range.
    pub fn as_range(&self) -> Range<*const u8> {
        let start = self.payload().as_ptr() as *const u8;
        start..start.wrapping_add(self.size())
    }

    /// One past the last payload byte; where a contiguous successor starts.
    pub fn end(&self) -> usize {
        self.addr() + HEADER_SIZE + self.size()
    }

    /// The payload size, in bytes.
    pub fn size(&self) -> usize {
        self.header_view().size
    }

    pub fn state(&self) -> ChunkState {
        self.header_view().state
    }

    pub fn is_free(&self) -> bool {
        self.state() == ChunkState::Free
    }

    pub fn next(&self) -> Option<Chunk> {
        self.header_view().next
    }

    pub fn prev(&self) -> Option<Chunk> {
        self.header_view().prev
    }

    /// Whether the stored canary still matches the payload address.
    pub fn canary_intact(&self) -> bool {
        unseal(self.header_view().canary) == unseal(seal(self.payload().as_ptr() as usize))
    }

    fn set_size(&self, size: usize) {
        unsafe { (*self.raw()).size = size }
    }

    pub(crate) fn set_next(&self, next: Option<Chunk>) {
        unsafe { (*self.raw()).next = next }
    }

    pub(crate) fn set_prev(&self, prev: Option<Chunk>) {
        unsafe { (*self.raw()).prev = prev }
    }

    /// Hand the chunk (back) to a caller, resealing its canary.
    pub fn mark_live(&self) {
        unsafe {
            (*self.raw()).canary = seal(self.payload().as_ptr() as usize);
            (*self.raw()).state = ChunkState::Live;
        }
    }

    pub fn mark_free(&self) {
        unsafe { (*self.raw()).state = ChunkState::Free }
    }

    /// Shrink this chunk to `size` bytes and turn the rest of its payload
    /// into a new free chunk right behind it.
    ///
    /// Nothing happens unless the leftover can hold a header plus `ALIGN`
    /// bytes. The new chunk is merged with its successor if that is free, so
    /// the list never holds two adjacent free chunks. Returns the free chunk
    /// now following this one, if a split happened.
    pub fn split(&self, size: usize) -> Option<Chunk> {
        let self_size = self.size();
        let needed = size.checked_add(HEADER_SIZE + ALIGN)?;
        if self_size < needed {
            return None;
        }

        let rest = unsafe {
            let at = NonNull::new_unchecked(self.payload().as_ptr().add(size));
            Chunk::write(
                at,
                self_size - size - HEADER_SIZE,
                Some(*self),
                self.next(),
                ChunkState::Free,
            )
        };
        if let Some(next) = self.next() {
            next.set_prev(Some(rest));
        }
        self.set_next(Some(rest));
        self.set_size(size);
        trace!(
            "Split {:#x}:{} into {} + {} at {:#x}",
            self.addr(),
            self_size,
            size,
            rest.size(),
            rest.addr()
        );

        rest.merge_next();
        Some(rest)
    }

    // Absorb the successor, header and all, whatever its state.
    fn absorb_next(&self, next: Chunk) {
        debug_assert_eq!(self.end(), next.addr(), "only neighbours can merge");
        self.set_size(self.size() + HEADER_SIZE + next.size());
        let after = next.next();
        self.set_next(after);
        if let Some(after) = after {
            after.set_prev(Some(*self));
        }
    }

    /// Merge the following chunk into this one if it is free.
    ///
    /// Returns true if a merge happened.
    pub fn merge_next(&self) -> bool {
        match self.next() {
            Some(next) if next.is_free() => {
                trace!("Merging {:#x} into {:#x}", next.addr(), self.addr());
                self.absorb_next(next);
                true
            }
            _ => false,
        }
    }

    /// Merge this chunk into the preceding one if that is free.
    ///
    /// Returns whichever chunk now covers this one's memory.
    pub fn merge_prev(self) -> Chunk {
        match self.prev() {
            Some(prev) if prev.is_free() => {
                trace!("Merging {:#x} into {:#x}", self.addr(), prev.addr());
                prev.absorb_next(self);
                prev
            }
            _ => self,
        }
    }

    /// Merge with free neighbours on both sides.
    pub fn coalesce(self) -> Chunk {
        self.merge_next();
        self.merge_prev()
    }

    /// Compare the spans (header and payload) of two chunks.
    fn relation(&self, other: &Self) -> Relation {
        let (self_start, self_end) = (self.addr(), self.end());
        let (other_start, other_end) = (other.addr(), other.end());

        if self_end < other_start {
            Relation::Before
        } else if self_end == other_start {
            Relation::AdjacentBefore
        } else if self_start < other_end {
            Relation::Overlapping
        } else if self_start == other_end {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }
}

/// An enum for easy comparison of chunks and their order
enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

/// Walks a chunk list from a given first chunk.
pub struct ChunkIter {
    next: Option<Chunk>,
}

impl ChunkIter {
    pub fn new(first: Option<Chunk>) -> Self {
        ChunkIter { next: first }
    }
}

impl Iterator for ChunkIter {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let chunk = self.next.take()?;
        self.next = chunk.next();
        Some(chunk)
    }
}

/// The outcome of a first-fit scan.
pub enum Search {
    /// A free chunk with room for the request.
    Found(Chunk),
    /// Nothing fits. `last` is the final chunk of the list, if any.
    Exhausted { last: Option<Chunk> },
}

/// Find the first free chunk with at least `size` bytes of payload.
pub fn first_fit(first: Option<Chunk>, size: usize) -> Search {
    let mut last = None;
    for chunk in ChunkIter::new(first) {
        if chunk.is_free() && chunk.size() >= size {
            return Search::Found(chunk);
        }
        last = Some(chunk);
    }
    Search::Exhausted { last }
}

/// The dedicated large mappings, in creation order.
///
/// Large chunks are not adjacent to one another, so nothing in this list is
/// ever split or merged.
#[derive(Default)]
pub struct ChunkList {
    first: Option<Chunk>,
}

impl ChunkList {
    pub const fn new() -> Self {
        ChunkList { first: None }
    }

    pub fn first(&self) -> Option<Chunk> {
        self.first
    }

    pub fn iter(&self) -> ChunkIter {
        ChunkIter::new(self.first)
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Append `chunk` at the end of the list.
    pub fn push_back(&mut self, chunk: Chunk) {
        chunk.set_next(None);
        match self.iter().last() {
            None => {
                chunk.set_prev(None);
                self.first = Some(chunk);
            }
            Some(last) => {
                chunk.set_prev(Some(last));
                last.set_next(Some(chunk));
            }
        }
    }

    /// Find the chunk whose payload starts exactly at `payload`.
    pub fn find(&self, payload: NonNull<u8>) -> Option<Chunk> {
        self.iter().find(|c| c.payload() == payload)
    }

    /// Take `chunk` out of the list. It must currently be in it.
    pub fn unlink(&mut self, chunk: Chunk) {
        let (prev, next) = (chunk.prev(), chunk.next());
        match prev {
            Some(prev) => prev.set_next(next),
            None => {
                debug_assert_eq!(self.first, Some(chunk));
                self.first = next;
            }
        }
        if let Some(next) = next {
            next.set_prev(prev);
        }
        chunk.set_next(None);
        chunk.set_prev(None);
    }
}

/// Validity contains a count of every inconsistency found in chunk lists.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Chunks overlapping the one before them. This indicates corruption.
    pub overlaps: usize,
    /// Chunks at a lower address than the one before them.
    pub out_of_orders: usize,
    /// Zone chunks that do not start exactly where the previous one ended.
    pub gaps: usize,
    /// Pairs of neighbouring free chunks that were never merged.
    pub unmerged: usize,
    /// Chunks whose `prev` does not point back at the chunk before them.
    pub broken_links: usize,
    /// Chunks extending past the end of their zone.
    pub overruns: usize,
    /// Chunks whose canary no longer matches their address.
    pub bad_canaries: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        *self == Validity::default()
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Tiny and small zones mapped so far.
    pub zones: usize,
    /// Chunks across all zones.
    pub chunks: usize,
    pub live_chunks: usize,
    pub live_bytes: usize,
    pub free_chunks: usize,
    pub free_bytes: usize,
    /// Dedicated large mappings currently alive.
    pub large_chunks: usize,
    pub large_bytes: usize,
}

/// Check the chunks of one zone, whose chunk area is `area`.
pub fn check_zone(first: Option<Chunk>, area: Range<usize>, validity: &mut Validity, stats: &mut Stats) {
    if let Some(first) = first {
        if first.addr() != area.start {
            validity.gaps += 1;
        }
    }

    let mut previous: Option<Chunk> = None;
    for chunk in ChunkIter::new(first) {
        if chunk.prev() != previous {
            validity.broken_links += 1;
        }
        if !chunk.canary_intact() {
            validity.bad_canaries += 1;
        }
        if chunk.end() > area.end {
            validity.overruns += 1;
        }

        if let Some(prev) = previous {
            match prev.relation(&chunk) {
                Relation::AdjacentBefore => {
                    if prev.is_free() && chunk.is_free() {
                        validity.unmerged += 1;
                    }
                }
                Relation::Before => validity.gaps += 1,
                Relation::Overlapping => validity.overlaps += 1,
                Relation::AdjacentAfter | Relation::After => validity.out_of_orders += 1,
            }
        }

        stats.chunks += 1;
        if chunk.is_free() {
            stats.free_chunks += 1;
            stats.free_bytes += chunk.size();
        } else {
            stats.live_chunks += 1;
            stats.live_bytes += chunk.size();
        }

        previous = Some(chunk);
    }
}

/// Check the large list: links, canaries and liveness.
pub fn check_large(list: &ChunkList, validity: &mut Validity, stats: &mut Stats) {
    let mut previous: Option<Chunk> = None;
    for chunk in list.iter() {
        if chunk.prev() != previous {
            validity.broken_links += 1;
        }
        if !chunk.canary_intact() {
            validity.bad_canaries += 1;
        }
        if let Some(prev) = previous {
            if let Relation::Overlapping = prev.relation(&chunk) {
                validity.overlaps += 1;
            }
        }
        stats.large_chunks += 1;
        stats.large_bytes += chunk.size();
        previous = Some(chunk);
    }
}

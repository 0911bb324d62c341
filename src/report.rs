//! Human-readable memory maps.

use core::fmt::{self, Write};

use crate::allocators::RawAlloc;
use crate::chunk::{Chunk, ChunkIter};
use crate::pages::PageSource;
use crate::SizeClass;

const RULE: &str = "--------------------";

fn write_chunks<W: Write>(out: &mut W, chunks: ChunkIter, total: &mut usize) -> fmt::Result {
    for chunk in chunks {
        write_chunk(out, chunk)?;
        if !chunk.is_free() {
            *total += chunk.size();
        }
    }
    Ok(())
}

fn write_chunk<W: Write>(out: &mut W, chunk: Chunk) -> fmt::Result {
    let range = chunk.as_range();
    write!(out, "{:p} - {:p} : {} bytes", range.start, range.end, chunk.size())?;
    if chunk.is_free() {
        write!(out, " *FREE*")?;
    }
    writeln!(out)
}

/// Write every zone of every class, then the large mappings, one chunk per
/// line, followed by the number of bytes currently handed out.
pub fn write_report<P: PageSource, W: Write>(alloc: &RawAlloc<P>, out: &mut W) -> fmt::Result {
    let mut total = 0;
    writeln!(out, "{}", RULE)?;
    for class in [SizeClass::Tiny, SizeClass::Small] {
        let zones = match alloc.zones(class) {
            Some(zones) => zones,
            None => continue,
        };
        for zone in zones.iter() {
            writeln!(out, "{} : {:#x}", class.label(), zone.area().start)?;
            write_chunks(out, zone.chunks(), &mut total)?;
        }
    }
    if let Some(first) = alloc.large().first() {
        writeln!(out, "{} : {:#x}", SizeClass::Large.label(), first.addr())?;
        write_chunks(out, alloc.large().iter(), &mut total)?;
    }
    writeln!(out, "Total : {} bytes", total)?;
    writeln!(out, "{}", RULE)
}

/// A `fmt::Write` sink over a raw file descriptor, for reporting without
/// allocating.
pub struct FdWriter {
    fd: i32,
}

impl FdWriter {
    pub const fn new(fd: i32) -> Self {
        FdWriter { fd }
    }

    pub const fn stdout() -> Self {
        FdWriter::new(1)
    }

    pub const fn stderr() -> Self {
        FdWriter::new(2)
    }
}

#[cfg(feature = "use_libc")]
fn write_fd(fd: i32, buf: &[u8]) -> Option<usize> {
    let written = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if written < 0 {
        None
    } else {
        Some(written as usize)
    }
}

#[cfg(not(feature = "use_libc"))]
fn write_fd(fd: i32, buf: &[u8]) -> Option<usize> {
    crate::unix::write(fd as usize, buf).ok()
}

impl Write for FdWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut buf = s.as_bytes();
        while !buf.is_empty() {
            match write_fd(self.fd, buf) {
                Some(0) | None => return Err(fmt::Error),
                Some(written) => buf = &buf[written..],
            }
        }
        Ok(())
    }
}

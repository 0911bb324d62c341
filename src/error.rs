use core::fmt;

/// Everything that can go wrong in a call to the allocator.
///
/// None of these are fatal: the allocator state is left consistent, and the
/// caller decides how loudly to complain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The page source could not provide `size` more bytes.
    MapFailed { size: usize },
    /// The address was not handed out by this allocator, or its header does
    /// not pass the canary check.
    InvalidPointer { addr: usize },
    /// The address belongs to a chunk that is already free.
    DoubleFree { addr: usize },
    /// A large mapping could not be returned to the OS. The allocator has
    /// already forgotten about it.
    UnmapFailed { addr: usize, size: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::MapFailed { size } => write!(f, "mmap(): failed to map {} bytes", size),
            Error::InvalidPointer { addr } => write!(f, "invalid pointer {:#x}", addr),
            Error::DoubleFree { addr } => write!(f, "double free detected at {:#x}", addr),
            Error::UnmapFailed { addr, size } => {
                write!(f, "munmap(): failed to unmap {} bytes at {:#x}", size, addr)
            }
        }
    }
}

/// Kernel error codes.
///
/// The cache layer reports failures as a small errno-style set. Errors are
/// local where possible (a failed victim flush retries a different victim,
/// an empty free list sleeps for the reclaimer); everything else propagates
/// to the syscall layer, which turns it into a negative return value via
/// `code()`.
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// Device callback failed.
    Io,
    /// No driver registered for the device.
    NxIo,
    /// Page-sized allocation failed.
    NoMem,
    /// Operation not supported (e.g. the filesystem has no write callback).
    Inval,
    /// Block allocation failed on the writing bmap path.
    NoSpc,
    /// Device refused a write.
    Rofs,
}

impl Errno {
    /// The negative errno value seen by the syscall layer.
    pub const fn code(self) -> i32 {
        match self {
            Errno::Io => -5,
            Errno::NxIo => -6,
            Errno::NoMem => -12,
            Errno::Inval => -22,
            Errno::NoSpc => -28,
            Errno::Rofs => -30,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Errno::Io => write!(f, "I/O error"),
            Errno::NxIo => write!(f, "no such device"),
            Errno::NoMem => write!(f, "out of memory"),
            Errno::Inval => write!(f, "invalid argument"),
            Errno::NoSpc => write!(f, "no space left on device"),
            Errno::Rofs => write!(f, "device is write-protected"),
        }
    }
}

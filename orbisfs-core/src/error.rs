//! The error taxonomy callers of the core distinguish on.
//!
//! Kept as a plain enum with manual `Display`/`Error` impls, following the
//! teacher crates' habit of propagating `io::Result`/`io::Error` rather than
//! reaching for an error-derive crate.

use std::fmt;
use std::io;

/// Errors raised while decoding or walking an image.
#[derive(Debug)]
pub enum FsError {
    /// An on-disk invariant was violated: bad magic, non-zero padding that
    /// isn't, a chain link pointing out of bounds, and so on.
    BadFormat(String),
    /// A path segment resolved to no matching directory entry.
    FileNotFound,
    /// A directory entry's target inode slot no longer holds a valid inode.
    /// Distinguished from `BadFormat` because directory enumeration treats
    /// this one as a "vanished entry" and silently skips it.
    InodeBadMagic { inode: u32 },
    /// The operation is part of the write path, or otherwise not
    /// implemented: `allocateBlock`, `grow`, `pwrite`, symlink traversal,
    /// 4+-level FAT.
    NotImplemented(&'static str),
    /// A block's free bit was already set when `free_block` was asked to
    /// set it again.
    DoubleFree { block: u32 },
    /// `open`/`mmap`/ioctl failure.
    Io(io::Error),
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::BadFormat(msg) => write!(f, "bad format: {msg}"),
            FsError::FileNotFound => write!(f, "no such file or directory"),
            FsError::InodeBadMagic { inode } => {
                write!(f, "inode {inode} has a bad magic (vanished entry)")
            }
            FsError::NotImplemented(what) => write!(f, "not implemented: {what}"),
            FsError::DoubleFree { block } => write!(f, "double free of block {block}"),
            FsError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for FsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FsError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        FsError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Shorthand used all over the decoder: build a `BadFormat` error with a
/// formatted message, the way the original's `retassure`/`reterror` macros
/// built a formatted exception at the call site.
macro_rules! bad_format {
    ($($arg:tt)*) => {
        $crate::error::FsError::BadFormat(format!($($arg)*))
    };
}
pub(crate) use bad_format;

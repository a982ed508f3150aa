//! Read-only access to OrbisFS disk images: an mmap-backed superblock,
//! block allocator, inode directory and per-file chain-link walker.
//!
//! The write path (allocating new blocks, growing a file, creating
//! directory entries) is out of scope — every operation that would need
//! it fails with [`error::FsError::NotImplemented`]. Shrinking an
//! existing file is supported, since it only ever frees blocks.

pub mod allocator;
pub mod error;
pub mod file;
pub mod format;
pub mod image;
pub mod inode_dir;

#[cfg(test)]
mod testimage;

pub use error::{FsError, Result};
pub use file::File;
pub use image::Image;
pub use inode_dir::DirEntry;

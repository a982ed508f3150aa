//! Disk/block-device sizing, shared by anything that needs to know how many
//! bytes back a path before mapping it.

use libc::ioctl;
use std::ffi::c_long;
use std::fs;
use std::io;
use std::io::Error;
use std::os::fd::RawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// ioctl macro: Command.
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
    };
}

/// ioctl macro: Read command.
macro_rules! ior {
    ($a:expr, $b:expr, $c:ty) => {
        ioc!(2, $a, $b, std::mem::size_of::<$c>() as c_long)
    };
}

/// ioctl command: Get size of block device in bytes.
const BLKGETSIZE64: c_long = ior!(0x12, 114, u64);

/// Returns the size, in bytes, of whatever `path` refers to: the `stat`-
/// reported length for a regular file, or the `BLKGETSIZE64` ioctl result
/// for a block device. `fd` must already be open on `path`.
///
/// Mirrors `OrbisFSImage::OrbisFSImage`'s own `S_ISBLK(st.st_mode)` branch,
/// minus the macOS-only `DKIOCGETBLOCKCOUNT`/`DKIOCGETBLOCKSIZE` pair this
/// ioctl already provides by itself on Linux.
pub fn backing_store_size(path: &Path, fd: RawFd) -> io::Result<u64> {
    let metadata = fs::metadata(path)?;
    let file_type = metadata.file_type();

    if file_type.is_block_device() {
        let mut size: u64 = 0;
        let ret = unsafe { ioctl(fd, BLKGETSIZE64 as _, &mut size) };
        if ret < 0 {
            return Err(Error::last_os_error());
        }
        Ok(size)
    } else {
        Ok(metadata.len())
    }
}

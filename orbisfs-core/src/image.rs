//! The mapped image: owns the mmap, the allocator, and the inode
//! directory, and arbitrates how long all three stay alive.
//!
//! `File` handles returned across the public API hold a non-owning
//! pointer back into this `Image` rather than an `Arc`, mirroring the
//! original's raw `_parent` pointers (marked `//not owned` in the source
//! this was distilled from) — the alternative, `Image` holding `Arc`s to
//! components that themselves hold `Arc<Image>`, is a reference cycle.
//! Lifetime safety instead comes from the open-handle counter: `Image`'s
//! destructor blocks on a condition variable until every outstanding
//! `File` has dropped and decremented it, exactly like
//! `OrbisFSImage::~OrbisFSImage`'s wait on `_unrefEvent`.

use crate::allocator::BlockAllocator;
use crate::error::{bad_format, FsError, Result};
use crate::file::File;
use crate::format::{
    inode_id, DISKINFO_MAGIC, SUPERBLOCK_MAGIC, BLOCK_SIZE,
};
use crate::inode_dir::{DirEntry, InodeDirectory};
use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::rc::Rc;
use std::sync::{Condvar, Mutex};

#[derive(Debug)]
pub struct Image {
    fd: libc::c_int,
    map: *mut u8,
    map_len: usize,
    writeable: bool,
    references: Mutex<u32>,
    unref_event: Condvar,
    allocator: BlockAllocator,
    inode_dir: InodeDirectory,
}

unsafe impl Send for Image {}
unsafe impl Sync for Image {}

impl Image {
    /// Opens and validates an image, mapping `path` (or the `offset`
    /// onward, for a partition embedded inside a larger file or device)
    /// read-only unless `writeable` is set.
    pub fn open(path: &Path, writeable: bool, offset: u64) -> Result<Box<Image>> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| bad_format!("path contains an embedded NUL"))?;
        let oflag = if writeable { libc::O_RDWR } else { libc::O_RDONLY };
        let fd = unsafe { libc::open(cpath.as_ptr(), oflag) };
        if fd < 0 {
            return Err(FsError::Io(io::Error::last_os_error()));
        }

        let size = match utils::disk::backing_store_size(path, fd) {
            Ok(s) => s,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(FsError::Io(e));
            }
        };
        if offset >= size {
            unsafe { libc::close(fd) };
            return Err(bad_format!("offset {offset} is beyond the {size}-byte backing store"));
        }

        let map_len = (size - offset) as usize;
        let prot = libc::PROT_READ | if writeable { libc::PROT_WRITE } else { 0 };
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                prot,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if map == libc::MAP_FAILED {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(FsError::Io(e));
        }

        let mut boxed = Box::new(Image {
            fd,
            map: map as *mut u8,
            map_len,
            writeable,
            references: Mutex::new(0),
            unref_event: Condvar::new(),
            allocator: BlockAllocator::new(0),
            inode_dir: InodeDirectory::new(0),
        });

        let img_ptr: *const Image = &*boxed;
        unsafe {
            boxed.allocator.bind(img_ptr);
            boxed.inode_dir.bind(img_ptr);
        }

        boxed.init()?;
        Ok(boxed)
    }

    fn init(&mut self) -> Result<()> {
        let sb = {
            let block0 = self.get_block(0)?;
            let sb = unsafe {
                std::ptr::read_unaligned(block0.as_ptr() as *const crate::format::Superblock)
            };
            if sb.magic != SUPERBLOCK_MAGIC {
                return Err(bad_format!("superblock magic mismatch: {:#x}", { sb.magic }));
            }
            let tail = &block0[size_of::<crate::format::Superblock>()..];
            if tail.iter().any(|&b| b != 0) {
                return Err(bad_format!("bytes past the superblock are not zero"));
            }
            sb
        };

        let di = {
            let diskinfo_block = self.get_block(sb.diskinfo_lnk.blk())?;
            let di = unsafe {
                std::ptr::read_unaligned(diskinfo_block.as_ptr() as *const crate::format::Diskinfo)
            };
            if di.magic != DISKINFO_MAGIC {
                return Err(bad_format!("diskinfo magic mismatch: {:#x}", { di.magic }));
            }
            let (di_lnk, sb_lnk) = (di.diskinfo_lnk, sb.diskinfo_lnk);
            if di_lnk != sb_lnk {
                return Err(bad_format!("diskinfo's diskinfoLnk does not match the superblock's"));
            }
            di
        };

        self.allocator.set_info_block(sb.allocator_info_lnk.blk());
        self.inode_dir.set_first_block(di.inodedir_lnk.blk());
        self.inode_dir.validate_reserved_slots()?;
        Ok(())
    }

    pub fn is_writeable(&self) -> bool {
        self.writeable
    }

    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    pub fn inode_dir(&self) -> &InodeDirectory {
        &self.inode_dir
    }

    /// Borrows block `blk`'s bytes directly out of the mapping.
    pub fn get_block(&self, blk: u32) -> Result<&[u8]> {
        let start = blk as usize * BLOCK_SIZE;
        if start + BLOCK_SIZE > self.map_len {
            return Err(bad_format!("block {blk} lies outside the {}-byte image", self.map_len));
        }
        Ok(unsafe { std::slice::from_raw_parts(self.map.add(start), BLOCK_SIZE) })
    }

    /// Same as `get_block`, but mutable. Fails on a read-only image: the
    /// mapping was never granted `PROT_WRITE`.
    pub fn get_block_mut(&self, blk: u32) -> Result<&mut [u8]> {
        if !self.writeable {
            return Err(FsError::NotImplemented("write to a read-only image"));
        }
        let start = blk as usize * BLOCK_SIZE;
        if start + BLOCK_SIZE > self.map_len {
            return Err(bad_format!("block {blk} lies outside the {}-byte image", self.map_len));
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.map.add(start), BLOCK_SIZE) })
    }

    pub(crate) fn bump_refs(&self, delta: i32) {
        let mut refs = self.references.lock().unwrap();
        *refs = (*refs as i32 + delta).max(0) as u32;
        if *refs == 0 {
            self.unref_event.notify_all();
        }
    }

    /// The number of `File` handles a caller currently holds open.
    pub fn open_handle_count(&self) -> u32 {
        *self.references.lock().unwrap()
    }

    pub fn get_inode_for_id(&self, id: u32) -> Result<Rc<File>> {
        let raw = self.inode_dir.get_raw_inode(id)?;
        if raw.magic != crate::format::INODE_MAGIC {
            return Err(FsError::InodeBadMagic { inode: id });
        }
        crate::inode_dir::InodeDirectory::check_reserved_fields(id, &raw)?;
        let img_ptr: *const Image = self;
        Ok(Rc::new(File::new_external(img_ptr, id, raw)))
    }

    pub fn get_inode_for_path(&self, path: &str) -> Result<Rc<File>> {
        let id = self.inode_dir.find_inode_id_for_path(path)?;
        self.get_inode_for_id(id)
    }

    pub fn open_file_id(&self, id: u32) -> Result<Rc<File>> {
        let f = self.get_inode_for_id(id)?;
        if f.is_dir() {
            return Err(bad_format!("inode {id} is a directory, not a file"));
        }
        Ok(f)
    }

    pub fn open_file_at_path(&self, path: &str) -> Result<Rc<File>> {
        let f = self.get_inode_for_path(path)?;
        if f.is_dir() {
            return Err(bad_format!("{path} is a directory, not a file"));
        }
        Ok(f)
    }

    pub fn list_files_in_folder(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = self.inode_dir.find_inode_for_path(path)?;
        if !dir.is_dir() {
            return Err(bad_format!("{path} is not a directory"));
        }
        self.inode_dir.list_files_in_dir(&dir)
    }

    /// Walks a folder's tree in alphabetical pre-order, invoking `visit`
    /// with each entry's full path and its `DirEntry`. Mirrors
    /// `iterateOverFilesInFolder`'s explicit stack (rather than native
    /// recursion) so deep trees don't blow the call stack.
    pub fn iterate_over_files_in_folder(
        &self,
        root_path: &str,
        mut visit: impl FnMut(&str, &DirEntry) -> Result<()>,
    ) -> Result<()> {
        let mut stack: Vec<String> = vec![root_path.trim_end_matches('/').to_string()];
        while let Some(dir_path) = stack.pop() {
            let mut entries = self.list_files_in_folder(&dir_path)?;
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            for entry in entries.into_iter().rev() {
                let full = if dir_path.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{dir_path}/{}", entry.name)
                };
                visit(&full, &entry)?;
                if entry.entry_type == crate::format::DIRECTORY_TYPE_DIR {
                    stack.push(full);
                }
            }
        }
        Ok(())
    }

    /// Returns the root folder's inode number, the entry point every path
    /// lookup starts from.
    pub fn root_inode(&self) -> u32 {
        inode_id::ROOT_FOLDER
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let refs = self.references.lock().unwrap();
        let _refs = self.unref_event.wait_while(refs, |r| *r > 0).unwrap();
        unsafe {
            libc::munmap(self.map as *mut libc::c_void, self.map_len);
            libc::close(self.fd);
        }
    }
}

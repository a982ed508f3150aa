//! Inode lookup and directory walking.
//!
//! The inode table is itself addressed like a file: its first block is
//! named directly by the diskinfo block, and inode records past that
//! block's capacity are read through inode 3's own chain links — so the
//! inode table is a `File` over inode 3 that bootstraps itself from its
//! own first block. This mirrors `OrbisFSInodeDirectory`'s lazy self
//! reference described in the design notes.

use crate::error::{bad_format, FsError, Result};
use crate::file::File;
use crate::format::{self, inode_id, RawInode, BLOCK_SIZE};
use crate::image::Image;
use std::mem::size_of;
use std::sync::OnceLock;

#[derive(Debug)]
pub struct InodeDirectory {
    image: *const Image,
    first_block: u32,
    self_file: OnceLock<File>,
}

unsafe impl Send for InodeDirectory {}
unsafe impl Sync for InodeDirectory {}

/// One entry read out of a directory's contents.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inode_num: u32,
    pub name: String,
    pub entry_type: u16,
}

impl InodeDirectory {
    pub(crate) fn new(first_block: u32) -> Self {
        InodeDirectory {
            image: std::ptr::null(),
            first_block,
            self_file: OnceLock::new(),
        }
    }

    pub(crate) unsafe fn bind(&mut self, image: *const Image) {
        self.image = image;
    }

    pub(crate) fn set_first_block(&mut self, block: u32) {
        self.first_block = block;
    }

    fn image(&self) -> &Image {
        unsafe { &*self.image }
    }

    /// How many inode records fit in the inode table's first block.
    pub fn first_block_capacity() -> usize {
        BLOCK_SIZE / size_of::<RawInode>()
    }

    pub(crate) fn get_raw_inode(&self, id: u32) -> Result<RawInode> {
        let cap = Self::first_block_capacity();
        let raw = if (id as usize) < cap {
            let block = self.image().get_block(self.first_block)?;
            let off = id as usize * size_of::<RawInode>();
            unsafe { std::ptr::read_unaligned(block[off..].as_ptr() as *const RawInode) }
        } else {
            let file = self.self_file()?;
            let off = id as u64 * size_of::<RawInode>() as u64;
            let mut buf = [0u8; size_of::<RawInode>()];
            let n = file.pread(off, &mut buf)?;
            if n < buf.len() {
                return Err(bad_format!("short read of inode {id}'s record"));
            }
            unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const RawInode) }
        };
        Ok(raw)
    }

    /// Checks the invariants a record with a valid magic must also satisfy:
    /// the slot's `inodeNum` must name the slot it's read from, and every
    /// padding window must be zero. Not folded into `get_raw_inode` itself,
    /// since a slot that's simply empty (a vanished directory entry) fails
    /// the magic check first and is handled separately, not as `BadFormat`.
    pub(crate) fn check_reserved_fields(id: u32, raw: &RawInode) -> Result<()> {
        if raw.inode_num != id {
            return Err(bad_format!(
                "inode slot {id} holds a record for inode {}",
                { raw.inode_num }
            ));
        }
        let pad1 = raw._pad1;
        if raw._pad0 != 0 || pad1 != [0u8; 6] || raw._pad2 != 0 || raw._pad3 != 0 || raw._pad4 != 0 || raw._pad5 != 0 {
            return Err(bad_format!("inode {id}'s padding is not zeroed"));
        }
        Ok(())
    }

    /// Writes an inode record back. Only supported for records inside the
    /// inode table's first block — see SPEC_FULL.md's write-path non-goals.
    pub(crate) fn write_raw_inode(&self, id: u32, raw: &RawInode) -> Result<()> {
        let cap = Self::first_block_capacity();
        if (id as usize) >= cap {
            return Err(FsError::NotImplemented(
                "writing inode records beyond the inode table's first block",
            ));
        }
        let block = self.image().get_block_mut(self.first_block)?;
        let off = id as usize * size_of::<RawInode>();
        let bytes = unsafe {
            std::slice::from_raw_parts(raw as *const RawInode as *const u8, size_of::<RawInode>())
        };
        block[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn self_file(&self) -> Result<&File> {
        if let Some(f) = self.self_file.get() {
            return Ok(f);
        }
        // inode_id::INODE_TABLE always sits inside the first block's
        // capacity, so this reads straight out of that block rather than
        // recursing back through `self_file` itself.
        let block = self.image().get_block(self.first_block)?;
        let off = inode_id::INODE_TABLE as usize * size_of::<RawInode>();
        let raw = unsafe { std::ptr::read_unaligned(block[off..].as_ptr() as *const RawInode) };
        if raw.magic != format::INODE_MAGIC {
            return Err(FsError::InodeBadMagic { inode: inode_id::INODE_TABLE });
        }
        Self::check_reserved_fields(inode_id::INODE_TABLE, &raw)?;
        let file = File::new_internal(self.image, inode_id::INODE_TABLE, raw);
        Ok(self.self_file.get_or_init(|| file))
    }

    /// Validates that the two permanently-unused inode slots are all-zero.
    pub(crate) fn validate_reserved_slots(&self) -> Result<()> {
        for id in [inode_id::UNUSED_0, inode_id::UNUSED_1] {
            let block = self.image().get_block(self.first_block)?;
            let off = id as usize * size_of::<RawInode>();
            let slot = &block[off..off + size_of::<RawInode>()];
            if slot.iter().any(|&b| b != 0) {
                return Err(bad_format!("reserved inode slot {id} is not zeroed"));
            }
        }
        Ok(())
    }

    /// Looks up an inode by ID and wraps it as a `File`, failing with
    /// `InodeBadMagic` rather than `BadFormat` — callers walking a
    /// directory treat that one specially as a vanished entry.
    pub fn find_inode(&self, id: u32) -> Result<File> {
        let raw = self.get_raw_inode(id)?;
        if raw.magic != format::INODE_MAGIC {
            return Err(FsError::InodeBadMagic { inode: id });
        }
        Self::check_reserved_fields(id, &raw)?;
        Ok(File::new_internal(self.image, id, raw))
    }

    /// Parses every directory entry out of `dir`'s contents, skipping
    /// entries whose target inode has vanished (bad magic).
    pub fn list_files_in_dir(&self, dir: &File) -> Result<Vec<DirEntry>> {
        let size = dir.filesize();
        let mut buf = vec![0u8; size as usize];
        let n = dir.pread(0, &mut buf)?;
        buf.truncate(n);

        let mut entries = Vec::new();
        let mut off = 0usize;
        while off + format::DIRECTORY_PREFIX_SIZE <= buf.len() {
            let prefix = unsafe {
                std::ptr::read_unaligned(
                    buf[off..].as_ptr() as *const format::DirectoryElemPrefix
                )
            };
            if prefix.inode_num == 0 {
                break;
            }
            let namelen = prefix.namelen as usize;
            let elem_size = prefix.elem_size as usize;
            if format::DIRECTORY_PREFIX_SIZE + namelen > elem_size {
                return Err(bad_format!(
                    "directory entry at offset {off} has namelen {namelen} that doesn't fit its elemSize {elem_size}"
                ));
            }
            if off + elem_size > buf.len() {
                return Err(bad_format!(
                    "directory entry at offset {off} has elemSize {elem_size} running past the end of the directory's contents"
                ));
            }
            let name_start = off + format::DIRECTORY_PREFIX_SIZE;
            let name = String::from_utf8_lossy(&buf[name_start..name_start + namelen]).into_owned();

            match self.find_inode(prefix.inode_num) {
                Ok(_) => entries.push(DirEntry {
                    inode_num: prefix.inode_num,
                    name,
                    entry_type: prefix.entry_type,
                }),
                Err(FsError::InodeBadMagic { .. }) => {
                    // Vanished entry: the directory still names it but the
                    // inode slot no longer holds a valid record. Skip it.
                }
                Err(e) => return Err(e),
            }

            off += elem_size;
        }
        Ok(entries)
    }

    fn find_child(&self, dir: &File, name: &str) -> Result<u32> {
        for entry in self.list_files_in_dir(dir)? {
            if entry.name == name {
                return Ok(entry.inode_num);
            }
        }
        Err(FsError::FileNotFound)
    }

    /// Resolves a `/`-separated path to an inode ID, starting at the root
    /// folder. A component of the form `iNode<N>` bypasses name lookup and
    /// jumps straight to inode `N` — the original tool's debugging
    /// backdoor for reaching an inode that isn't linked from any
    /// directory.
    pub fn find_inode_id_for_path(&self, path: &str) -> Result<u32> {
        let mut current = inode_id::ROOT_FOLDER;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if let Some(n) = component.strip_prefix("iNode") {
                if let Ok(id) = n.parse::<u32>() {
                    current = id;
                    continue;
                }
            }
            let dir = self.find_inode(current)?;
            current = self.find_child(&dir, component)?;
        }
        Ok(current)
    }

    pub fn find_inode_for_path(&self, path: &str) -> Result<File> {
        let id = self.find_inode_id_for_path(path)?;
        self.find_inode(id)
    }
}

//! A handle onto one inode's data, resolving FAT-stage chain links to
//! physical blocks.

use crate::error::{bad_format, FsError, Result};
use crate::format::{self, mode, ChainLink, RawInode, BLOCK_SIZE};
use crate::image::Image;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fan-out of one indirect block: how many chain links fit in a block.
const FANOUT: u64 = (BLOCK_SIZE / size_of::<ChainLink>()) as u64;

/// Top-level chain link slots directly in the inode record.
const TOP_SLOTS: u64 = 32;

#[derive(Debug)]
pub struct File {
    image: *const Image,
    inode_num: u32,
    raw: RawInode,
    position: AtomicU64,
    /// Whether this handle counts against the image's open-handle counter.
    /// Handles InodeDirectory keeps for its own bookkeeping (the lazy
    /// self-file over the inode table) don't count, or the image could
    /// never finish tearing itself down.
    counted: bool,
}

unsafe impl Send for File {}
unsafe impl Sync for File {}

impl File {
    pub(crate) fn new_internal(image: *const Image, inode_num: u32, raw: RawInode) -> Self {
        File {
            image,
            inode_num,
            raw,
            position: AtomicU64::new(0),
            counted: false,
        }
    }

    pub(crate) fn new_external(image: *const Image, inode_num: u32, raw: RawInode) -> Self {
        unsafe { (*image).bump_refs(1) };
        File {
            image,
            inode_num,
            raw,
            position: AtomicU64::new(0),
            counted: true,
        }
    }

    fn image(&self) -> &Image {
        unsafe { &*self.image }
    }

    pub fn inode_num(&self) -> u32 {
        self.inode_num
    }

    pub fn filesize(&self) -> u64 {
        self.raw.filesize
    }

    pub fn is_dir(&self) -> bool {
        mode::is_dir(self.raw.file_mode)
    }

    pub fn file_mode(&self) -> u16 {
        self.raw.file_mode
    }

    pub fn used_blocks(&self) -> u32 {
        self.raw.used_blocks
    }

    pub fn fat_stage(&self) -> u32 {
        self.raw.fat_stages
    }

    fn block_count(size: u64) -> u64 {
        (size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64
    }

    /// Resolves a logical block index to a physical block number by
    /// walking this inode's FAT stage. Stage 0 means the inode has no data
    /// at all; stage 1 indexes `dataLnk` directly; each stage past that
    /// adds one layer of indirect blocks below `dataLnk`.
    fn get_data_block(&self, logical: u64) -> Result<u32> {
        let stage = self.raw.fat_stages as u64;
        if stage == 0 {
            return Err(bad_format!("inode {} has no data (fat stage 0)", self.inode_num));
        }
        if stage > 3 {
            return Err(FsError::NotImplemented("fat stage beyond 3"));
        }
        let levels = stage - 1;
        let per_top = FANOUT.pow(levels as u32);
        let top_idx = logical / per_top;
        if top_idx >= TOP_SLOTS {
            return Err(bad_format!(
                "logical block {logical} exceeds inode {}'s capacity at stage {stage}",
                self.inode_num
            ));
        }
        let mut rem = logical % per_top;

        // `data_lnk` is a field of a `#[repr(packed)]` struct; copy the
        // whole array out before indexing into it rather than indexing
        // the packed place directly.
        let data_lnk = self.raw.data_lnk;
        let top_link = data_lnk[top_idx as usize];
        if !top_link.is_link() {
            return Err(bad_format!("hole at logical block {logical} in inode {}", self.inode_num));
        }
        if levels == 0 {
            return Ok(top_link.blk());
        }

        let mut block_num = top_link.blk();
        let mut level = levels;
        while level > 0 {
            let divisor = FANOUT.pow(level as u32 - 1);
            let idx = (rem / divisor) as usize;
            rem %= divisor;
            let block = self.image().get_block(block_num)?;
            let off = idx * size_of::<ChainLink>();
            let link = unsafe { std::ptr::read_unaligned(block[off..].as_ptr() as *const ChainLink) };
            if !link.is_link() {
                return Err(bad_format!("hole at logical block {logical} in inode {}", self.inode_num));
            }
            block_num = link.blk();
            level -= 1;
        }
        Ok(block_num)
    }

    /// Reads at an absolute offset, stopping at end-of-file. Returns the
    /// number of bytes actually read.
    pub fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let filesize = self.raw.filesize;
        if offset >= filesize {
            return Ok(0);
        }
        let end = (offset + buf.len() as u64).min(filesize);
        let mut off = offset;
        let mut total = 0usize;
        while off < end {
            let logical = off / BLOCK_SIZE as u64;
            let block_off = (off % BLOCK_SIZE as u64) as usize;
            let phys = self.get_data_block(logical)?;
            let block = self.image().get_block(phys)?;
            let n = ((BLOCK_SIZE - block_off) as u64).min(end - off) as usize;
            buf[total..total + n].copy_from_slice(&block[block_off..block_off + n]);
            total += n;
            off += n as u64;
        }
        Ok(total)
    }

    /// Sequential read from the handle's internal cursor.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let pos = self.position.load(Ordering::Relaxed);
        let n = self.pread(pos, buf)?;
        self.position.store(pos + n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Always fails: writing new data is outside this crate's scope.
    pub fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(FsError::NotImplemented("pwrite"))
    }

    /// The resource stream lives in a separate, small chain of up to four
    /// direct blocks addressed by `resource_lnk`, independent of the FAT
    /// stage governing the data chain.
    pub fn resource_size(&self) -> u64 {
        let resource_lnk = self.raw.resource_lnk;
        resource_lnk.iter().filter(|l| l.is_link()).count() as u64 * BLOCK_SIZE as u64
    }

    pub fn resource_pread(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let cap = self.resource_size();
        if offset >= cap {
            return Ok(0);
        }
        let resource_lnk = self.raw.resource_lnk;
        let end = (offset + buf.len() as u64).min(cap);
        let mut off = offset;
        let mut total = 0usize;
        while off < end {
            let idx = (off / BLOCK_SIZE as u64) as usize;
            let block_off = (off % BLOCK_SIZE as u64) as usize;
            let link = resource_lnk[idx];
            if !link.is_link() {
                break;
            }
            let block = self.image().get_block(link.blk())?;
            let n = ((BLOCK_SIZE - block_off) as u64).min(end - off) as usize;
            buf[total..total + n].copy_from_slice(&block[block_off..block_off + n]);
            total += n;
            off += n as u64;
        }
        Ok(total)
    }

    /// Frees every block at or past `new_size`, downgrading the FAT stage
    /// when the remaining data fits in a lower one, and writes the
    /// updated inode record back to the inode table.
    pub fn shrink(&mut self, new_size: u64) -> Result<()> {
        if new_size > self.raw.filesize {
            let current_size = self.raw.filesize;
            return Err(bad_format!(
                "shrink target {new_size} exceeds current size {current_size}"
            ));
        }
        let old_blocks = Self::block_count(self.raw.filesize);
        let new_blocks = Self::block_count(new_size);
        for logical in (new_blocks..old_blocks).rev() {
            self.pop_allocated_block(logical)?;
        }
        self.downgrade_stage(new_blocks)?;
        self.raw.filesize = new_size;
        self.raw.used_blocks = new_blocks as u32;
        self.write_back()
    }

    fn pop_allocated_block(&mut self, logical: u64) -> Result<()> {
        let stage = self.raw.fat_stages as u64;
        if stage == 0 {
            return Ok(());
        }
        let levels = stage - 1;
        let per_top = FANOUT.pow(levels as u32);
        let top_idx = (logical / per_top) as usize;
        let mut rem = logical % per_top;

        let mut data_lnk = self.raw.data_lnk;
        let top_link = data_lnk[top_idx];
        if !top_link.is_link() {
            return Ok(());
        }

        if levels == 0 {
            self.image().allocator().free_block(top_link.blk())?;
            data_lnk[top_idx] = ChainLink::TERMINATOR;
            self.raw.data_lnk = data_lnk;
            return Ok(());
        }

        let mut path: Vec<(u32, usize)> = Vec::new();
        let mut block_num = top_link.blk();
        let mut level = levels;
        while level > 0 {
            let divisor = FANOUT.pow(level as u32 - 1);
            let idx = (rem / divisor) as usize;
            rem %= divisor;
            let block = self.image().get_block(block_num)?;
            let off = idx * size_of::<ChainLink>();
            let link = unsafe { std::ptr::read_unaligned(block[off..].as_ptr() as *const ChainLink) };
            if !link.is_link() {
                return Ok(());
            }
            path.push((block_num, idx));
            block_num = link.blk();
            level -= 1;
        }

        self.image().allocator().free_block(block_num)?;

        let mut freed_child = true;
        while let Some((parent_block, idx)) = path.pop() {
            {
                let block = self.image().get_block_mut(parent_block)?;
                let off = idx * size_of::<ChainLink>();
                block[off..off + 4].copy_from_slice(&ChainLink::TERMINATOR_BYTES);
            }
            if freed_child && Self::block_is_empty(self.image().get_block(parent_block)?) {
                self.image().allocator().free_block(parent_block)?;
            } else {
                freed_child = false;
            }
        }

        if freed_child {
            data_lnk[top_idx] = ChainLink::TERMINATOR;
            self.raw.data_lnk = data_lnk;
        }
        Ok(())
    }

    fn block_is_empty(block: &[u8]) -> bool {
        block.chunks_exact(size_of::<ChainLink>()).all(|c| {
            let link = unsafe { std::ptr::read_unaligned(c.as_ptr() as *const ChainLink) };
            !link.is_link()
        })
    }

    /// How many data blocks a file can address at FAT stage `s`: 0 for
    /// stage 0 (no data), `TOP_SLOTS` for stage 1 (direct), and one more
    /// factor of `FANOUT` per stage past that.
    fn stage_capacity(s: u64) -> u64 {
        if s == 0 {
            0
        } else {
            TOP_SLOTS * FANOUT.pow((s - 1) as u32)
        }
    }

    /// Collapses `dataLnk` from `from_stage` to `from_stage - 1`: every
    /// surviving logical block, at a stage this shallow, is reachable
    /// through slot 0's subtree alone (`TOP_SLOTS` is far smaller than
    /// `FANOUT`), so the new top-level links are read straight out of
    /// whatever block `dataLnk[0]` used to point to, and that block is
    /// freed once its contents are copied out.
    fn collapse_one_level(&mut self, new_blocks: u64, from_stage: u64) -> Result<()> {
        let new_levels = from_stage - 2;
        let new_per_top = FANOUT.pow(new_levels as u32);
        let new_top_count = ((new_blocks + new_per_top - 1) / new_per_top).max(1).min(TOP_SLOTS) as usize;

        let old_data_lnk = self.raw.data_lnk;
        let old_top0 = old_data_lnk[0];
        let mut new_top = [ChainLink::TERMINATOR; TOP_SLOTS as usize];
        if old_top0.is_link() {
            let source_block = old_top0.blk();
            let block = self.image().get_block(source_block)?;
            for (j, slot) in new_top.iter_mut().enumerate().take(new_top_count) {
                let off = j * size_of::<ChainLink>();
                *slot = unsafe { std::ptr::read_unaligned(block[off..].as_ptr() as *const ChainLink) };
            }
            self.image().allocator().free_block(source_block)?;
        }
        self.raw.data_lnk = new_top;
        Ok(())
    }

    fn downgrade_stage(&mut self, new_blocks: u64) -> Result<()> {
        let mut stage = self.raw.fat_stages as u64;
        while stage > 0 && new_blocks <= Self::stage_capacity(stage - 1) {
            if stage >= 2 {
                self.collapse_one_level(new_blocks, stage)?;
            }
            stage -= 1;
        }
        self.raw.fat_stages = stage as u32;
        Ok(())
    }

    fn write_back(&self) -> Result<()> {
        self.image().inode_dir().write_raw_inode(self.inode_num, &self.raw)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.counted {
            self.image().bump_refs(-1);
        }
    }
}

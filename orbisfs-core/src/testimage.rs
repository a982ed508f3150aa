//! A minimal, byte-exact image assembled in memory for the test suite,
//! the way `mkfs/src/ext2.rs`'s `Ext2Factory` assembles a filesystem's
//! metadata blocks field by field rather than faking them.

use crate::format::*;
use std::mem::size_of;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

static COUNTER: AtomicU32 = AtomicU32::new(0);

pub const TOTAL_BLOCKS: u32 = 8;

pub const BLK_SUPERBLOCK: u32 = 0;
pub const BLK_DISKINFO: u32 = 1;
pub const BLK_ALLOCATOR_INFO: u32 = 2;
pub const BLK_ALLOCATOR_BITMAP: u32 = 3;
pub const BLK_INODE_TABLE: u32 = 4;
pub const BLK_ROOT_DIR: u32 = 5;
pub const BLK_HELLO_DATA: u32 = 6;
/// Left allocated and unused, a spare for allocator free/double-free tests.
pub const BLK_SPARE: u32 = 7;

pub const INODE_HELLO: u32 = inode_id::FIRST_USER_INODE;
pub const INODE_VANISHED_TARGET: u32 = 99;

fn write_struct<T>(buf: &mut [u8], block: u32, value: &T) {
    let off = block as usize * BLOCK_SIZE;
    let bytes =
        unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) };
    buf[off..off + bytes.len()].copy_from_slice(bytes);
}

fn write_dir_entry(buf: &mut [u8], block: u32, offset: &mut usize, inode_num: u32, name: &str, entry_type: u16) {
    let prefix = DirectoryElemPrefix {
        inode_num,
        field2: DIRECTORY_FIELD2_EXPECTED,
        elem_size: (DIRECTORY_PREFIX_SIZE + name.len()) as u32,
        namelen: name.len() as u16,
        entry_type,
    };
    let block_off = block as usize * BLOCK_SIZE + *offset;
    let prefix_bytes = unsafe {
        std::slice::from_raw_parts(&prefix as *const DirectoryElemPrefix as *const u8, DIRECTORY_PREFIX_SIZE)
    };
    buf[block_off..block_off + DIRECTORY_PREFIX_SIZE].copy_from_slice(prefix_bytes);
    let name_off = block_off + DIRECTORY_PREFIX_SIZE;
    buf[name_off..name_off + name.len()].copy_from_slice(name.as_bytes());
    *offset += DIRECTORY_PREFIX_SIZE + name.len();
}

fn regular_inode(inode_num: u32, filesize: u64, first_block: u32) -> RawInode {
    let mut data_lnk = [ChainLink::default(); 32];
    data_lnk[0] = ChainLink::new(first_block, ChainLink::LINK_TYPE);
    RawInode {
        magic: INODE_MAGIC,
        fat_stages: 1,
        inode_num,
        _pad0: 0,
        file_mode: mode::S_IFREG,
        _pad1: [0; 6],
        uid: 0,
        gid: 0,
        filesize,
        used_blocks: 1,
        flags: 0,
        create_date: 0,
        _pad2: 0,
        access_date: 0,
        _pad3: 0,
        mod_date: 0,
        _pad4: 0,
        resource_lnk: [ChainLink::default(); 4],
        _pad5: 0,
        data_lnk,
    }
}

fn dir_inode(inode_num: u32, filesize: u64, first_block: u32) -> RawInode {
    let mut inode = regular_inode(inode_num, filesize, first_block);
    inode.file_mode = mode::S_IFDIR;
    inode
}

/// Holds the path to a temporary file backing a hand-assembled image; the
/// file is removed when the fixture is dropped.
pub struct FixtureImage {
    path: PathBuf,
}

impl FixtureImage {
    pub fn minimal() -> Self {
        Self::build_minimal(ChainLink::new(BLK_DISKINFO, ChainLink::LINK_TYPE))
    }

    /// Same layout as [`minimal`](Self::minimal), except the diskinfo
    /// block's own `diskinfoLnk` doesn't match the superblock's.
    pub fn mismatched_diskinfo_link() -> Self {
        Self::build_minimal(ChainLink::new(BLK_DISKINFO + 1, ChainLink::LINK_TYPE))
    }

    fn build_minimal(diskinfo_diskinfo_lnk: ChainLink) -> Self {
        let mut buf = vec![0u8; TOTAL_BLOCKS as usize * BLOCK_SIZE];

        let superblock = Superblock {
            magic: SUPERBLOCK_MAGIC,
            _pad1: [0; 0x38],
            unk0: 0,
            reserve: *SUPERBLOCK_RESERVE_STR,
            _pad2: [0; 0x10],
            version: SUPERBLOCK_VERSION,
            unk2: 0,
            allocator_info_lnk: ChainLink::new(BLK_ALLOCATOR_INFO, ChainLink::LINK_TYPE),
            unk4: 0,
            unk5: 0,
            diskinfo_lnk: ChainLink::new(BLK_DISKINFO, ChainLink::LINK_TYPE),
        };
        write_struct(&mut buf, BLK_SUPERBLOCK, &superblock);

        let diskinfo = Diskinfo {
            magic: DISKINFO_MAGIC,
            unk1_is_2: 2,
            unk2_is_0x40: 0x40,
            unk3_is_0: 0,
            devpath: [0; 0x100],
            inodes_in_root_folder: 1,
            unk5_is_0xffffffff: 0xffff_ffff,
            highest_used_inode: INODE_HELLO,
            _pad2: [0; 0x34],
            blocks_used: TOTAL_BLOCKS as u64,
            blocks_available: 0,
            unk7: [0; 0xb0],
            inodedir_lnk: ChainLink::new(BLK_INODE_TABLE, ChainLink::LINK_TYPE),
            diskinfo_lnk: diskinfo_diskinfo_lnk,
        };
        write_struct(&mut buf, BLK_DISKINFO, &diskinfo);

        // One allocator region covering every block, block 0 included, all
        // marked allocated except the last, which free/double-free tests
        // exercise.
        let region = AllocatorInfoElem {
            bitmap_lnk: ChainLink::new(BLK_ALLOCATOR_BITMAP, ChainLink::LINK_TYPE),
            free_blocks: 0,
            total_blocks: TOTAL_BLOCKS,
            _pad: 0,
        };
        write_struct(&mut buf, BLK_ALLOCATOR_INFO, &region);
        // terminator: an all-zero AllocatorInfoElem, already present since
        // `buf` starts zeroed.

        // bitmap: bit i tracks block i directly. Every bit starts at 0
        // (allocated); `buf` is already zeroed, this is just documentation.
        let bitmap_off = BLK_ALLOCATOR_BITMAP as usize * BLOCK_SIZE;
        buf[bitmap_off] = 0x00;

        let root_filesize;
        {
            let mut offset = 0usize;
            write_dir_entry(&mut buf, BLK_ROOT_DIR, &mut offset, INODE_HELLO, "hello.txt", DIRECTORY_TYPE_REGULAR);
            write_dir_entry(&mut buf, BLK_ROOT_DIR, &mut offset, INODE_VANISHED_TARGET, "vanished.txt", DIRECTORY_TYPE_REGULAR);
            root_filesize = offset as u64;
        }

        let root = dir_inode(inode_id::ROOT_FOLDER, root_filesize, BLK_ROOT_DIR);
        write_inode(&mut buf, inode_id::ROOT_FOLDER, &root);

        let cap = crate::inode_dir::InodeDirectory::first_block_capacity();
        let inode_table_file = regular_inode(
            inode_id::INODE_TABLE,
            (cap * size_of::<RawInode>()) as u64,
            BLK_INODE_TABLE,
        );
        write_inode(&mut buf, inode_id::INODE_TABLE, &inode_table_file);

        let hello_content = b"hello, orbisfs";
        let hello = regular_inode(INODE_HELLO, hello_content.len() as u64, BLK_HELLO_DATA);
        write_inode(&mut buf, INODE_HELLO, &hello);

        let hello_off = BLK_HELLO_DATA as usize * BLOCK_SIZE;
        buf[hello_off..hello_off + hello_content.len()].copy_from_slice(hello_content);

        // inode slots 0 and 1 are left all-zero, matching the permanently
        // unused reserved IDs.

        let pid = std::process::id();
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("orbisfs-core-test-{pid}-{n}.img"));
        std::fs::write(&path, &buf).expect("write fixture image");
        FixtureImage { path }
    }

    pub fn open(&self) -> Box<crate::image::Image> {
        self.try_open().expect("fixture image should be valid")
    }

    pub fn try_open(&self) -> crate::error::Result<Box<crate::image::Image>> {
        crate::image::Image::open(&self.path, true, 0)
    }

    /// Same layout as [`minimal`](Self::minimal), except the root
    /// directory's one entry has its `elemSize` patched to a value that
    /// runs past the end of the directory's contents.
    pub fn corrupt_dir_entry_elem_size() -> Self {
        let fixture = Self::minimal();
        let mut buf = std::fs::read(&fixture.path).expect("read fixture image");
        // `elemSize` is the third u32 in `DirectoryElemPrefix`, right after
        // `inodeNum` and `field2`.
        let off = BLK_ROOT_DIR as usize * BLOCK_SIZE + 2 * size_of::<u32>();
        buf[off..off + 4].copy_from_slice(&(BLOCK_SIZE as u32 * 2).to_le_bytes());
        std::fs::write(&fixture.path, &buf).expect("patch fixture image");
        fixture
    }

    /// A second image, built fresh (the `minimal()` layout has no spare
    /// blocks for an indirect FAT level), holding one inode at FAT stage 2:
    /// `dataLnk[0]` points to an indirect block whose first two entries
    /// name two data blocks. Exercises shrinking across a stage downgrade.
    pub fn two_stage_file() -> Self {
        const TOTAL_BLOCKS: u32 = 9;
        const BLK_SUPERBLOCK: u32 = 0;
        const BLK_DISKINFO: u32 = 1;
        const BLK_ALLOCATOR_INFO: u32 = 2;
        const BLK_ALLOCATOR_BITMAP: u32 = 3;
        const BLK_INODE_TABLE: u32 = 4;
        const BLK_ROOT_DIR: u32 = 5;
        const BLK_INDIRECT: u32 = 6;
        const BLK_DATA_A: u32 = 7;
        const BLK_DATA_B: u32 = 8;
        const INODE_BIG: u32 = inode_id::FIRST_USER_INODE;

        let mut buf = vec![0u8; TOTAL_BLOCKS as usize * BLOCK_SIZE];

        let superblock = Superblock {
            magic: SUPERBLOCK_MAGIC,
            _pad1: [0; 0x38],
            unk0: 0,
            reserve: *SUPERBLOCK_RESERVE_STR,
            _pad2: [0; 0x10],
            version: SUPERBLOCK_VERSION,
            unk2: 0,
            allocator_info_lnk: ChainLink::new(BLK_ALLOCATOR_INFO, ChainLink::LINK_TYPE),
            unk4: 0,
            unk5: 0,
            diskinfo_lnk: ChainLink::new(BLK_DISKINFO, ChainLink::LINK_TYPE),
        };
        write_struct(&mut buf, BLK_SUPERBLOCK, &superblock);

        let diskinfo = Diskinfo {
            magic: DISKINFO_MAGIC,
            unk1_is_2: 2,
            unk2_is_0x40: 0x40,
            unk3_is_0: 0,
            devpath: [0; 0x100],
            inodes_in_root_folder: 1,
            unk5_is_0xffffffff: 0xffff_ffff,
            highest_used_inode: INODE_BIG,
            _pad2: [0; 0x34],
            blocks_used: TOTAL_BLOCKS as u64,
            blocks_available: 0,
            unk7: [0; 0xb0],
            inodedir_lnk: ChainLink::new(BLK_INODE_TABLE, ChainLink::LINK_TYPE),
            diskinfo_lnk: ChainLink::new(BLK_DISKINFO, ChainLink::LINK_TYPE),
        };
        write_struct(&mut buf, BLK_DISKINFO, &diskinfo);

        // One region covering every block 0..=8, all allocated.
        let region = AllocatorInfoElem {
            bitmap_lnk: ChainLink::new(BLK_ALLOCATOR_BITMAP, ChainLink::LINK_TYPE),
            free_blocks: 0,
            total_blocks: TOTAL_BLOCKS,
            _pad: 0,
        };
        write_struct(&mut buf, BLK_ALLOCATOR_INFO, &region);

        let bitmap_off = BLK_ALLOCATOR_BITMAP as usize * BLOCK_SIZE;
        buf[bitmap_off] = 0x00;

        let root_filesize;
        {
            let mut offset = 0usize;
            write_dir_entry(&mut buf, BLK_ROOT_DIR, &mut offset, INODE_BIG, "big.bin", DIRECTORY_TYPE_REGULAR);
            root_filesize = offset as u64;
        }
        let root = dir_inode(inode_id::ROOT_FOLDER, root_filesize, BLK_ROOT_DIR);
        write_inode(&mut buf, inode_id::ROOT_FOLDER, &root);

        let cap = crate::inode_dir::InodeDirectory::first_block_capacity();
        let inode_table_file =
            regular_inode(inode_id::INODE_TABLE, (cap * size_of::<RawInode>()) as u64, BLK_INODE_TABLE);
        write_inode(&mut buf, inode_id::INODE_TABLE, &inode_table_file);

        // The indirect block: entry 0 -> data A, entry 1 -> data B, the
        // rest left zeroed (not a link).
        write_chain_link(&mut buf, BLK_INDIRECT, 0, ChainLink::new(BLK_DATA_A, ChainLink::LINK_TYPE));
        write_chain_link(&mut buf, BLK_INDIRECT, 1, ChainLink::new(BLK_DATA_B, ChainLink::LINK_TYPE));

        let mut data_lnk = [ChainLink::default(); 32];
        data_lnk[0] = ChainLink::new(BLK_INDIRECT, ChainLink::LINK_TYPE);
        let big = RawInode {
            magic: INODE_MAGIC,
            fat_stages: 2,
            inode_num: INODE_BIG,
            _pad0: 0,
            file_mode: mode::S_IFREG,
            _pad1: [0; 6],
            uid: 0,
            gid: 0,
            filesize: BLOCK_SIZE as u64 + 10,
            used_blocks: 3,
            flags: 0,
            create_date: 0,
            _pad2: 0,
            access_date: 0,
            _pad3: 0,
            mod_date: 0,
            _pad4: 0,
            resource_lnk: [ChainLink::default(); 4],
            _pad5: 0,
            data_lnk,
        };
        write_inode(&mut buf, INODE_BIG, &big);

        let pid = std::process::id();
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("orbisfs-core-test-two-stage-{pid}-{n}.img"));
        std::fs::write(&path, &buf).expect("write fixture image");
        FixtureImage { path }
    }
}

impl Drop for FixtureImage {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn write_chain_link(buf: &mut [u8], block: u32, idx: usize, link: ChainLink) {
    let off = block as usize * BLOCK_SIZE + idx * size_of::<ChainLink>();
    let bytes =
        unsafe { std::slice::from_raw_parts(&link as *const ChainLink as *const u8, size_of::<ChainLink>()) };
    buf[off..off + bytes.len()].copy_from_slice(bytes);
}

fn write_inode(buf: &mut [u8], id: u32, raw: &RawInode) {
    let off = BLK_INODE_TABLE as usize * BLOCK_SIZE + id as usize * size_of::<RawInode>();
    let bytes =
        unsafe { std::slice::from_raw_parts(raw as *const RawInode as *const u8, size_of::<RawInode>()) };
    buf[off..off + bytes.len()].copy_from_slice(bytes);
}

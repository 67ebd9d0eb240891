//! Test support: an in-memory ext2 formatter and a shareable RAM disk.
//!
//! `mkfs_1k` builds a fresh single-group volume with 1 KiB blocks, the
//! layout a minimal formatter produces: boot block, superblock, descriptor
//! table, block/inode bitmaps, inode table, then the root directory's one
//! data block.

use std::sync::Arc;
use std::vec::Vec;

use alos_ext2::disk::{
    self, EXT2_MAGIC, GroupDesc, Inode, Superblock,
};
use alos_fs::block::{BlockDevice, IoError, RamDisk};

pub const BS: usize = 1024;

/// First block of the inode table in images built by [`mkfs_1k`].
pub const INODE_TABLE_BLOCK: u32 = 5;

/// Formats a single-group ext2 image: 1 KiB blocks, 128-byte inodes,
/// revision 1, inodes 1..=10 reserved, root directory at inode 2.
pub fn mkfs_1k(blocks: u32, inodes: u32) -> Vec<u8> {
    assert!(blocks > 16 && blocks <= 8193, "single-group volume expected");
    assert!(inodes % 8 == 0);

    let mut img = vec![0u8; blocks as usize * BS];

    let inode_table_blocks = (inodes as usize * 128).div_ceil(BS) as u32;
    let root_block = INODE_TABLE_BLOCK + inode_table_blocks;

    // Blocks 1..=root_block are metadata plus the root directory.
    let group_capacity = blocks - 1;
    let free_blocks = group_capacity - root_block;
    let reserved_inodes = 10;
    let free_inodes = inodes - reserved_inodes;

    let sb = Superblock {
        inodes_count: inodes,
        blocks_count: blocks,
        free_blocks_count: free_blocks,
        free_inodes_count: free_inodes,
        first_data_block: 1,
        log_block_size: 0,
        blocks_per_group: 8192,
        inodes_per_group: inodes,
        mtime: 0,
        wtime: 0,
        magic: EXT2_MAGIC,
        state: disk::state::VALID_FS,
        rev_level: 1,
        first_ino: 11,
        inode_size: 128,
    };
    sb.encode_into(&mut img[1024..2048]);

    let gd = GroupDesc {
        block_bitmap: 3,
        inode_bitmap: 4,
        inode_table: INODE_TABLE_BLOCK,
        free_blocks_count: free_blocks as u16,
        free_inodes_count: free_inodes as u16,
        used_dirs_count: 1,
    };
    gd.encode_into(&mut img[2 * BS..2 * BS + 32]);

    // Block bitmap: metadata blocks used, tail bits past the (short) group
    // capacity permanently set.
    {
        let bitmap = &mut img[3 * BS..4 * BS];
        for bit in 0..root_block {
            bitmap[bit as usize / 8] |= 1 << (bit % 8);
        }
        for bit in group_capacity..8192 {
            bitmap[bit as usize / 8] |= 1 << (bit % 8);
        }
    }

    // Inode bitmap: reserved inodes used, tail bits past the inode count
    // set.
    {
        let bitmap = &mut img[4 * BS..5 * BS];
        for bit in 0..reserved_inodes {
            bitmap[bit as usize / 8] |= 1 << (bit % 8);
        }
        for bit in inodes..8192 {
            bitmap[bit as usize / 8] |= 1 << (bit % 8);
        }
    }

    // Root inode.
    let mut root = Inode {
        mode: disk::mode::S_IFDIR | 0o755,
        links_count: 2,
        size: BS as u32,
        blocks: (BS / 512) as u32,
        ..Inode::default()
    };
    root.block[0] = root_block;
    let off = INODE_TABLE_BLOCK as usize * BS + 128;
    root.encode_into(&mut img[off..off + 128]);

    // Root directory data: `.` and `..` tiling the block.
    {
        let base = root_block as usize * BS;
        let data = &mut img[base..base + BS];
        data[0..4].copy_from_slice(&2u32.to_le_bytes());
        data[4..6].copy_from_slice(&12u16.to_le_bytes());
        data[6] = 1;
        data[7] = disk::file_type::DIR;
        data[8] = b'.';

        data[12..16].copy_from_slice(&2u32.to_le_bytes());
        data[16..18].copy_from_slice(&((BS - 12) as u16).to_le_bytes());
        data[18] = 2;
        data[19] = disk::file_type::DIR;
        data[20] = b'.';
        data[21] = b'.';
    }

    img
}

/// The standard test volume: 8 MiB, 8192 blocks, 1024 inodes.
pub fn standard_image() -> Vec<u8> {
    mkfs_1k(8192, 1024)
}

/// A RAM disk that can be handed to a mount and still inspected afterwards.
#[derive(Clone)]
pub struct SharedDisk(pub Arc<RamDisk>);

impl SharedDisk {
    pub fn from_image(image: Vec<u8>) -> Self {
        Self(Arc::new(RamDisk::from_image(image)))
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.0.snapshot()
    }

    /// Decodes the superblock from the current image.
    pub fn superblock(&self) -> Superblock {
        Superblock::decode(&self.snapshot()[1024..2048])
    }

    /// Decodes the (single) group descriptor from the current image.
    pub fn group_desc(&self) -> GroupDesc {
        GroupDesc::decode(&self.snapshot()[2 * BS..2 * BS + 32])
    }

    /// Decodes an inode record from the current image.
    pub fn inode(&self, ino: u32) -> Inode {
        let off = INODE_TABLE_BLOCK as usize * BS + (ino as usize - 1) * 128;
        Inode::decode(&self.snapshot()[off..off + 128])
    }
}

impl BlockDevice for SharedDisk {
    fn read_sectors(&self, lba: u64, count: usize, buf: &mut [u8]) -> Result<(), IoError> {
        self.0.read_sectors(lba, count, buf)
    }

    fn write_sectors(&self, lba: u64, count: usize, buf: &[u8]) -> Result<(), IoError> {
        self.0.write_sectors(lba, count, buf)
    }

    fn sector_count(&self) -> u64 {
        self.0.sector_count()
    }
}

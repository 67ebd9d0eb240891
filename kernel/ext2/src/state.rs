//! Mounted-volume state shared by the driver modules.

use alloc::boxed::Box;
use alloc::vec::Vec;

use alos_fs::block::BlockDevice;

use crate::disk::{GroupDesc, Superblock};

/// In-memory image of a mounted ext2 volume.
///
/// Holds the device handle, the decoded superblock (plus its raw image so
/// uninterpreted fields survive write-back), the cached group-descriptor
/// table and the derived constants. All driver modules operate on this
/// struct; the [`fs`](crate::fs) layer serializes access behind one lock.
pub(crate) struct Ext2State {
    /// The underlying device.
    pub device: Box<dyn BlockDevice>,
    /// Decoded superblock.
    pub sb: Superblock,
    /// Raw 1024-byte superblock image for write-back.
    pub sb_image: Vec<u8>,
    /// Cached group-descriptor table, one entry per group.
    pub groups: Vec<GroupDesc>,
    /// Block size in bytes (`1024 << s_log_block_size`).
    pub block_size: usize,
    /// Inode record size in bytes.
    pub inode_size: usize,
    /// Number of block groups.
    pub num_groups: u32,
}

impl Ext2State {
    /// Byte offset of the group-descriptor table: the block after the
    /// superblock (block 2 for 1 KiB blocks, block 1 otherwise).
    pub fn gdt_offset(&self) -> u64 {
        (self.sb.first_data_block as u64 + 1) * self.block_size as u64
    }

    /// Number of blocks actually belonging to `group` (the last group may
    /// be short).
    pub fn group_block_count(&self, group: u32) -> u32 {
        let first = self.sb.first_data_block + group * self.sb.blocks_per_group;
        (self.sb.blocks_count - first).min(self.sb.blocks_per_group)
    }

    /// Number of inodes actually belonging to `group`.
    pub fn group_inode_count(&self, group: u32) -> u32 {
        let first = group * self.sb.inodes_per_group;
        (self.sb.inodes_count - first).min(self.sb.inodes_per_group)
    }

    /// Pointers per indirect block.
    pub fn ptrs_per_block(&self) -> u32 {
        (self.block_size / 4) as u32
    }
}

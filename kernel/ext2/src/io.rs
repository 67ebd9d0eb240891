//! Byte- and block-granular device access.
//!
//! ext2 metadata is not sector-aligned (32-byte group descriptors, 128-byte
//! inode records), so the driver needs byte-granular reads and
//! read-modify-write cycles over 512-byte sectors. Whole filesystem blocks
//! are always sector-aligned and go straight through.

use alloc::vec;
use alloc::vec::Vec;

use alos_fs::block::SECTOR_SIZE;
use alos_fs::FsError;

use crate::disk::SUPERBLOCK_OFFSET;
use crate::state::Ext2State;

impl Ext2State {
    /// Reads one filesystem block.
    pub fn read_block(&self, block: u32) -> Result<Vec<u8>, FsError> {
        let mut buf = vec![0u8; self.block_size];
        let lba = block as u64 * (self.block_size / SECTOR_SIZE) as u64;
        self.device
            .read_sectors(lba, self.block_size / SECTOR_SIZE, &mut buf)?;
        Ok(buf)
    }

    /// Writes one filesystem block.
    pub fn write_block(&self, block: u32, data: &[u8]) -> Result<(), FsError> {
        if data.len() != self.block_size {
            return Err(FsError::InvalidArgument);
        }
        let lba = block as u64 * (self.block_size / SECTOR_SIZE) as u64;
        self.device
            .write_sectors(lba, self.block_size / SECTOR_SIZE, data)?;
        Ok(())
    }

    /// Reads an arbitrary byte span of the device.
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<(), FsError> {
        if buf.is_empty() {
            return Ok(());
        }
        let first = offset / SECTOR_SIZE as u64;
        let last = (offset + buf.len() as u64 - 1) / SECTOR_SIZE as u64;
        let count = (last - first + 1) as usize;

        let mut span = vec![0u8; count * SECTOR_SIZE];
        self.device.read_sectors(first, count, &mut span)?;

        let skip = (offset - first * SECTOR_SIZE as u64) as usize;
        buf.copy_from_slice(&span[skip..skip + buf.len()]);
        Ok(())
    }

    /// Writes an arbitrary byte span of the device, read-modify-writing the
    /// covering sectors.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<(), FsError> {
        if data.is_empty() {
            return Ok(());
        }
        let first = offset / SECTOR_SIZE as u64;
        let last = (offset + data.len() as u64 - 1) / SECTOR_SIZE as u64;
        let count = (last - first + 1) as usize;

        let mut span = vec![0u8; count * SECTOR_SIZE];
        self.device.read_sectors(first, count, &mut span)?;

        let skip = (offset - first * SECTOR_SIZE as u64) as usize;
        span[skip..skip + data.len()].copy_from_slice(data);

        self.device.write_sectors(first, count, &span)?;
        Ok(())
    }

    /// Persists the superblock (decoded fields patched into the raw image).
    pub fn write_superblock(&mut self) -> Result<(), FsError> {
        self.sb.encode_into(&mut self.sb_image);
        let image = core::mem::take(&mut self.sb_image);
        let res = self.write_bytes(SUPERBLOCK_OFFSET, &image);
        self.sb_image = image;
        res
    }

    /// Persists one group descriptor.
    pub fn write_group_desc(&self, group: u32) -> Result<(), FsError> {
        let mut buf = [0u8; crate::disk::GROUP_DESC_SIZE];
        self.groups[group as usize].encode_into(&mut buf);
        let offset = self.gdt_offset() + group as u64 * crate::disk::GROUP_DESC_SIZE as u64;
        self.write_bytes(offset, &buf)
    }
}

//! Inode records and file data paths.
//!
//! Inodes are located by `divmod(ino - 1, inodes_per_group)` into the
//! owning group's inode table. Data blocks are reached through the 15-slot
//! block map: 12 direct pointers, then single, double and triple indirect
//! levels (`P = block_size / 4` pointers per level). A pointer of 0 is a
//! hole: reads yield zeros without touching the device, and the write path
//! allocates the missing chain on demand. Writing past the doubly-indirect
//! limit is refused with `NoSpace`; the triple level is navigated on reads
//! only.

use alloc::vec::Vec;

use alos_fs::FsError;

use crate::disk::{DIND_SLOT, GOOD_OLD_INODE_SIZE, IND_SLOT, Inode, TIND_SLOT};
use crate::state::Ext2State;

#[inline]
fn read_ptr(block: &[u8], index: usize) -> u32 {
    let off = index * 4;
    u32::from_le_bytes([block[off], block[off + 1], block[off + 2], block[off + 3]])
}

#[inline]
fn write_ptr(block: &mut [u8], index: usize, value: u32) {
    block[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
}

impl Ext2State {
    /// Byte offset of inode `ino`'s record on the device.
    fn inode_offset(&self, ino: u32) -> Result<u64, FsError> {
        if ino == 0 || ino > self.sb.inodes_count {
            return Err(FsError::NotFound);
        }
        let idx = ino - 1;
        let group = idx / self.sb.inodes_per_group;
        let index_in_group = idx % self.sb.inodes_per_group;

        let table = self.groups[group as usize].inode_table;
        Ok(table as u64 * self.block_size as u64
            + index_in_group as u64 * self.inode_size as u64)
    }

    /// Reads inode `ino` from the inode table.
    pub fn read_inode(&self, ino: u32) -> Result<Inode, FsError> {
        let offset = self.inode_offset(ino)?;
        let mut buf = [0u8; GOOD_OLD_INODE_SIZE];
        self.read_bytes(offset, &mut buf)?;
        Ok(Inode::decode(&buf))
    }

    /// Writes inode `ino` back to the inode table.
    ///
    /// Only the 128-byte core is rewritten; the extension area of
    /// revision-1 records is left untouched.
    pub fn write_inode(&self, ino: u32, inode: &Inode) -> Result<(), FsError> {
        let offset = self.inode_offset(ino)?;
        let mut buf = [0u8; GOOD_OLD_INODE_SIZE];
        self.read_bytes(offset, &mut buf)?;
        inode.encode_into(&mut buf);
        self.write_bytes(offset, &buf)
    }

    /// Resolves a logical block index to a physical block number.
    ///
    /// `Ok(None)` means the block is a hole.
    pub fn block_for_index(&self, inode: &Inode, index: u32) -> Result<Option<u32>, FsError> {
        let p = self.ptrs_per_block() as u64;
        let mut index = index as u64;

        if index < IND_SLOT as u64 {
            let block = inode.block[index as usize];
            return Ok(if block == 0 { None } else { Some(block) });
        }
        index -= IND_SLOT as u64;

        if index < p {
            return self.walk_indirect(inode.block[IND_SLOT], &[index as usize]);
        }
        index -= p;

        if index < p * p {
            let idx = [(index / p) as usize, (index % p) as usize];
            return self.walk_indirect(inode.block[DIND_SLOT], &idx);
        }
        index -= p * p;

        if index < p * p * p {
            let idx = [
                (index / (p * p)) as usize,
                ((index / p) % p) as usize,
                (index % p) as usize,
            ];
            return self.walk_indirect(inode.block[TIND_SLOT], &idx);
        }

        Err(FsError::InvalidArgument)
    }

    /// Follows a chain of indirect blocks; a zero pointer at any level is a
    /// hole.
    fn walk_indirect(&self, top: u32, indices: &[usize]) -> Result<Option<u32>, FsError> {
        let mut block = top;
        for &idx in indices {
            if block == 0 {
                return Ok(None);
            }
            let data = self.read_block(block)?;
            block = read_ptr(&data, idx);
        }
        Ok(if block == 0 { None } else { Some(block) })
    }

    /// Resolves a logical block index to a physical block, allocating the
    /// data block and any missing indirect level on the way down.
    ///
    /// Newly allocated indirect blocks come back zero-filled from the block
    /// allocator, so absent deeper pointers read as holes until installed.
    pub fn ensure_block_for_index(
        &mut self,
        inode: &mut Inode,
        index: u32,
    ) -> Result<u32, FsError> {
        let p = self.ptrs_per_block() as u64;
        let charge = (self.block_size / 512) as u32;
        let mut index = index as u64;

        if index < IND_SLOT as u64 {
            if inode.block[index as usize] == 0 {
                inode.block[index as usize] = self.allocate_block()?;
                inode.blocks += charge;
            }
            return Ok(inode.block[index as usize]);
        }
        index -= IND_SLOT as u64;

        if index < p {
            if inode.block[IND_SLOT] == 0 {
                inode.block[IND_SLOT] = self.allocate_block()?;
                inode.blocks += charge;
            }
            let top = inode.block[IND_SLOT];
            return self.ensure_in_indirect(inode, top, &[index as usize]);
        }
        index -= p;

        if index < p * p {
            if inode.block[DIND_SLOT] == 0 {
                inode.block[DIND_SLOT] = self.allocate_block()?;
                inode.blocks += charge;
            }
            let top = inode.block[DIND_SLOT];
            let idx = [(index / p) as usize, (index % p) as usize];
            return self.ensure_in_indirect(inode, top, &idx);
        }

        // Triple indirect allocation is not supported; the volume simply
        // cannot grow a single file past the doubly-indirect limit.
        Err(FsError::NoSpace)
    }

    /// Walks `indices` below `top`, allocating any missing level, and
    /// returns the final data block.
    fn ensure_in_indirect(
        &mut self,
        inode: &mut Inode,
        top: u32,
        indices: &[usize],
    ) -> Result<u32, FsError> {
        let charge = (self.block_size / 512) as u32;
        let mut block = top;
        for &idx in indices {
            let mut table = self.read_block(block)?;
            let mut next = read_ptr(&table, idx);
            if next == 0 {
                next = self.allocate_block()?;
                write_ptr(&mut table, idx, next);
                self.write_block(block, &table)?;
                inode.blocks += charge;
            }
            block = next;
        }
        Ok(block)
    }

    /// Reads file data starting at byte `offset`.
    ///
    /// Clips to the inode size; holes read as zeros without device I/O.
    /// Returns the number of bytes read (0 at or past end of file).
    pub fn read_inode_data(
        &self,
        inode: &Inode,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, FsError> {
        let size = inode.size as u64;
        if offset >= size {
            return Ok(0);
        }
        let len = buf.len().min((size - offset) as usize);
        let bs = self.block_size;

        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let block_index = (pos / bs as u64) as u32;
            let in_block = (pos % bs as u64) as usize;
            let chunk = (bs - in_block).min(len - done);

            match self.block_for_index(inode, block_index)? {
                Some(block) => {
                    let data = self.read_block(block)?;
                    buf[done..done + chunk].copy_from_slice(&data[in_block..in_block + chunk]);
                }
                None => buf[done..done + chunk].fill(0),
            }
            done += chunk;
        }

        Ok(len)
    }

    /// Writes file data at byte `offset`, allocating blocks as needed.
    ///
    /// Partial first/last blocks are read-modify-written. The inode's size,
    /// sector count and timestamps are updated and the record persisted
    /// before returning. When the volume fills up mid-write, the bytes
    /// already written are reported as a short count; an error is returned
    /// only if nothing was written.
    pub fn write_inode_data(
        &mut self,
        ino: u32,
        inode: &mut Inode,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, FsError> {
        let bs = self.block_size;
        let mut done = 0;
        let mut failure = None;

        while done < data.len() {
            let pos = offset + done as u64;
            let block_index = (pos / bs as u64) as u32;
            let in_block = (pos % bs as u64) as usize;
            let chunk = (bs - in_block).min(data.len() - done);

            let block = match self.ensure_block_for_index(inode, block_index) {
                Ok(b) => b,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            if chunk == bs {
                self.write_block(block, &data[done..done + chunk])?;
            } else {
                let mut existing = self.read_block(block)?;
                existing[in_block..in_block + chunk].copy_from_slice(&data[done..done + chunk]);
                self.write_block(block, &existing)?;
            }
            done += chunk;
        }

        let end = offset + done as u64;
        if end > inode.size as u64 {
            inode.size = end as u32;
        }
        let now = crate::current_time();
        inode.mtime = now;
        inode.atime = now;
        self.write_inode(ino, inode)?;

        match failure {
            Some(e) if done == 0 => Err(e),
            _ => Ok(done),
        }
    }

    /// Releases every data and indirect block of the inode and zeroes its
    /// block map, size and sector count. The record itself is not
    /// persisted; the caller decides what happens to it next.
    pub fn truncate_inode(&mut self, inode: &mut Inode) -> Result<(), FsError> {
        for i in 0..IND_SLOT {
            self.free_block(inode.block[i])?;
            inode.block[i] = 0;
        }

        self.free_indirect_tree(inode.block[IND_SLOT], 1)?;
        inode.block[IND_SLOT] = 0;
        self.free_indirect_tree(inode.block[DIND_SLOT], 2)?;
        inode.block[DIND_SLOT] = 0;
        self.free_indirect_tree(inode.block[TIND_SLOT], 3)?;
        inode.block[TIND_SLOT] = 0;

        inode.size = 0;
        inode.blocks = 0;
        Ok(())
    }

    /// Frees an indirect block and everything below it. `depth` 1 is a
    /// single-indirect block whose entries are data blocks.
    fn free_indirect_tree(&mut self, block: u32, depth: u32) -> Result<(), FsError> {
        if block == 0 {
            return Ok(());
        }
        let table = self.read_block(block)?;
        let entries: Vec<u32> = (0..self.ptrs_per_block() as usize)
            .map(|i| read_ptr(&table, i))
            .collect();
        for entry in entries {
            if entry == 0 {
                continue;
            }
            if depth > 1 {
                self.free_indirect_tree(entry, depth - 1)?;
            } else {
                self.free_block(entry)?;
            }
        }
        self.free_block(block)
    }
}

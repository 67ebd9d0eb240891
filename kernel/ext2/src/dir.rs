//! Directory record management.
//!
//! A directory's data is an exact tiling of variable-length records, one
//! tiling per block (a record never crosses a block boundary). Deleted
//! slots keep their span with an inode number of 0, or are absorbed into
//! the preceding record's `rec_len`. A record length of 0 cannot occur in a
//! well-formed tiling and aborts the scan as corruption.

use alloc::string::ToString;
use alloc::vec;
use alloc::vec::Vec;

use alos_fs::FsError;

use crate::disk::{
    DIRENT_HEADER_SIZE, DirRecord, dirent_used_len, le16, le32, put16, put32,
};
use crate::state::Ext2State;

/// Longest name a record can carry.
const MAX_NAME_LEN: usize = 255;

fn decode_header(block: &[u8], off: usize) -> (u32, usize, usize, u8) {
    let ino = le32(block, off);
    let rec_len = le16(block, off + 4) as usize;
    let name_len = block[off + 6] as usize;
    let file_type = block[off + 7];
    (ino, rec_len, name_len, file_type)
}

impl Ext2State {
    /// Materializes the directory's live records in storage order.
    ///
    /// `.` and `..` are ordinary records and are included.
    pub fn read_dir(&self, dir: &crate::disk::Inode) -> Result<Vec<DirRecord>, FsError> {
        let mut data = vec![0u8; dir.size as usize];
        self.read_inode_data(dir, 0, &mut data)?;

        let mut records = Vec::new();
        for block in data.chunks(self.block_size) {
            let mut off = 0;
            while off + DIRENT_HEADER_SIZE <= block.len() {
                let (ino, rec_len, name_len, file_type) = decode_header(block, off);
                if rec_len == 0 || rec_len % 4 != 0 || off + rec_len > block.len() {
                    return Err(FsError::Corrupted);
                }
                if ino != 0 {
                    let name_end = off + DIRENT_HEADER_SIZE + name_len;
                    if name_end > off + rec_len {
                        return Err(FsError::Corrupted);
                    }
                    if let Ok(name) =
                        core::str::from_utf8(&block[off + DIRENT_HEADER_SIZE..name_end])
                    {
                        records.push(DirRecord {
                            ino,
                            rec_len: rec_len as u16,
                            file_type,
                            name: name.to_string(),
                        });
                    }
                }
                off += rec_len;
            }
        }
        Ok(records)
    }

    /// Finds the live record named `name`.
    pub fn find_dir_entry(
        &self,
        dir: &crate::disk::Inode,
        name: &str,
    ) -> Result<Option<DirRecord>, FsError> {
        Ok(self.read_dir(dir)?.into_iter().find(|r| r.name == name))
    }

    /// Inserts a record for `child_ino` into the directory.
    ///
    /// Scans each block for a record with enough slack: a live record is
    /// shrunk to its aligned minimum and the new record takes the rest of
    /// its span; a deleted slot is reused whole. When no block has room, a
    /// fresh block is appended and the new record spans it entirely. The
    /// directory inode is persisted if it grew.
    pub fn add_dir_entry(
        &mut self,
        dir_ino: u32,
        dir: &mut crate::disk::Inode,
        name: &str,
        child_ino: u32,
        file_type: u8,
    ) -> Result<(), FsError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('/') {
            return Err(FsError::InvalidArgument);
        }
        let bs = self.block_size;
        let needed = dirent_used_len(name.len());
        let block_count = (dir.size as usize).div_ceil(bs) as u32;

        for block_index in 0..block_count {
            let Some(phys) = self.block_for_index(dir, block_index)? else {
                continue;
            };
            let mut block = self.read_block(phys)?;

            let mut off = 0;
            while off + DIRENT_HEADER_SIZE <= bs {
                let (ino, rec_len, name_len, _) = decode_header(&block, off);
                if rec_len == 0 || rec_len % 4 != 0 || off + rec_len > bs {
                    return Err(FsError::Corrupted);
                }

                let used = if ino == 0 { 0 } else { dirent_used_len(name_len) };
                if used > rec_len {
                    return Err(FsError::Corrupted);
                }
                if rec_len - used >= needed {
                    let (new_off, new_rec_len) = if ino == 0 {
                        (off, rec_len)
                    } else {
                        // Shrink the resident record to its minimum and
                        // take the slack.
                        put16(&mut block, off + 4, used as u16);
                        (off + used, rec_len - used)
                    };

                    write_record(&mut block, new_off, child_ino, new_rec_len, name, file_type);
                    return self.write_block(phys, &block);
                }

                off += rec_len;
            }
        }

        // Every block is packed: append one and let the new record span it.
        let phys = self.ensure_block_for_index(dir, block_count)?;
        let mut block = vec![0u8; bs];
        write_record(&mut block, 0, child_ino, bs, name, file_type);
        self.write_block(phys, &block)?;

        dir.size += bs as u32;
        self.write_inode(dir_ino, dir)
    }

    /// Removes the record named `name` and returns it.
    ///
    /// The span is merged into the preceding record of the same block, or
    /// the inode field is zeroed for a block-initial record.
    pub fn remove_dir_entry(
        &mut self,
        dir: &crate::disk::Inode,
        name: &str,
    ) -> Result<DirRecord, FsError> {
        let bs = self.block_size;
        let block_count = (dir.size as usize).div_ceil(bs) as u32;

        for block_index in 0..block_count {
            let Some(phys) = self.block_for_index(dir, block_index)? else {
                continue;
            };
            let mut block = self.read_block(phys)?;

            let mut off = 0;
            let mut prev_off: Option<usize> = None;
            while off + DIRENT_HEADER_SIZE <= bs {
                let (ino, rec_len, name_len, file_type) = decode_header(&block, off);
                if rec_len == 0 || rec_len % 4 != 0 || off + rec_len > bs {
                    return Err(FsError::Corrupted);
                }

                if ino != 0 {
                    let name_end = off + DIRENT_HEADER_SIZE + name_len;
                    if name_end > off + rec_len {
                        return Err(FsError::Corrupted);
                    }
                    let matches = core::str::from_utf8(
                        &block[off + DIRENT_HEADER_SIZE..name_end],
                    )
                    .is_ok_and(|n| n == name);

                    if matches {
                        let removed = DirRecord {
                            ino,
                            rec_len: rec_len as u16,
                            file_type,
                            name: name.to_string(),
                        };
                        match prev_off {
                            Some(prev) => {
                                // Absorb the span into the physically
                                // preceding record.
                                let prev_len = le16(&block, prev + 4) as usize;
                                put16(&mut block, prev + 4, (prev_len + rec_len) as u16);
                            }
                            None => put32(&mut block, off, 0),
                        }
                        self.write_block(phys, &block)?;
                        return Ok(removed);
                    }
                }

                prev_off = Some(off);
                off += rec_len;
            }
        }

        Err(FsError::NotFound)
    }
}

/// Writes a record header plus name at `off`; the caller guarantees
/// `rec_len` fits within the block.
fn write_record(block: &mut [u8], off: usize, ino: u32, rec_len: usize, name: &str, ft: u8) {
    put32(block, off, ino);
    put16(block, off + 4, rec_len as u16);
    block[off + 6] = name.len() as u8;
    block[off + 7] = ft;
    block[off + DIRENT_HEADER_SIZE..off + DIRENT_HEADER_SIZE + name.len()]
        .copy_from_slice(name.as_bytes());
}

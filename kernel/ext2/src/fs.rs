//! The mounted filesystem and its VFS nodes.
//!
//! [`Ext2Filesystem`] owns the volume state behind one lock; every
//! [`Ext2Node`] holds an `Arc` to that shared state plus its inode number,
//! so nodes stay cheap and there is no cycle between nodes and the
//! filesystem. Mounting flips the on-disk state to `ERROR_FS` and persists
//! it; a clean unmount restores `VALID_FS`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use alos_core::kinfo;
use alos_core::sync::SpinLock;
use alos_fs::FsError;
use alos_fs::block::{BlockDevice, SECTOR_SIZE};
use alos_fs::vfs::{
    DirEntry, FileSystem, FilesystemDriver, Inode as VfsNode, InodeType, Permissions,
};

use crate::current_time;
use crate::disk::{
    self, DIRENT_HEADER_SIZE, EXT2_MAGIC, GroupDesc, Inode, ROOT_INO, SUPERBLOCK_OFFSET,
    SUPERBLOCK_SIZE, Superblock, file_type, mode, put16, put32,
};
use crate::state::Ext2State;

/// Shared mounted-volume state.
struct Ext2Inner {
    state: SpinLock<Ext2State>,
}

/// A mounted ext2 volume.
pub struct Ext2Filesystem {
    inner: Arc<Ext2Inner>,
}

impl core::fmt::Debug for Ext2Filesystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ext2Filesystem").finish_non_exhaustive()
    }
}

impl Ext2Filesystem {
    /// Mounts the volume on `device`.
    ///
    /// Validates the superblock, caches the group-descriptor table, checks
    /// the free counters against it, then marks the volume dirty on disk so
    /// a crash before unmount is detectable.
    pub fn mount(device: Box<dyn BlockDevice>) -> Result<Self, FsError> {
        let mut sb_image = vec![0u8; SUPERBLOCK_SIZE];
        device.read_sectors(
            SUPERBLOCK_OFFSET / SECTOR_SIZE as u64,
            SUPERBLOCK_SIZE / SECTOR_SIZE,
            &mut sb_image,
        )?;

        let sb = Superblock::decode(&sb_image);
        if sb.magic != EXT2_MAGIC {
            return Err(FsError::Corrupted);
        }
        if sb.blocks_per_group == 0
            || sb.inodes_per_group == 0
            || sb.blocks_count <= sb.first_data_block
        {
            return Err(FsError::Corrupted);
        }

        let block_size = sb.block_size();
        let inode_size = sb.inode_record_size();
        let num_groups = sb.group_count();
        if sb.inodes_count.div_ceil(sb.inodes_per_group) != num_groups {
            return Err(FsError::Corrupted);
        }

        let mut st = Ext2State {
            device,
            sb,
            sb_image,
            groups: Vec::new(),
            block_size,
            inode_size,
            num_groups,
        };

        // Cache the whole group-descriptor table.
        let mut gdt = vec![0u8; num_groups as usize * disk::GROUP_DESC_SIZE];
        st.read_bytes(st.gdt_offset(), &mut gdt)?;
        st.groups = gdt
            .chunks_exact(disk::GROUP_DESC_SIZE)
            .map(GroupDesc::decode)
            .collect();

        // The free counters must agree with the descriptor table.
        let free_blocks: u32 = st.groups.iter().map(|g| g.free_blocks_count as u32).sum();
        let free_inodes: u32 = st.groups.iter().map(|g| g.free_inodes_count as u32).sum();
        if free_blocks != st.sb.free_blocks_count || free_inodes != st.sb.free_inodes_count {
            return Err(FsError::Corrupted);
        }

        // Mark mounted; a crash from here on leaves ERROR_FS on disk.
        st.sb.state = disk::state::ERROR_FS;
        st.sb.mtime = current_time();
        st.write_superblock()?;

        kinfo!(
            "ext2: mounted volume: {} blocks of {} bytes, {} inodes, {} groups",
            st.sb.blocks_count,
            block_size,
            st.sb.inodes_count,
            num_groups
        );

        Ok(Self {
            inner: Arc::new(Ext2Inner {
                state: SpinLock::new(st),
            }),
        })
    }

    /// Free blocks on the volume.
    pub fn free_blocks(&self) -> u32 {
        self.inner.state.lock().sb.free_blocks_count
    }

    /// Free inodes on the volume.
    pub fn free_inodes(&self) -> u32 {
        self.inner.state.lock().sb.free_inodes_count
    }

    fn node(inner: &Arc<Ext2Inner>, ino: u32, itype: InodeType) -> Arc<dyn VfsNode> {
        Arc::new(Ext2Node {
            inner: inner.clone(),
            ino,
            itype,
        })
    }
}

impl FileSystem for Ext2Filesystem {
    fn name(&self) -> &'static str {
        "ext2"
    }

    fn root(&self) -> Arc<dyn VfsNode> {
        Self::node(&self.inner, ROOT_INO, InodeType::Directory)
    }

    fn sync(&self) -> Result<(), FsError> {
        let mut st = self.inner.state.lock();
        for group in 0..st.num_groups {
            st.write_group_desc(group)?;
        }
        st.write_superblock()
    }

    fn unmount(&self) -> Result<(), FsError> {
        let mut st = self.inner.state.lock();
        st.sb.state = disk::state::VALID_FS;
        st.sb.wtime = current_time();
        st.write_superblock()
    }
}

/// A file or directory on a mounted ext2 volume.
pub struct Ext2Node {
    inner: Arc<Ext2Inner>,
    ino: u32,
    itype: InodeType,
}

impl Ext2Node {
    /// Resolves the VFS type of a directory record, falling back to the
    /// target inode's mode when the record carries no filetype byte.
    fn record_type(st: &Ext2State, rec: &disk::DirRecord) -> Result<InodeType, FsError> {
        match disk::file_type_to_inode_type(rec.file_type) {
            Some(t) => Ok(t),
            None => Ok(st.read_inode(rec.ino)?.inode_type()),
        }
    }
}

impl VfsNode for Ext2Node {
    fn inode_type(&self) -> InodeType {
        self.itype
    }

    fn size(&self) -> u64 {
        let st = self.inner.state.lock();
        st.read_inode(self.ino).map(|i| i.size as u64).unwrap_or(0)
    }

    fn permissions(&self) -> Permissions {
        let st = self.inner.state.lock();
        let bits = st.read_inode(self.ino).map(|i| i.mode & 0o777).unwrap_or(0);
        Permissions::from_bits_truncate(bits)
    }

    fn ino(&self) -> u32 {
        self.ino
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let st = self.inner.state.lock();
        let inode = st.read_inode(self.ino)?;
        if inode.is_dir() {
            return Err(FsError::NotAFile);
        }
        st.read_inode_data(&inode, offset, buf)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        let mut st = self.inner.state.lock();
        let mut inode = st.read_inode(self.ino)?;
        if inode.is_dir() {
            return Err(FsError::NotAFile);
        }
        st.write_inode_data(self.ino, &mut inode, offset, buf)
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        let st = self.inner.state.lock();
        let dir = st.read_inode(self.ino)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let rec = st.find_dir_entry(&dir, name)?.ok_or(FsError::NotFound)?;
        let itype = Self::record_type(&st, &rec)?;
        Ok(Ext2Filesystem::node(&self.inner, rec.ino, itype))
    }

    fn readdir(&self) -> Result<Vec<DirEntry>, FsError> {
        let st = self.inner.state.lock();
        let dir = st.read_inode(self.ino)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let mut entries = Vec::new();
        for rec in st.read_dir(&dir)? {
            let itype = Self::record_type(&st, &rec)?;
            entries.push(DirEntry {
                ino: rec.ino,
                name: rec.name,
                inode_type: itype,
            });
        }
        Ok(entries)
    }

    fn create(
        &self,
        name: &str,
        itype: InodeType,
        perms: Permissions,
    ) -> Result<Arc<dyn VfsNode>, FsError> {
        let mut st = self.inner.state.lock();
        let mut parent = st.read_inode(self.ino)?;
        if !parent.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if st.find_dir_entry(&parent, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        match itype {
            InodeType::File => create_file(&mut st, self.ino, &mut parent, name, perms),
            InodeType::Directory => create_dir(&mut st, self.ino, &mut parent, name, perms),
            _ => Err(FsError::NotSupported),
        }
        .map(|ino| Ext2Filesystem::node(&self.inner, ino, itype))
    }

    fn unlink(&self, name: &str) -> Result<(), FsError> {
        if name == "." || name == ".." {
            return Err(FsError::InvalidArgument);
        }

        let mut st = self.inner.state.lock();
        let mut parent = st.read_inode(self.ino)?;
        if !parent.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let rec = st.find_dir_entry(&parent, name)?.ok_or(FsError::NotFound)?;
        if rec.ino == ROOT_INO {
            return Err(FsError::InvalidArgument);
        }
        let mut target = st.read_inode(rec.ino)?;

        if target.is_dir() {
            // Only `.` and `..` may remain.
            if st
                .read_dir(&target)?
                .iter()
                .any(|r| r.name != "." && r.name != "..")
            {
                return Err(FsError::NotEmpty);
            }

            st.remove_dir_entry(&parent, name)?;
            st.truncate_inode(&mut target)?;
            target.links_count = 0;
            target.dtime = current_time();
            st.write_inode(rec.ino, &target)?;
            st.free_inode(rec.ino, true)?;

            // The child's `..` no longer references the parent.
            parent.links_count = parent.links_count.saturating_sub(1);
            st.write_inode(self.ino, &parent)?;
        } else {
            st.remove_dir_entry(&parent, name)?;
            target.links_count = target.links_count.saturating_sub(1);
            if target.links_count == 0 {
                st.truncate_inode(&mut target)?;
                target.dtime = current_time();
                st.write_inode(rec.ino, &target)?;
                st.free_inode(rec.ino, false)?;
            } else {
                st.write_inode(rec.ino, &target)?;
            }
        }

        Ok(())
    }
}

/// Allocates and links a regular file inode. Returns the inode number.
fn create_file(
    st: &mut Ext2State,
    parent_ino: u32,
    parent: &mut Inode,
    name: &str,
    perms: Permissions,
) -> Result<u32, FsError> {
    let ino = st.allocate_inode(false)?;
    let now = current_time();
    let inode = Inode {
        mode: mode::S_IFREG | (perms.bits() & 0o777),
        links_count: 1,
        atime: now,
        ctime: now,
        mtime: now,
        ..Inode::default()
    };
    st.write_inode(ino, &inode)?;

    if let Err(e) = st.add_dir_entry(parent_ino, parent, name, ino, file_type::REG_FILE) {
        let _ = st.free_inode(ino, false);
        return Err(e);
    }
    Ok(ino)
}

/// Allocates a directory inode with its `.`/`..` block and links it.
/// Returns the inode number.
fn create_dir(
    st: &mut Ext2State,
    parent_ino: u32,
    parent: &mut Inode,
    name: &str,
    perms: Permissions,
) -> Result<u32, FsError> {
    let ino = st.allocate_inode(true)?;
    let block = match st.allocate_block() {
        Ok(b) => b,
        Err(e) => {
            let _ = st.free_inode(ino, true);
            return Err(e);
        }
    };

    // `.` and `..` tile the first block exactly.
    let bs = st.block_size;
    let mut data = vec![0u8; bs];
    put32(&mut data, 0, ino);
    put16(&mut data, 4, 12);
    data[6] = 1;
    data[7] = file_type::DIR;
    data[DIRENT_HEADER_SIZE] = b'.';

    put32(&mut data, 12, parent_ino);
    put16(&mut data, 16, (bs - 12) as u16);
    data[18] = 2;
    data[19] = file_type::DIR;
    data[12 + DIRENT_HEADER_SIZE] = b'.';
    data[12 + DIRENT_HEADER_SIZE + 1] = b'.';

    let now = current_time();
    let mut inode = Inode {
        mode: mode::S_IFDIR | (perms.bits() & 0o777),
        links_count: 2, // its own `.` plus the parent's record
        size: bs as u32,
        blocks: (bs / 512) as u32,
        atime: now,
        ctime: now,
        mtime: now,
        ..Inode::default()
    };
    inode.block[0] = block;

    let mut commit = st.write_block(block, &data);
    if commit.is_ok() {
        commit = st.write_inode(ino, &inode);
    }
    if commit.is_ok() {
        commit = st.add_dir_entry(parent_ino, parent, name, ino, file_type::DIR);
    }
    if let Err(e) = commit {
        let _ = st.free_block(block);
        let _ = st.free_inode(ino, true);
        return Err(e);
    }

    // The child's `..` adds a reference to the parent.
    parent.links_count += 1;
    st.write_inode(parent_ino, parent)?;
    Ok(ino)
}

/// The registered driver: probes and mounts ext2 volumes.
pub struct Ext2Driver;

impl FilesystemDriver for Ext2Driver {
    fn name(&self) -> &'static str {
        "ext2"
    }

    fn mount(&self, device: Box<dyn BlockDevice>) -> Result<Arc<dyn FileSystem>, FsError> {
        Ok(Arc::new(Ext2Filesystem::mount(device)?))
    }
}

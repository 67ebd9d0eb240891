//! In-memory filesystem backed by heap allocations.
//!
//! `RamFs` provides a simple filesystem where all data lives on the kernel
//! heap. Used for early-boot scratch storage and as the reference
//! implementation of the [`Inode`] capability trait.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use alos_core::sync::SpinLock;

use crate::vfs::{DirEntry, FileSystem, Inode, InodeType, Permissions};
use crate::FsError;

/// A ramfs filesystem instance.
pub struct RamFs {
    /// The root directory inode.
    root: Arc<RamInode>,
}

/// Source of inode numbers for ramfs nodes (diagnostic only).
static NEXT_INO: AtomicU32 = AtomicU32::new(1);

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl RamFs {
    /// Creates a new ramfs with an empty root directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Arc::new(RamInode::new(InodeType::Directory, Permissions::default_dir())),
        }
    }
}

impl FileSystem for RamFs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn root(&self) -> Arc<dyn Inode> {
        self.root.clone()
    }
}

/// A ramfs inode (file or directory).
pub struct RamInode {
    /// Inode number (unique per boot, diagnostic only).
    ino: u32,
    /// Inode type.
    itype: InodeType,
    /// File data (only meaningful for files).
    data: SpinLock<Vec<u8>>,
    /// Child entries (only meaningful for directories).
    children: SpinLock<BTreeMap<String, Arc<RamInode>>>,
    /// Permissions.
    permissions: Permissions,
}

impl RamInode {
    fn new(itype: InodeType, permissions: Permissions) -> Self {
        Self {
            ino: NEXT_INO.fetch_add(1, Ordering::Relaxed),
            itype,
            data: SpinLock::new(Vec::new()),
            children: SpinLock::new(BTreeMap::new()),
            permissions,
        }
    }
}

impl Inode for RamInode {
    fn inode_type(&self) -> InodeType {
        self.itype
    }

    fn size(&self) -> u64 {
        match self.itype {
            InodeType::File | InodeType::Symlink => self.data.lock().len() as u64,
            _ => 0,
        }
    }

    fn permissions(&self) -> Permissions {
        self.permissions
    }

    fn ino(&self) -> u32 {
        self.ino
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        if self.itype == InodeType::Directory {
            return Err(FsError::NotAFile);
        }
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let available = &data[offset..];
        let to_copy = buf.len().min(available.len());
        buf[..to_copy].copy_from_slice(&available[..to_copy]);
        Ok(to_copy)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        if self.itype == InodeType::Directory {
            return Err(FsError::NotAFile);
        }
        let mut data = self.data.lock();
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn Inode>, FsError> {
        if self.itype != InodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        let children = self.children.lock();
        children
            .get(name)
            .cloned()
            .map(|n| n as Arc<dyn Inode>)
            .ok_or(FsError::NotFound)
    }

    fn readdir(&self) -> Result<Vec<DirEntry>, FsError> {
        if self.itype != InodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        let children = self.children.lock();
        Ok(children
            .iter()
            .map(|(name, inode)| DirEntry {
                ino: inode.ino,
                name: name.clone(),
                inode_type: inode.itype,
            })
            .collect())
    }

    fn create(
        &self,
        name: &str,
        itype: InodeType,
        perms: Permissions,
    ) -> Result<Arc<dyn Inode>, FsError> {
        if self.itype != InodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        let mut children = self.children.lock();
        if children.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        let new_inode = Arc::new(RamInode::new(itype, perms));
        children.insert(name.to_string(), new_inode.clone());
        Ok(new_inode as Arc<dyn Inode>)
    }

    fn unlink(&self, name: &str) -> Result<(), FsError> {
        if self.itype != InodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        let mut children = self.children.lock();
        if let Some(child) = children.get(name) {
            if child.itype == InodeType::Directory && !child.children.lock().is_empty() {
                return Err(FsError::NotEmpty);
            }
        }
        children.remove(name).ok_or(FsError::NotFound)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_duplicates() {
        let fs = RamFs::new();
        let root = fs.root();
        root.create("f", InodeType::File, Permissions::default_file())
            .unwrap();
        assert!(matches!(
            root.create("f", InodeType::File, Permissions::default_file()),
            Err(FsError::AlreadyExists)
        ));
    }

    #[test]
    fn read_past_end_returns_zero() {
        let fs = RamFs::new();
        let root = fs.root();
        let f = root
            .create("f", InodeType::File, Permissions::default_file())
            .unwrap();
        f.write(0, b"abc").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(f.read(3, &mut buf).unwrap(), 0);
        assert_eq!(f.read(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let fs = RamFs::new();
        let root = fs.root();
        let f = root
            .create("f", InodeType::File, Permissions::default_file())
            .unwrap();
        f.write(4, b"xy").unwrap();
        assert_eq!(f.size(), 6);

        let mut buf = [0xFFu8; 6];
        f.read(0, &mut buf).unwrap();
        assert_eq!(&buf, &[0, 0, 0, 0, b'x', b'y']);
    }

    #[test]
    fn unlink_nonempty_dir_rejected() {
        let fs = RamFs::new();
        let root = fs.root();
        let dir = root
            .create("d", InodeType::Directory, Permissions::default_dir())
            .unwrap();
        dir.create("inner", InodeType::File, Permissions::default_file())
            .unwrap();

        assert_eq!(root.unlink("d").unwrap_err(), FsError::NotEmpty);
        dir.unlink("inner").unwrap();
        root.unlink("d").unwrap();
    }
}

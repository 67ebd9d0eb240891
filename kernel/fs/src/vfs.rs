//! VFS traits, mount table and path resolution.
//!
//! A filesystem object is an [`Inode`] behind an `Arc`; the trait's methods
//! are capabilities, defaulting to [`FsError::NotSupported`] so drivers only
//! implement what they have. The [`Vfs`] maintains the driver registry and
//! the mount table, resolves absolute paths by longest-matching mount point
//! and walks the remaining components via [`Inode::lookup`].

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::block::BlockDevice;
use crate::path;
use crate::FsError;

/// Maximum number of simultaneous mounts.
pub const MAX_MOUNTS: usize = 8;

/// The type of a filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Character device.
    CharDevice,
    /// Block device.
    BlockDevice,
    /// Named pipe.
    Fifo,
    /// Symbolic link.
    Symlink,
}

bitflags::bitflags! {
    /// POSIX-style permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u16 {
        /// Owner read.
        const OWNER_READ   = 0o400;
        /// Owner write.
        const OWNER_WRITE  = 0o200;
        /// Owner execute.
        const OWNER_EXEC   = 0o100;
        /// Group read.
        const GROUP_READ   = 0o040;
        /// Group write.
        const GROUP_WRITE  = 0o020;
        /// Group execute.
        const GROUP_EXEC   = 0o010;
        /// Other read.
        const OTHER_READ   = 0o004;
        /// Other write.
        const OTHER_WRITE  = 0o002;
        /// Other execute.
        const OTHER_EXEC   = 0o001;
    }
}

impl Permissions {
    /// Default permissions for new files: `rw-r--r--`.
    pub fn default_file() -> Self {
        Self::OWNER_READ | Self::OWNER_WRITE | Self::GROUP_READ | Self::OTHER_READ
    }

    /// Default permissions for new directories: `rwxr-xr-x`.
    pub fn default_dir() -> Self {
        Self::default_file() | Self::OWNER_EXEC | Self::GROUP_EXEC | Self::OTHER_EXEC
    }
}

/// A directory entry as returned by [`Inode::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode number within the owning filesystem.
    pub ino: u32,
    /// Entry name (no separators).
    pub name: String,
    /// Entry type.
    pub inode_type: InodeType,
}

/// A filesystem object: file, directory, device node...
///
/// Methods are optional capabilities; the default implementations return
/// [`FsError::NotSupported`]. Reference counting is the `Arc` holding the
/// node; a driver's private state hangs off the implementing type and is
/// released when the last reference drops.
pub trait Inode: Send + Sync {
    /// The object's type.
    fn inode_type(&self) -> InodeType;

    /// Object size in bytes (0 for most non-files).
    fn size(&self) -> u64;

    /// Permission bits.
    fn permissions(&self) -> Permissions;

    /// Inode number within the owning filesystem.
    fn ino(&self) -> u32;

    /// Called when a path-level open hands out this node.
    fn open(&self) -> Result<(), FsError> {
        Ok(())
    }

    /// Called when the caller is done with the node.
    fn close(&self) -> Result<(), FsError> {
        Ok(())
    }

    /// Reads up to `buf.len()` bytes starting at byte `offset`.
    ///
    /// Returns the number of bytes read; 0 at or past end of file.
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, FsError> {
        Err(FsError::NotSupported)
    }

    /// Writes `buf` at byte `offset`, extending the object as needed.
    ///
    /// Returns the number of bytes written; a short count signals partial
    /// success (e.g. the volume filled up mid-write).
    fn write(&self, _offset: u64, _buf: &[u8]) -> Result<usize, FsError> {
        Err(FsError::NotSupported)
    }

    /// Looks up `name` in this directory.
    fn lookup(&self, _name: &str) -> Result<Arc<dyn Inode>, FsError> {
        Err(FsError::NotSupported)
    }

    /// Returns this directory's live entries in directory order.
    fn readdir(&self) -> Result<Vec<DirEntry>, FsError> {
        Err(FsError::NotSupported)
    }

    /// Creates a child of the given type in this directory.
    fn create(
        &self,
        _name: &str,
        _itype: InodeType,
        _perms: Permissions,
    ) -> Result<Arc<dyn Inode>, FsError> {
        Err(FsError::NotSupported)
    }

    /// Removes the child `name` from this directory.
    fn unlink(&self, _name: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }
}

/// A mounted filesystem instance.
pub trait FileSystem: Send + Sync {
    /// Driver name, e.g. `"ext2"`.
    fn name(&self) -> &'static str;

    /// The root directory node.
    fn root(&self) -> Arc<dyn Inode>;

    /// Flushes pending state to the device.
    fn sync(&self) -> Result<(), FsError> {
        Ok(())
    }

    /// Called by the VFS when the filesystem is unmounted.
    fn unmount(&self) -> Result<(), FsError> {
        Ok(())
    }
}

/// A registered filesystem driver: knows how to mount a block device.
pub trait FilesystemDriver: Send + Sync {
    /// Driver name used by [`Vfs::mount`], e.g. `"ext2"`.
    fn name(&self) -> &'static str;

    /// Probes and mounts the device.
    fn mount(&self, device: Box<dyn BlockDevice>) -> Result<Arc<dyn FileSystem>, FsError>;
}

/// The virtual filesystem: driver registry plus mount table.
pub struct Vfs {
    /// Registered drivers, looked up by name at mount time.
    drivers: Vec<Box<dyn FilesystemDriver>>,
    /// Mount points mapping path -> filesystem.
    mounts: BTreeMap<String, Arc<dyn FileSystem>>,
}

impl Vfs {
    /// Creates an empty VFS.
    pub fn new() -> Self {
        Self {
            drivers: Vec::new(),
            mounts: BTreeMap::new(),
        }
    }

    /// Registers a filesystem driver.
    pub fn register_driver(&mut self, driver: Box<dyn FilesystemDriver>) {
        self.drivers.push(driver);
    }

    /// Mounts `device` at `mount_path` using the driver named `fs_name`.
    ///
    /// Mounting at `/` establishes the VFS root.
    pub fn mount(
        &mut self,
        mount_path: &str,
        fs_name: &str,
        device: Box<dyn BlockDevice>,
    ) -> Result<(), FsError> {
        let driver = self
            .drivers
            .iter()
            .find(|d| d.name() == fs_name)
            .ok_or(FsError::NotFound)?;
        let fs = driver.mount(device)?;
        self.mount_filesystem(mount_path, fs)
    }

    /// Mounts an already-constructed filesystem at `mount_path`.
    pub fn mount_filesystem(
        &mut self,
        mount_path: &str,
        fs: Arc<dyn FileSystem>,
    ) -> Result<(), FsError> {
        path::validate(mount_path)?;
        if self.mounts.contains_key(mount_path) {
            return Err(FsError::AlreadyMounted);
        }
        if self.mounts.len() >= MAX_MOUNTS {
            return Err(FsError::NoMountSlot);
        }
        self.mounts.insert(mount_path.to_string(), fs);
        Ok(())
    }

    /// Unmounts the filesystem at `mount_path`, invoking its unmount hook.
    pub fn unmount(&mut self, mount_path: &str) -> Result<(), FsError> {
        let fs = self.mounts.remove(mount_path).ok_or(FsError::NotFound)?;
        fs.unmount()
    }

    /// Resolves an absolute path to an inode.
    ///
    /// Finds the longest mount prefix, obtains the root inode, then walks
    /// the remaining path components via `lookup`. `.` and `..` are ordinary
    /// entries stored by the filesystem; resolution simply follows them.
    pub fn resolve(&self, abs_path: &str) -> Result<Arc<dyn Inode>, FsError> {
        if abs_path == "/" {
            let fs = self.mounts.get("/").ok_or(FsError::NotFound)?;
            return Ok(fs.root());
        }
        path::validate(abs_path)?;

        let mount_path =
            path::longest_prefix_match(abs_path, self.mounts.keys().map(String::as_str))
                .ok_or(FsError::NotFound)?;

        let fs = self.mounts.get(mount_path).ok_or(FsError::NotFound)?;
        let root = fs.root();

        let remainder = path::strip_mount_prefix(abs_path, mount_path);
        if remainder.is_empty() {
            return Ok(root);
        }

        let mut current = root;
        for component in path::components(remainder) {
            current = current.lookup(component)?;
        }

        Ok(current)
    }

    /// Resolves `path` and invokes the node's open hook.
    pub fn open(&self, abs_path: &str) -> Result<Arc<dyn Inode>, FsError> {
        let node = self.resolve(abs_path)?;
        node.open()?;
        Ok(node)
    }

    /// Invokes the node's close hook.
    pub fn close(&self, node: &Arc<dyn Inode>) -> Result<(), FsError> {
        node.close()
    }

    /// Reads from the file at `abs_path`.
    pub fn read(&self, abs_path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let node = self.resolve(abs_path)?;
        if node.inode_type() == InodeType::Directory {
            return Err(FsError::NotAFile);
        }
        node.read(offset, buf)
    }

    /// Writes to the file at `abs_path`.
    ///
    /// Directory targets are rejected here, before the driver sees them.
    pub fn write(&self, abs_path: &str, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        let node = self.resolve(abs_path)?;
        if node.inode_type() == InodeType::Directory {
            return Err(FsError::NotAFile);
        }
        node.write(offset, buf)
    }

    /// Reads the directory at `abs_path`.
    pub fn readdir(&self, abs_path: &str) -> Result<Vec<DirEntry>, FsError> {
        let node = self.resolve(abs_path)?;
        if node.inode_type() != InodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        node.readdir()
    }

    /// Creates a regular file at `abs_path`.
    pub fn create(&self, abs_path: &str) -> Result<Arc<dyn Inode>, FsError> {
        let parent = self.resolve_parent(abs_path)?;
        let (_, name) = path::split_parent(abs_path)?;
        parent.create(name, InodeType::File, Permissions::default_file())
    }

    /// Creates a directory at `abs_path`.
    pub fn mkdir(&self, abs_path: &str) -> Result<Arc<dyn Inode>, FsError> {
        let parent = self.resolve_parent(abs_path)?;
        let (_, name) = path::split_parent(abs_path)?;
        parent.create(name, InodeType::Directory, Permissions::default_dir())
    }

    /// Removes the object at `abs_path`.
    pub fn unlink(&self, abs_path: &str) -> Result<(), FsError> {
        let parent = self.resolve_parent(abs_path)?;
        let (_, name) = path::split_parent(abs_path)?;
        parent.unlink(name)
    }

    /// Removes the directory at `abs_path` (same path as [`Vfs::unlink`];
    /// drivers enforce emptiness).
    pub fn rmdir(&self, abs_path: &str) -> Result<(), FsError> {
        self.unlink(abs_path)
    }

    /// Resolves the parent directory of `abs_path` and verifies it is a
    /// directory.
    fn resolve_parent(&self, abs_path: &str) -> Result<Arc<dyn Inode>, FsError> {
        path::validate(abs_path)?;
        let (parent_path, _) = path::split_parent(abs_path)?;
        let parent = self.resolve(parent_path)?;
        if parent.inode_type() != InodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        Ok(parent)
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramfs::RamFs;

    fn vfs_with_root() -> Vfs {
        let mut vfs = Vfs::new();
        vfs.mount_filesystem("/", Arc::new(RamFs::new())).unwrap();
        vfs
    }

    #[test]
    fn resolve_root() {
        let vfs = vfs_with_root();
        let root = vfs.resolve("/").unwrap();
        assert_eq!(root.inode_type(), InodeType::Directory);
    }

    #[test]
    fn resolve_without_root_mount_fails() {
        let vfs = Vfs::new();
        assert!(matches!(vfs.resolve("/"), Err(FsError::NotFound)));
    }

    #[test]
    fn resolve_rejects_relative_paths() {
        let vfs = vfs_with_root();
        assert!(matches!(
            vfs.resolve("etc/passwd"),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn create_then_resolve_is_file() {
        let vfs = vfs_with_root();
        vfs.create("/hello.txt").unwrap();
        let node = vfs.resolve("/hello.txt").unwrap();
        assert_eq!(node.inode_type(), InodeType::File);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let vfs = vfs_with_root();
        vfs.create("/data").unwrap();
        assert_eq!(vfs.write("/data", 0, b"ALOS").unwrap(), 4);

        let mut buf = [0u8; 4];
        assert_eq!(vfs.read("/data", 0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ALOS");
    }

    #[test]
    fn write_to_directory_rejected() {
        let vfs = vfs_with_root();
        vfs.mkdir("/dir").unwrap();
        assert_eq!(vfs.write("/dir", 0, b"x"), Err(FsError::NotAFile));
    }

    #[test]
    fn mkdir_and_nested_create() {
        let vfs = vfs_with_root();
        vfs.mkdir("/a").unwrap();
        vfs.mkdir("/a/b").unwrap();
        vfs.create("/a/b/f").unwrap();

        let node = vfs.resolve("/a/b/f").unwrap();
        assert_eq!(node.inode_type(), InodeType::File);
    }

    #[test]
    fn consecutive_separators_collapse() {
        let vfs = vfs_with_root();
        vfs.mkdir("/a").unwrap();
        vfs.create("/a/f").unwrap();
        assert!(vfs.resolve("//a///f").is_ok());
    }

    #[test]
    fn unlink_removes_entry() {
        let vfs = vfs_with_root();
        vfs.create("/gone").unwrap();
        vfs.unlink("/gone").unwrap();
        assert!(matches!(vfs.resolve("/gone"), Err(FsError::NotFound)));
    }

    #[test]
    fn readdir_lists_entries() {
        let vfs = vfs_with_root();
        vfs.create("/x").unwrap();
        vfs.mkdir("/y").unwrap();
        let entries = vfs.readdir("/").unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"x"));
        assert!(names.contains(&"y"));
    }

    #[test]
    fn readdir_on_file_fails() {
        let vfs = vfs_with_root();
        vfs.create("/f").unwrap();
        assert_eq!(vfs.readdir("/f"), Err(FsError::NotADirectory));
    }

    #[test]
    fn mount_same_path_twice_fails() {
        let mut vfs = vfs_with_root();
        let err = vfs
            .mount_filesystem("/", Arc::new(RamFs::new()))
            .unwrap_err();
        assert_eq!(err, FsError::AlreadyMounted);
    }

    #[test]
    fn mount_table_capacity() {
        let mut vfs = vfs_with_root();
        for i in 1..MAX_MOUNTS {
            let path = alloc::format!("/m{i}");
            vfs.mkdir(&path).unwrap();
            vfs.mount_filesystem(&path, Arc::new(RamFs::new())).unwrap();
        }
        vfs.mkdir("/overflow").unwrap();
        let err = vfs
            .mount_filesystem("/overflow", Arc::new(RamFs::new()))
            .unwrap_err();
        assert_eq!(err, FsError::NoMountSlot);
    }

    #[test]
    fn nested_mount_resolution() {
        let mut vfs = vfs_with_root();
        vfs.mkdir("/mnt").unwrap();
        let sub = Arc::new(RamFs::new());
        vfs.mount_filesystem("/mnt", sub).unwrap();

        vfs.create("/mnt/inner").unwrap();
        assert!(vfs.resolve("/mnt/inner").is_ok());
        // The file lives on the submount, not the root fs.
        let root_entries = vfs.readdir("/").unwrap();
        assert!(root_entries.iter().all(|e| e.name != "inner"));
    }

    #[test]
    fn unmount_calls_hook_and_releases_slot() {
        let mut vfs = vfs_with_root();
        vfs.mkdir("/mnt").unwrap();
        vfs.mount_filesystem("/mnt", Arc::new(RamFs::new())).unwrap();

        vfs.unmount("/mnt").unwrap();
        assert_eq!(vfs.unmount("/mnt"), Err(FsError::NotFound));
        // Slot is reusable.
        vfs.mount_filesystem("/mnt", Arc::new(RamFs::new())).unwrap();
    }

    #[test]
    fn unknown_driver_name_fails() {
        let mut vfs = Vfs::new();
        let disk = Box::new(crate::block::RamDisk::new(8));
        assert_eq!(vfs.mount("/", "nofs", disk), Err(FsError::NotFound));
    }
}

//! Global VFS wiring.
//!
//! Owns the single [`Vfs`] instance, registers the filesystem drivers the
//! kernel ships, and mounts the root volume.

use alloc::boxed::Box;

use alos_core::kinfo;
use alos_core::sync::SpinLock;
use alos_ext2::Ext2Driver;
use alos_fs::block::BlockDevice;
use alos_fs::{FsError, Vfs};

/// Global VFS instance.
static VFS: SpinLock<Option<Vfs>> = SpinLock::new(None);

/// Initializes the global VFS and registers the built-in drivers.
///
/// # Panics
///
/// Panics if the VFS has already been initialized.
pub fn init() {
    let mut vfs = Vfs::new();
    vfs.register_driver(Box::new(Ext2Driver));

    let mut global = VFS.lock();
    assert!(global.is_none(), "VFS already initialized");
    *global = Some(vfs);
}

/// Executes a closure with a shared reference to the global VFS.
///
/// # Panics
///
/// Panics if the VFS has not been initialized.
pub fn with_vfs<R>(f: impl FnOnce(&Vfs) -> R) -> R {
    let vfs = VFS.lock();
    f(vfs.as_ref().expect("VFS not initialized"))
}

/// Executes a closure with a mutable reference to the global VFS.
///
/// # Panics
///
/// Panics if the VFS has not been initialized.
pub fn with_vfs_mut<R>(f: impl FnOnce(&mut Vfs) -> R) -> R {
    let mut vfs = VFS.lock();
    f(vfs.as_mut().expect("VFS not initialized"))
}

/// Mounts `device` as the ext2 root filesystem.
pub fn mount_root(device: Box<dyn BlockDevice>) -> Result<(), FsError> {
    with_vfs_mut(|vfs| vfs.mount("/", "ext2", device))?;
    kinfo!("vfs: mounted ext2 root");
    Ok(())
}

/// Unmounts the root filesystem (flushing the clean-state flag to disk).
pub fn unmount_root() -> Result<(), FsError> {
    with_vfs_mut(|vfs| vfs.unmount("/"))
}

//! Virtual filesystem layer.
//!
//! Defines the error taxonomy ([`FsError`]), path utilities ([`path`]), the
//! synchronous block device contract ([`block`]), and the VFS proper
//! ([`vfs`]): inode and filesystem traits, the driver registry, the mount
//! table and path-level operations.

#![no_std]

#[cfg(test)]
extern crate std;

extern crate alloc;

pub mod block;
pub mod path;
pub mod ramfs;
pub mod vfs;

mod error;

pub use error::FsError;
pub use vfs::{
    DirEntry, FileSystem, FilesystemDriver, Inode, InodeType, Permissions, Vfs,
};

//! Filesystem error taxonomy.

use core::fmt;

use crate::block::IoError;

/// Errors reported by the VFS and filesystem drivers.
///
/// Drivers surface block-device failures as [`FsError::Io`]; the VFS
/// forwards driver errors verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Heap allocation failed.
    NoMemory,
    /// The volume has no free block or inode left.
    NoSpace,
    /// Path component, inode, or mount not present.
    NotFound,
    /// A directory operation hit a non-directory.
    NotADirectory,
    /// A file operation hit a directory.
    NotAFile,
    /// The filesystem driver lacks the requested capability.
    NotSupported,
    /// Null/empty name, relative path, oversized component.
    InvalidArgument,
    /// The underlying block device failed.
    Io,
    /// Magic mismatch, zero record length mid-directory, counter desync.
    Corrupted,
    /// A filesystem is already mounted at the path.
    AlreadyMounted,
    /// The mount table is full.
    NoMountSlot,
    /// The name already exists in the directory.
    AlreadyExists,
    /// Directory is not empty.
    NotEmpty,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => f.write_str("out of memory"),
            Self::NoSpace => f.write_str("no space left on volume"),
            Self::NotFound => f.write_str("not found"),
            Self::NotADirectory => f.write_str("not a directory"),
            Self::NotAFile => f.write_str("not a file"),
            Self::NotSupported => f.write_str("operation not supported"),
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::Io => f.write_str("I/O error"),
            Self::Corrupted => f.write_str("filesystem corrupted"),
            Self::AlreadyMounted => f.write_str("path already mounted"),
            Self::NoMountSlot => f.write_str("mount table full"),
            Self::AlreadyExists => f.write_str("already exists"),
            Self::NotEmpty => f.write_str("directory not empty"),
        }
    }
}

impl From<IoError> for FsError {
    fn from(_: IoError) -> Self {
        Self::Io
    }
}

//! ext2 filesystem driver.
//!
//! Implements the classic ext2 on-disk format (revision 0 and 1) over the
//! sector-level [`BlockDevice`](alos_fs::block::BlockDevice) contract:
//! superblock and cached group-descriptor table, block/inode bitmap
//! allocators, direct/indirect/doubly-indirect block mapping (triple
//! indirect on the read path), byte-granular file read/write, and
//! variable-length directory records.
//!
//! Module split:
//!
//! - [`disk`] — bit-exact on-disk record codecs and format constants.
//! - `io` — byte- and block-granular device access.
//! - `balloc` — block and inode bitmap allocators with counter rollback.
//! - `inode` — inode records, logical-to-physical block mapping, data paths.
//! - `dir` — directory record scanning, insertion and removal.
//! - [`fs`] — the mounted filesystem and its VFS nodes.
//!
//! While a volume is mounted its on-disk state is flipped to
//! [`disk::state::ERROR_FS`]; a clean unmount restores
//! [`disk::state::VALID_FS`], so a crash in between is detectable.

#![no_std]

#[cfg(test)]
extern crate std;

extern crate alloc;

pub mod disk;
pub mod fs;

mod balloc;
mod dir;
mod inode;
mod io;
mod state;

pub use fs::{Ext2Driver, Ext2Filesystem, Ext2Node};

use core::sync::atomic::{AtomicPtr, Ordering};

/// The signature of the wall-clock source used for inode timestamps.
pub type ClockFn = fn() -> u32;

fn zero_clock() -> u32 {
    0
}

static CLOCK_FN: AtomicPtr<()> = AtomicPtr::new(zero_clock as *mut ());

/// Registers the wall-clock source (seconds since the Unix epoch).
///
/// Until registration, timestamps are written as 0.
pub fn set_clock(f: ClockFn) {
    CLOCK_FN.store(f as *mut (), Ordering::Release);
}

pub(crate) fn current_time() -> u32 {
    let ptr = CLOCK_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `ClockFn` pointers (or the initial `zero_clock`)
    // are ever stored into CLOCK_FN.
    let f: ClockFn = unsafe { core::mem::transmute(ptr) };
    f()
}

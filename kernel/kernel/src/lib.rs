//! Kernel-side wiring for the ALOS core subsystems.
//!
//! The boot stub converts the loader's tables into the [`boot::BootInfo`]
//! contract and calls [`init_memory`], after which the PMM, VMM and kernel
//! heap globals are live and `alloc` works. [`fs::init`] then brings up the
//! VFS and [`fs::mount_root`] attaches the ext2 root volume.
//!
//! Interrupt and trap glue stays in the boot crate; the page fault policy
//! it dispatches to lives in [`mm::fault`].

#![no_std]

#[cfg(test)]
extern crate std;

extern crate alloc;

pub mod boot;
pub mod fs;
pub mod mm;

use boot::BootInfo;

/// Brings up physical memory, the kernel virtual address space and the
/// heap, in that order.
///
/// # Panics
///
/// Panics if any subsystem is already initialized or if the boot memory
/// map is unusable; there is nothing to fall back to this early.
pub fn init_memory(boot_info: &impl BootInfo) {
    mm::hhdm::init(boot_info.hhdm_offset());
    mm::pmm::init(boot_info);
    mm::vmm::init(boot_info);
    mm::heap::init();
}

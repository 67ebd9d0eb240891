//! Thin wrappers over privileged x86_64 instructions.

use core::arch::asm;

use crate::addr::{PhysAddr, VirtAddr};

/// Invalidates the TLB entry for the page containing `virt`.
#[inline]
pub fn invlpg(virt: VirtAddr) {
    // SAFETY: `invlpg` only evicts a TLB entry; it cannot violate memory
    // safety on its own.
    unsafe {
        asm!("invlpg [{}]", in(reg) virt.as_u64(), options(nostack, preserves_flags));
    }
}

/// Reads CR2, which holds the faulting linear address during a page fault.
#[inline]
pub fn read_cr2() -> VirtAddr {
    let value: u64;
    // SAFETY: Reading CR2 has no side effects.
    unsafe {
        asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    VirtAddr::new_truncate(value)
}

/// Loads `root` into CR3, switching the active page table tree.
///
/// # Safety
///
/// `root` must point to a valid PML4 that maps the currently executing code
/// and stack, or the CPU will fault immediately after the switch.
#[inline]
pub unsafe fn write_cr3(root: PhysAddr) {
    // SAFETY: Caller guarantees the new root is valid.
    unsafe {
        asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
    }
}

/// Halts the CPU until the next interrupt.
#[inline]
pub fn hlt() {
    // SAFETY: `hlt` stops instruction execution until an interrupt; no
    // memory effects.
    unsafe {
        asm!("hlt", options(nomem, nostack, preserves_flags));
    }
}
